//! Observation-info extraction from raw file headers.

use std::collections::BTreeMap;
use std::io::Read;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::{debug, warn};

use obsingest_core::{
    Error, InstrumentDescriptor, ObservationInfo, ObservationProperty, PropertyRequirement, Result,
};

/// Translates raw file bytes into normalized observation metadata.
pub trait ObservationInfoExtractor: Send + Sync {
    /// Extract the requested properties. Missing required properties and
    /// malformed headers fail with [`Error::Extraction`].
    fn extract(
        &self,
        bytes: &[u8],
        instrument: &dyn InstrumentDescriptor,
        properties: &[PropertyRequirement],
    ) -> Result<ObservationInfo>;
}

const CARD_LEN: usize = 80;
const BLOCK_LEN: usize = 2880;

/// A parsed FITS header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl HeaderValue {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(rest) = raw.strip_prefix('\'') {
            return Some(Self::Str(parse_quoted(rest).trim_end().to_string()));
        }
        match raw {
            "T" => return Some(Self::Bool(true)),
            "F" => return Some(Self::Bool(false)),
            _ => {}
        }
        if let Ok(v) = raw.parse::<i64>() {
            return Some(Self::Int(v));
        }
        // FITS allows a 'D' exponent for double precision.
        if let Ok(v) = raw.replace(['D', 'd'], "E").parse::<f64>() {
            return Some(Self::Float(v));
        }
        Some(Self::Str(raw.to_string()))
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Str(s) => serde_json::Value::from(s.clone()),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Bool(v) => serde_json::Value::from(*v),
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Bool(_) => None,
        }
    }

    fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Str(s) => parse_fits_time(s),
            _ => None,
        }
    }
}

/// Body of a quoted FITS string (after the opening quote); `''` is a literal quote.
fn parse_quoted(rest: &str) -> String {
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                out.push('\'');
                chars.next();
            } else {
                break;
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a card's value field from its trailing `/ comment`, respecting quotes.
fn strip_comment(field: &str) -> &str {
    let mut in_quotes = false;
    for (i, c) in field.char_indices() {
        match c {
            '\'' => in_quotes = !in_quotes,
            '/' if !in_quotes => return &field[..i],
            _ => {}
        }
    }
    field
}

/// ISO-8601 timestamps as written in FITS headers; no zone means UTC.
pub fn parse_fits_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    let naive = s.trim_end_matches('Z');
    if let Ok(t) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(t.and_utc());
    }
    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

/// Parsed primary header: keyword → first value seen.
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    cards: BTreeMap<String, HeaderValue>,
}

impl FitsHeader {
    /// Parse 80-column header cards up to the `END` card.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cards = BTreeMap::new();
        for chunk in bytes.chunks(CARD_LEN) {
            let card = String::from_utf8_lossy(chunk);
            let keyword = card.get(..8.min(card.len())).unwrap_or("").trim_end();

            if keyword == "END" {
                debug!("Parsed FITS header with {} keywords", cards.len());
                return Ok(Self { cards });
            }
            if matches!(keyword, "" | "COMMENT" | "HISTORY") {
                continue;
            }

            let (key, field) = if keyword == "HIERARCH" {
                match card[8..].split_once('=') {
                    Some((k, v)) => (k.trim().to_string(), v),
                    None => continue,
                }
            } else if card.get(8..10) == Some("= ") {
                (keyword.to_string(), &card[10..])
            } else {
                continue;
            };

            if let Some(value) = HeaderValue::parse(strip_comment(field)) {
                cards.entry(key).or_insert(value);
            }
        }
        Err(Error::Extraction("header has no END card".into()))
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.cards.get(keyword)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Extractor for FITS primary headers using the instrument's header map.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitsHeaderExtractor;

impl FitsHeaderExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl ObservationInfoExtractor for FitsHeaderExtractor {
    fn extract(
        &self,
        bytes: &[u8],
        instrument: &dyn InstrumentDescriptor,
        properties: &[PropertyRequirement],
    ) -> Result<ObservationInfo> {
        let header = FitsHeader::parse(bytes)?;
        let mut info = ObservationInfo::default();

        for req in properties {
            let keyword = match instrument.header_map().get(&req.property) {
                Some(k) => k,
                None if req.required => {
                    return Err(Error::Extraction(format!(
                        "{} has no header keyword for required property '{}'",
                        instrument.name(),
                        req.property
                    )))
                }
                None => continue,
            };
            let value = match header.get(keyword) {
                Some(v) => v,
                None if req.required => {
                    return Err(Error::Extraction(format!(
                        "missing required header {} ({})",
                        keyword, req.property
                    )))
                }
                None => continue,
            };
            if !assign(&mut info, req.property, value) {
                let message = format!(
                    "header {} = {:?} is not a valid {}",
                    keyword, value, req.property
                );
                if req.required {
                    return Err(Error::Extraction(message));
                }
                warn!("{}; ignoring", message);
            }
        }

        for (field, keyword) in instrument.extra_headers() {
            if let Some(value) = header.get(&keyword) {
                info.extra.insert(field, value.to_json());
            }
        }

        if let Some(found) = &info.instrument {
            let matches = found.eq_ignore_ascii_case(instrument.name())
                || instrument
                    .aliases()
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(found));
            if !matches {
                return Err(Error::Extraction(format!(
                    "file was taken with {}, not {}",
                    found,
                    instrument.name()
                )));
            }
        }

        if let (Some(begin), Some(end)) = (info.datetime_begin, info.datetime_end) {
            if end < begin {
                return Err(Error::Extraction(format!(
                    "observation ends ({}) before it begins ({})",
                    end, begin
                )));
            }
        }

        Ok(info)
    }
}

/// Store `value` in the field for `property`. Returns false on a type mismatch.
fn assign(info: &mut ObservationInfo, property: ObservationProperty, value: &HeaderValue) -> bool {
    use ObservationProperty::*;
    match property {
        Instrument => set(&mut info.instrument, value.as_text()),
        DetectorNum => set(&mut info.detector_num, value.as_int()),
        DetectorName => set(&mut info.detector_name, value.as_text()),
        ExposureId => set(&mut info.exposure_id, value.as_int()),
        ObservationId => set(&mut info.observation_id, value.as_text()),
        DatetimeBegin => set(&mut info.datetime_begin, value.as_time()),
        DatetimeEnd => set(&mut info.datetime_end, value.as_time()),
        ExposureTime => set(
            &mut info.exposure_time,
            value.as_float().filter(|v| v.is_finite() && *v >= 0.0),
        ),
        PhysicalFilter => set(&mut info.physical_filter, value.as_text()),
        ObservationType => set(
            &mut info.observation_type,
            value.as_text().map(|s| s.to_lowercase()),
        ),
        GroupName => set(&mut info.group_name, value.as_text()),
        GroupId => set(&mut info.group_id, value.as_int()),
        ScienceProgram => set(&mut info.science_program, value.as_text()),
        TargetName => set(&mut info.target_name, value.as_text()),
        ObservationReason => set(&mut info.observation_reason, value.as_text()),
    }
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = Some(v);
            true
        }
        None => false,
    }
}

/// Read whole 2880-byte header blocks up to and including the one holding
/// the `END` card. Data units after it are left unread.
pub fn read_header<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(BLOCK_LEN);
    loop {
        let start = header.len();
        let n = reader.by_ref().take(BLOCK_LEN as u64).read_to_end(&mut header)?;
        if n == 0 {
            return Ok(header);
        }
        if header[start..].chunks(CARD_LEN).any(is_end_card) || n < BLOCK_LEN {
            return Ok(header);
        }
    }
}

fn is_end_card(card: &[u8]) -> bool {
    card.len() >= 8 && &card[..3] == b"END" && card[3..8].iter().all(|&b| b == b' ')
}

/// Render `KEY = value` pairs as a FITS header block, `END` card included.
///
/// String values must already carry their quotes.
pub fn render_header(cards: &[(&str, &str)]) -> Vec<u8> {
    let mut out = String::new();
    for (key, value) in cards {
        let card = if key.len() > 8 {
            format!("HIERARCH {} = {}", key, value)
        } else {
            format!("{:<8}= {}", key, value)
        };
        out.push_str(&format!("{:<80.80}", card));
    }
    out.push_str(&format!("{:<80}", "END"));
    while out.len() % BLOCK_LEN != 0 {
        out.push(' ');
    }
    out.into_bytes()
}
