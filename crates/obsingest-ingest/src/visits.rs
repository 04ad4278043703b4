//! Visit definition: grouping ingested exposures into visits.
//!
//! Runs after ingestion against committed exposure rows. Each visit is
//! written in its own transaction; a visit that already exists keeps its
//! original membership.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use obsingest_core::dimension::{INSTRUMENT, VISIT, VISIT_SYSTEM};
use obsingest_core::{
    DependencyRecord, DimensionRef, Error, ExposureRecord, KeyValue, NaturalKey, Result,
    VisitDefinitionConfig, VisitGrouping,
};
use obsingest_registry::RegistryClient;

/// Reason recorded when a visit's exposures disagree.
const VARIOUS: &str = "various";

/// One visit and the exposures it groups.
#[derive(Debug, Clone)]
pub struct VisitDefinitionData {
    pub instrument: String,
    pub id: i64,
    pub name: String,
    pub exposures: Vec<ExposureRecord>,
}

impl VisitDefinitionData {
    pub fn reference(&self) -> DimensionRef {
        DimensionRef::new(VISIT, visit_key(&self.instrument, self.id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitReport {
    pub visits_defined: usize,
    pub visits_existing: usize,
    pub exposures_skipped: usize,
}

/// Groups exposures into visits and writes visit records.
pub struct VisitDefiner<'a> {
    registry: &'a dyn RegistryClient,
    config: VisitDefinitionConfig,
}

impl<'a> VisitDefiner<'a> {
    pub fn new(registry: &'a dyn RegistryClient, config: VisitDefinitionConfig) -> Self {
        Self { registry, config }
    }

    /// Define visits for the given (instrument, exposure id) pairs.
    pub fn run(&self, exposures: &[(String, i64)]) -> Result<VisitReport> {
        if exposures.is_empty() {
            return Err(Error::Resolution("no exposures given for visit definition".into()));
        }
        let wanted: BTreeSet<&(String, i64)> = exposures.iter().collect();
        let instruments: BTreeSet<&str> = wanted.iter().map(|(i, _)| i.as_str()).collect();
        if instruments.len() > 1 {
            return Err(Error::Resolution(format!(
                "visit definition needs exposures from one instrument, got {:?}",
                instruments
            )));
        }

        let mut report = VisitReport::default();
        let mut records = Vec::with_capacity(wanted.len());
        for (instrument, id) in wanted {
            let record = self
                .registry
                .fetch_exposure(instrument, *id)?
                .ok_or_else(|| {
                    Error::Resolution(format!("exposure {}/{} is not registered", instrument, id))
                })?;
            if record.observation_type.as_deref() != Some("science") {
                if !self.config.ignore_non_science {
                    return Err(Error::Resolution(format!(
                        "exposure {}/{} is not a science observation",
                        instrument, id
                    )));
                }
                debug!("Skipping non-science exposure {}/{}", instrument, id);
                report.exposures_skipped += 1;
                continue;
            }
            records.push(record);
        }
        if records.is_empty() {
            warn!("No science exposures to define visits from");
            return Ok(report);
        }

        let definitions = self.group(records)?;
        let (system_id, system_name) = self.config.grouping.visit_system();
        info!(
            "Defining {} visit(s) with the {} visit system",
            definitions.len(),
            system_name
        );

        for def in &definitions {
            let system = visit_system_record(&def.instrument, system_id, system_name);
            let visit = visit_record(def, &system);
            let visit_ref = visit.reference();

            let tx = self.registry.begin()?;
            tx.insert_if_absent(&system)?;
            let outcome = tx.insert_if_absent(&visit)?;
            let existing = !outcome.inserted();
            if existing && outcome.record().fields != visit.fields {
                return Err(Error::ConflictingDefinition(format!(
                    "{} is already defined with different content",
                    visit_ref
                )));
            }
            for exposure in &def.exposures {
                let linked =
                    tx.insert_visit_definition(&visit_ref, &def.instrument, exposure.id)?;
                if existing && linked {
                    return Err(Error::ConflictingDefinition(format!(
                        "{} is already defined without exposure {}",
                        visit_ref, exposure.id
                    )));
                }
            }
            tx.commit()?;
            if existing {
                debug!("{} already defined; nothing to do", visit_ref);
                report.visits_existing += 1;
            } else {
                report.visits_defined += 1;
            }
        }

        info!(
            "Visits: {} defined, {} already present, {} exposure(s) skipped",
            report.visits_defined, report.visits_existing, report.exposures_skipped
        );
        Ok(report)
    }

    /// Partition exposures into visits.
    pub fn group(&self, exposures: Vec<ExposureRecord>) -> Result<Vec<VisitDefinitionData>> {
        match self.config.grouping {
            VisitGrouping::OneToOne => Ok(exposures
                .into_iter()
                .map(|e| VisitDefinitionData {
                    instrument: e.instrument.clone(),
                    id: e.id,
                    name: e.obs_id.clone().unwrap_or_else(|| e.id.to_string()),
                    exposures: vec![e],
                })
                .collect()),
            VisitGrouping::ByGroupMetadata => {
                let mut groups: BTreeMap<String, Vec<ExposureRecord>> = BTreeMap::new();
                for e in exposures {
                    let name = e.group_name.clone().ok_or_else(|| {
                        Error::Resolution(format!(
                            "exposure {}/{} has no group name",
                            e.instrument, e.id
                        ))
                    })?;
                    groups.entry(name).or_default().push(e);
                }
                groups
                    .into_iter()
                    .map(|(name, members)| {
                        let ids: BTreeSet<Option<i64>> =
                            members.iter().map(|e| e.group_id).collect();
                        let id = match ids.into_iter().collect::<Vec<_>>().as_slice() {
                            [Some(id)] => *id,
                            [None] => {
                                return Err(Error::Resolution(format!(
                                    "group {} has no group id",
                                    name
                                )))
                            }
                            _ => {
                                return Err(Error::RecordBuild(format!(
                                    "exposures in group {} disagree on the group id",
                                    name
                                )))
                            }
                        };
                        Ok(VisitDefinitionData {
                            instrument: members[0].instrument.clone(),
                            id,
                            name,
                            exposures: members,
                        })
                    })
                    .collect()
            }
        }
    }
}

fn visit_key(instrument: &str, id: i64) -> NaturalKey {
    NaturalKey::new().with(INSTRUMENT, instrument).with(VISIT, id)
}

fn instrument_ref(instrument: &str) -> DimensionRef {
    DimensionRef::new(INSTRUMENT, NaturalKey::new().with(INSTRUMENT, instrument))
}

fn visit_system_record(instrument: &str, id: i64, name: &str) -> DependencyRecord {
    let mut record = DependencyRecord::new(
        VISIT_SYSTEM,
        NaturalKey::new().with(INSTRUMENT, instrument).with(VISIT_SYSTEM, id),
    );
    record.requires.push(instrument_ref(instrument));
    record.fields.insert("name".into(), name.into());
    record
}

/// Visit record summarizing the member exposures.
pub fn visit_record(def: &VisitDefinitionData, system: &DependencyRecord) -> DependencyRecord {
    let exposures = &def.exposures;
    let begin: Option<DateTime<Utc>> = fold(exposures.iter().map(|e| e.datetime_begin), |a, b| {
        Some(a.min(b))
    });
    let end = fold(exposures.iter().map(|e| e.datetime_end), |a, b| Some(a.max(b)));
    let exposure_time = fold(exposures.iter().map(|e| e.exposure_time), |a, b| Some(a + b));
    let day_obs = fold(exposures.iter().map(|e| e.day_obs), |a, b| Some(a.min(b)));
    let filter = fold(exposures.iter().map(|e| e.physical_filter.clone()), same);
    let target = fold(exposures.iter().map(|e| e.target_name.clone()), same);
    let program = fold(exposures.iter().map(|e| e.science_program.clone()), same);
    let reason = fold(exposures.iter().map(|e| e.observation_reason.clone()), same)
        .unwrap_or_else(|| VARIOUS.to_string());

    let mut record = DependencyRecord::new(VISIT, visit_key(&def.instrument, def.id));
    record.requires = vec![instrument_ref(&def.instrument), system.reference()];

    let fields = &mut record.fields;
    fields.insert("name".into(), def.name.clone().into());
    let system_id = match system.key.get(VISIT_SYSTEM) {
        Some(KeyValue::Int(id)) => serde_json::Value::from(*id),
        _ => serde_json::Value::Null,
    };
    fields.insert("visit_system".into(), system_id);
    fields.insert("physical_filter".into(), filter.into());
    fields.insert("target_name".into(), target.into());
    fields.insert("science_program".into(), program.into());
    fields.insert("observation_reason".into(), reason.into());
    fields.insert("day_obs".into(), day_obs.into());
    fields.insert("exposure_time".into(), exposure_time.into());
    fields.insert("datetime_begin".into(), begin.map(|t| t.to_rfc3339()).into());
    fields.insert("datetime_end".into(), end.map(|t| t.to_rfc3339()).into());
    record
}

/// Combine values pairwise; `None` if any value is missing or `combine` gives up.
fn fold<T>(
    values: impl IntoIterator<Item = Option<T>>,
    combine: impl Fn(T, T) -> Option<T>,
) -> Option<T> {
    let mut values = values.into_iter();
    let mut acc = values.next()??;
    for v in values {
        acc = combine(acc, v?)?;
    }
    Some(acc)
}

fn same<T: PartialEq>(a: T, b: T) -> Option<T> {
    (a == b).then_some(a)
}
