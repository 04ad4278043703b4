//! Exposure record construction.

use obsingest_core::dimension::{DETECTOR, INSTRUMENT, PHYSICAL_FILTER};
use obsingest_core::{
    DimensionRef, Error, ExposureRecord, InstrumentDescriptor, NaturalKey, ObservationInfo, Result,
};

use crate::resolver::ResolvedDependencies;

/// Builds the exposure row for one observation from its resolved dependencies.
pub struct ExposureRecordBuilder;

impl ExposureRecordBuilder {
    /// Assemble and validate the exposure record.
    ///
    /// Every reference is derived from `info` and must appear in `resolved`;
    /// a mismatch or an extra that shadows a standard column is a
    /// [`Error::RecordBuild`], which points at a configuration defect rather
    /// than a bad file.
    pub fn build(
        info: &ObservationInfo,
        resolved: &ResolvedDependencies,
        descriptor: &dyn InstrumentDescriptor,
    ) -> Result<ExposureRecord> {
        let instrument = descriptor.name().to_string();
        let id = info
            .exposure_id
            .ok_or_else(|| Error::RecordBuild("observation has no exposure id".into()))?;
        let detector_num = info
            .detector_num
            .ok_or_else(|| Error::RecordBuild("observation has no detector number".into()))?;

        let instrument_key = NaturalKey::new().with(INSTRUMENT, instrument.as_str());
        let detector = DimensionRef::new(
            DETECTOR,
            instrument_key.clone().with(DETECTOR, detector_num),
        );

        let mut references = vec![
            DimensionRef::new(INSTRUMENT, instrument_key.clone()),
            detector.clone(),
        ];
        if let Some(filter) = &info.physical_filter {
            references.push(DimensionRef::new(
                PHYSICAL_FILTER,
                instrument_key.clone().with(PHYSICAL_FILTER, filter.as_str()),
            ));
        }
        for spec in descriptor.extra_dimensions() {
            // An optional dimension is skipped when its own key or any of its
            // requirements is missing.
            let expected = spec.required
                || (info.key_value_of(&spec.key_source).is_some()
                    && spec.requires.iter().all(|req| resolved.get(req).is_some()));
            match resolved.get(&spec.name) {
                Some(dep) => references.push(dep.record.reference()),
                None if expected => {
                    return Err(Error::RecordBuild(format!(
                        "no resolved {} record for this observation",
                        spec.name
                    )))
                }
                None => {}
            }
        }
        for reference in &references {
            if !resolved.contains(reference) {
                return Err(Error::RecordBuild(format!(
                    "reference {} is not among the resolved dependencies",
                    reference
                )));
            }
        }

        let extras = descriptor.build_exposure_extras(info)?;
        if let Some(clash) = extras
            .keys()
            .find(|k| ExposureRecord::STANDARD_COLUMNS.contains(&k.as_str()))
        {
            return Err(Error::RecordBuild(format!(
                "{} extra column '{}' shadows a standard column",
                instrument, clash
            )));
        }

        Ok(ExposureRecord {
            id,
            detector,
            obs_id: info.observation_id.clone(),
            physical_filter: info.physical_filter.clone(),
            observation_type: info.observation_type.clone(),
            datetime_begin: info.datetime_begin,
            datetime_end: info.effective_end(),
            exposure_time: info.exposure_time,
            day_obs: info.day_obs(descriptor.day_obs_offset_hours()),
            group_name: info.group_name.clone(),
            group_id: info.group_id,
            science_program: info.science_program.clone(),
            target_name: info.target_name.clone(),
            observation_reason: info.observation_reason.clone(),
            extras,
            references,
            instrument,
        })
    }
}
