//! Registry schema SQL.
//!
//! Dimension records of every kind share one table keyed by
//! (dimension, canonical natural key), so instrument-defined dimensions need
//! no DDL. All cross-record links are real foreign keys into it.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS dimension_record (
    dimension TEXT NOT NULL,
    key_json TEXT NOT NULL,
    fields_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (dimension, key_json)
);

CREATE TABLE IF NOT EXISTS dimension_requirement (
    dimension TEXT NOT NULL,
    key_json TEXT NOT NULL,
    required_dimension TEXT NOT NULL,
    required_key_json TEXT NOT NULL,
    PRIMARY KEY (dimension, key_json, required_dimension),
    FOREIGN KEY (dimension, key_json)
        REFERENCES dimension_record(dimension, key_json) ON DELETE CASCADE,
    FOREIGN KEY (required_dimension, required_key_json)
        REFERENCES dimension_record(dimension, key_json)
);

CREATE TABLE IF NOT EXISTS exposure (
    instrument TEXT NOT NULL,
    id INTEGER NOT NULL,
    obs_id TEXT,
    physical_filter TEXT,
    observation_type TEXT,
    datetime_begin TEXT,
    datetime_end TEXT,
    exposure_time REAL,
    day_obs INTEGER,
    group_name TEXT,
    group_id INTEGER,
    science_program TEXT,
    target_name TEXT,
    observation_reason TEXT,
    extras_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (instrument, id)
);

CREATE TABLE IF NOT EXISTS exposure_reference (
    instrument TEXT NOT NULL,
    exposure_id INTEGER NOT NULL,
    dimension TEXT NOT NULL,
    key_json TEXT NOT NULL,
    PRIMARY KEY (instrument, exposure_id, dimension, key_json),
    FOREIGN KEY (instrument, exposure_id)
        REFERENCES exposure(instrument, id) ON DELETE CASCADE,
    FOREIGN KEY (dimension, key_json)
        REFERENCES dimension_record(dimension, key_json)
);

CREATE TABLE IF NOT EXISTS raw_dataset (
    dataset_id TEXT PRIMARY KEY,
    instrument TEXT NOT NULL,
    exposure_id INTEGER NOT NULL,
    detector_dimension TEXT NOT NULL,
    detector_key_json TEXT NOT NULL,
    location TEXT NOT NULL,
    checksum TEXT,
    ingested_at TEXT NOT NULL,
    UNIQUE (instrument, exposure_id, detector_key_json),
    FOREIGN KEY (instrument, exposure_id)
        REFERENCES exposure(instrument, id),
    FOREIGN KEY (detector_dimension, detector_key_json)
        REFERENCES dimension_record(dimension, key_json)
);

CREATE TABLE IF NOT EXISTS visit_definition (
    visit_dimension TEXT NOT NULL,
    visit_key_json TEXT NOT NULL,
    instrument TEXT NOT NULL,
    exposure_id INTEGER NOT NULL,
    PRIMARY KEY (visit_key_json, instrument, exposure_id),
    FOREIGN KEY (visit_dimension, visit_key_json)
        REFERENCES dimension_record(dimension, key_json),
    FOREIGN KEY (instrument, exposure_id)
        REFERENCES exposure(instrument, id)
);

CREATE INDEX IF NOT EXISTS idx_requirement_target
    ON dimension_requirement(required_dimension, required_key_json);
CREATE INDEX IF NOT EXISTS idx_reference_target ON exposure_reference(dimension, key_json);
CREATE INDEX IF NOT EXISTS idx_raw_dataset_exposure ON raw_dataset(instrument, exposure_id);
CREATE INDEX IF NOT EXISTS idx_raw_dataset_location ON raw_dataset(location);
"#;
