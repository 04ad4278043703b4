//! SQLite-backed registry with enforced foreign keys.
//!
//! One connection guarded by a mutex; each transaction holds the lock from
//! `BEGIN IMMEDIATE` until commit or rollback, so writers inside one process
//! are serialized and other processes wait on the busy timeout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{ffi, params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{ExposureInsert, RegistryClient, RegistryTransaction, SyncOutcome};
use crate::schema::SCHEMA_SQL;
use obsingest_core::dimension::DETECTOR;
use obsingest_core::{
    DependencyRecord, DimensionRef, Error, ExposureRecord, NaturalKey, RawDatasetAssociation,
    Result,
};

const DB_FILE: &str = "registry.sqlite3";

/// SQLite registry.
///
/// Do not call the registry's own read methods from a thread that holds one
/// of its open transactions; use the transaction's methods instead.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// Row counts, for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub dimension_records: BTreeMap<String, i64>,
    pub exposures: i64,
    pub raw_datasets: i64,
    pub visit_definitions: i64,
}

impl SqliteRegistry {
    /// Open or create the registry. The file will be `db_dir/registry.sqlite3`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir)?;
        let db_path = db_dir.join(DB_FILE);

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let registry = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        let stats = registry.get_stats()?;
        info!(
            "SqliteRegistry opened: {} exposures, {} raw datasets, path={}",
            stats.exposures,
            stats.raw_datasets,
            registry.db_path.display()
        );

        Ok(registry)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 10000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn count_dimension_records(&self, dimension: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM dimension_record WHERE dimension = ?1",
            params![dimension],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(e.to_string()))
    }

    pub fn count_exposures(&self) -> Result<i64> {
        count_rows(&self.conn.lock(), "exposure")
    }

    pub fn count_datasets(&self) -> Result<i64> {
        count_rows(&self.conn.lock(), "raw_dataset")
    }

    /// Raw datasets registered for one exposure, ordered by detector key.
    pub fn datasets_for_exposure(
        &self,
        instrument: &str,
        exposure_id: i64,
    ) -> Result<Vec<RawDatasetAssociation>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT dataset_id, detector_dimension, detector_key_json, location, checksum, \
                 ingested_at FROM raw_dataset WHERE instrument = ?1 AND exposure_id = ?2 \
                 ORDER BY detector_key_json",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![instrument, exposure_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut datasets = Vec::new();
        for row in rows {
            let (dataset_id, dimension, key_json, location, checksum, ingested_at) =
                row.map_err(|e| Error::Database(e.to_string()))?;
            datasets.push(RawDatasetAssociation {
                dataset_id,
                instrument: instrument.to_string(),
                exposure_id,
                detector: DimensionRef::new(dimension, decode_key(&key_json)?),
                location,
                checksum,
                ingested_at: parse_time(&ingested_at)?,
            });
        }
        Ok(datasets)
    }

    /// Exposure ids linked to a visit.
    pub fn visit_exposures(&self, visit: &DimensionRef) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT exposure_id FROM visit_definition \
                 WHERE visit_dimension = ?1 AND visit_key_json = ?2 ORDER BY exposure_id",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![visit.dimension, visit.key.encode()], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub fn get_stats(&self) -> Result<RegistryStats> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT dimension, COUNT(*) FROM dimension_record GROUP BY dimension")
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| Error::Database(e.to_string()))?;
        let dimension_records = rows
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .map_err(|e| Error::Database(e.to_string()))?;
        drop(stmt);

        Ok(RegistryStats {
            dimension_records,
            exposures: count_rows(&conn, "exposure")?,
            raw_datasets: count_rows(&conn, "raw_dataset")?,
            visit_definitions: count_rows(&conn, "visit_definition")?,
        })
    }
}

impl RegistryClient for SqliteRegistry {
    fn begin(&self) -> Result<Box<dyn RegistryTransaction + '_>> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| Error::Database(format!("begin transaction: {}", e)))?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }

    fn exists(&self, dimension: &str, key: &NaturalKey) -> Result<bool> {
        dependency_exists(&self.conn.lock(), dimension, key)
    }

    fn fetch_dependency(
        &self,
        dimension: &str,
        key: &NaturalKey,
    ) -> Result<Option<DependencyRecord>> {
        fetch_dependency(&self.conn.lock(), dimension, key)
    }

    fn fetch_exposure(&self, instrument: &str, id: i64) -> Result<Option<ExposureRecord>> {
        fetch_exposure(&self.conn.lock(), instrument, id)
    }
}

/// Open transaction on a [`SqliteRegistry`]. Rolls back on drop unless committed.
pub struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl RegistryTransaction for SqliteTransaction<'_> {
    fn exists(&self, dimension: &str, key: &NaturalKey) -> Result<bool> {
        dependency_exists(&self.conn, dimension, key)
    }

    fn fetch_dependency(
        &self,
        dimension: &str,
        key: &NaturalKey,
    ) -> Result<Option<DependencyRecord>> {
        fetch_dependency(&self.conn, dimension, key)
    }

    fn insert_if_absent(&self, record: &DependencyRecord) -> Result<SyncOutcome> {
        let key_json = record.key.encode();
        let fields_json = serde_json::to_string(&record.fields)?;
        let changed = self
            .conn
            .prepare_cached(
                "INSERT INTO dimension_record (dimension, key_json, fields_json, created_at) \
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT (dimension, key_json) DO NOTHING",
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .execute(params![record.dimension, key_json, fields_json, now_millis()])
            .map_err(|e| Error::Database(e.to_string()))?;

        if changed == 0 {
            let existing = fetch_dependency(&self.conn, &record.dimension, &record.key)?
                .ok_or_else(|| {
                    Error::Internal(format!("{} vanished after conflict", record.reference()))
                })?;
            return Ok(SyncOutcome::Existing(existing));
        }

        for required in &record.requires {
            self.conn
                .prepare_cached(
                    "INSERT INTO dimension_requirement \
                     (dimension, key_json, required_dimension, required_key_json) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(|e| Error::Database(e.to_string()))?
                .execute(params![
                    record.dimension,
                    key_json,
                    required.dimension,
                    required.key.encode()
                ])
                .map_err(|e| {
                    write_error(e, || {
                        format!("{} requires missing {}", record.reference(), required)
                    })
                })?;
        }

        debug!("Inserted dimension record {}", record.reference());
        Ok(SyncOutcome::Inserted(record.clone()))
    }

    fn dataset_exists(
        &self,
        instrument: &str,
        exposure_id: i64,
        detector: &DimensionRef,
    ) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .prepare_cached(
                "SELECT 1 FROM raw_dataset \
                 WHERE instrument = ?1 AND exposure_id = ?2 AND detector_key_json = ?3",
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![instrument, exposure_id, detector.key.encode()], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(found.is_some())
    }

    fn insert_exposure(&self, record: &ExposureRecord) -> Result<ExposureInsert> {
        let outcome = match fetch_exposure(&self.conn, &record.instrument, record.id)? {
            Some(existing) => {
                if !existing.same_exposure_as(record) {
                    return Err(Error::ConflictingDefinition(format!(
                        "exposure {}/{} is already registered with different metadata",
                        record.instrument, record.id
                    )));
                }
                ExposureInsert::Existing
            }
            None => {
                self.conn
                    .prepare_cached(
                        "INSERT INTO exposure (instrument, id, obs_id, physical_filter, \
                         observation_type, datetime_begin, datetime_end, exposure_time, day_obs, \
                         group_name, group_id, science_program, target_name, observation_reason, \
                         extras_json, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    )
                    .map_err(|e| Error::Database(e.to_string()))?
                    .execute(params![
                        record.instrument,
                        record.id,
                        record.obs_id,
                        record.physical_filter,
                        record.observation_type,
                        record.datetime_begin.map(|t| t.to_rfc3339()),
                        record.datetime_end.map(|t| t.to_rfc3339()),
                        record.exposure_time,
                        record.day_obs,
                        record.group_name,
                        record.group_id,
                        record.science_program,
                        record.target_name,
                        record.observation_reason,
                        serde_json::to_string(&record.extras)?,
                        now_millis(),
                    ])
                    .map_err(|e| {
                        write_error(e, || format!("exposure {}/{}", record.instrument, record.id))
                    })?;
                ExposureInsert::Inserted
            }
        };

        for reference in &record.references {
            self.conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO exposure_reference \
                     (instrument, exposure_id, dimension, key_json) VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(|e| Error::Database(e.to_string()))?
                .execute(params![
                    record.instrument,
                    record.id,
                    reference.dimension,
                    reference.key.encode()
                ])
                .map_err(|e| {
                    write_error(e, || {
                        format!(
                            "exposure {}/{} references missing {}",
                            record.instrument, record.id, reference
                        )
                    })
                })?;
        }

        Ok(outcome)
    }

    fn associate_dataset(&self, association: &RawDatasetAssociation) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO raw_dataset (dataset_id, instrument, exposure_id, detector_dimension, \
                 detector_key_json, location, checksum, ingested_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .execute(params![
                association.dataset_id,
                association.instrument,
                association.exposure_id,
                association.detector.dimension,
                association.detector.key.encode(),
                association.location,
                association.checksum,
                association.ingested_at.to_rfc3339(),
            ])
            .map_err(|e| {
                write_error(e, || {
                    format!(
                        "raw dataset {}/{} {}",
                        association.instrument, association.exposure_id, association.detector
                    )
                })
            })?;
        Ok(())
    }

    fn insert_visit_definition(
        &self,
        visit: &DimensionRef,
        instrument: &str,
        exposure_id: i64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .prepare_cached(
                "INSERT OR IGNORE INTO visit_definition \
                 (visit_dimension, visit_key_json, instrument, exposure_id) VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .execute(params![visit.dimension, visit.key.encode(), instrument, exposure_id])
            .map_err(|e| {
                write_error(e, || {
                    format!("visit definition {} -> {}/{}", visit, instrument, exposure_id)
                })
            })?;
        Ok(changed > 0)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK")
    }
}

impl SqliteTransaction<'_> {
    /// Only a successful COMMIT or ROLLBACK ends the transaction; on failure
    /// Drop still rolls back.
    fn finish(&mut self, statement: &str) -> Result<()> {
        self.conn
            .execute_batch(statement)
            .map_err(|e| Error::Database(format!("{}: {}", statement.to_lowercase(), e)))?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.conn.execute_batch("ROLLBACK") {
            Ok(()) => debug!("Rolled back unfinished registry transaction"),
            Err(e) => warn!("Rollback of unfinished registry transaction failed: {}", e),
        }
    }
}

// ---------------------------------------------------------------
// Queries shared by the registry and its transactions
// ---------------------------------------------------------------

fn dependency_exists(conn: &Connection, dimension: &str, key: &NaturalKey) -> Result<bool> {
    let found: Option<i64> = conn
        .prepare_cached("SELECT 1 FROM dimension_record WHERE dimension = ?1 AND key_json = ?2")
        .map_err(|e| Error::Database(e.to_string()))?
        .query_row(params![dimension, key.encode()], |row| row.get(0))
        .optional()
        .map_err(|e| Error::Database(e.to_string()))?;
    Ok(found.is_some())
}

fn fetch_dependency(
    conn: &Connection,
    dimension: &str,
    key: &NaturalKey,
) -> Result<Option<DependencyRecord>> {
    let key_json = key.encode();
    let fields_json: Option<String> = conn
        .prepare_cached(
            "SELECT fields_json FROM dimension_record WHERE dimension = ?1 AND key_json = ?2",
        )
        .map_err(|e| Error::Database(e.to_string()))?
        .query_row(params![dimension, key_json], |row| row.get(0))
        .optional()
        .map_err(|e| Error::Database(e.to_string()))?;
    let fields_json = match fields_json {
        Some(f) => f,
        None => return Ok(None),
    };

    let mut stmt = conn
        .prepare_cached(
            "SELECT required_dimension, required_key_json FROM dimension_requirement \
             WHERE dimension = ?1 AND key_json = ?2 ORDER BY required_dimension",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
    let rows = stmt
        .query_map(params![dimension, key_json], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| Error::Database(e.to_string()))?;
    let mut requires = Vec::new();
    for row in rows {
        let (dim, req_key) = row.map_err(|e| Error::Database(e.to_string()))?;
        requires.push(DimensionRef::new(dim, decode_key(&req_key)?));
    }

    Ok(Some(DependencyRecord {
        dimension: dimension.to_string(),
        key: key.clone(),
        requires,
        fields: serde_json::from_str(&fields_json)?,
    }))
}

struct ExposureRow {
    obs_id: Option<String>,
    physical_filter: Option<String>,
    observation_type: Option<String>,
    datetime_begin: Option<String>,
    datetime_end: Option<String>,
    exposure_time: Option<f64>,
    day_obs: Option<i64>,
    group_name: Option<String>,
    group_id: Option<i64>,
    science_program: Option<String>,
    target_name: Option<String>,
    observation_reason: Option<String>,
    extras_json: String,
}

/// Fetch an exposure row with its references.
///
/// The returned `detector` is the lowest detector registered for the exposure.
fn fetch_exposure(conn: &Connection, instrument: &str, id: i64) -> Result<Option<ExposureRecord>> {
    let row = conn
        .prepare_cached(
            "SELECT obs_id, physical_filter, observation_type, datetime_begin, datetime_end, \
             exposure_time, day_obs, group_name, group_id, science_program, target_name, \
             observation_reason, extras_json FROM exposure WHERE instrument = ?1 AND id = ?2",
        )
        .map_err(|e| Error::Database(e.to_string()))?
        .query_row(params![instrument, id], |row| {
            Ok(ExposureRow {
                obs_id: row.get(0)?,
                physical_filter: row.get(1)?,
                observation_type: row.get(2)?,
                datetime_begin: row.get(3)?,
                datetime_end: row.get(4)?,
                exposure_time: row.get(5)?,
                day_obs: row.get(6)?,
                group_name: row.get(7)?,
                group_id: row.get(8)?,
                science_program: row.get(9)?,
                target_name: row.get(10)?,
                observation_reason: row.get(11)?,
                extras_json: row.get(12)?,
            })
        })
        .optional()
        .map_err(|e| Error::Database(e.to_string()))?;
    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let references = exposure_references(conn, instrument, id)?;
    let detector = references
        .iter()
        .filter(|r| r.dimension == DETECTOR)
        .min()
        .cloned()
        .ok_or_else(|| {
            Error::Internal(format!("exposure {}/{} has no detector reference", instrument, id))
        })?;

    Ok(Some(ExposureRecord {
        instrument: instrument.to_string(),
        id,
        detector,
        obs_id: row.obs_id,
        physical_filter: row.physical_filter,
        observation_type: row.observation_type,
        datetime_begin: row.datetime_begin.as_deref().map(parse_time).transpose()?,
        datetime_end: row.datetime_end.as_deref().map(parse_time).transpose()?,
        exposure_time: row.exposure_time,
        day_obs: row.day_obs,
        group_name: row.group_name,
        group_id: row.group_id,
        science_program: row.science_program,
        target_name: row.target_name,
        observation_reason: row.observation_reason,
        extras: serde_json::from_str(&row.extras_json)?,
        references,
    }))
}

fn exposure_references(conn: &Connection, instrument: &str, id: i64) -> Result<Vec<DimensionRef>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT dimension, key_json FROM exposure_reference \
             WHERE instrument = ?1 AND exposure_id = ?2 ORDER BY dimension, key_json",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
    let rows = stmt
        .query_map(params![instrument, id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| Error::Database(e.to_string()))?;
    let mut references = Vec::new();
    for row in rows {
        let (dimension, key_json) = row.map_err(|e| Error::Database(e.to_string()))?;
        references.push(DimensionRef::new(dimension, decode_key(&key_json)?));
    }
    Ok(references)
}

fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .map_err(|e| Error::Database(e.to_string()))
}

/// Classify a failed write: constraint failures become domain errors.
fn write_error(e: rusqlite::Error, context: impl FnOnce() -> String) -> Error {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        match err.extended_code {
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return Error::ForeignKeyViolation(context()),
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                return Error::DuplicateExposure(context())
            }
            _ => {}
        }
    }
    Error::Database(format!("{}: {}", context(), e))
}

fn decode_key(key_json: &str) -> Result<NaturalKey> {
    NaturalKey::decode(key_json)
        .map_err(|e| Error::Database(format!("corrupt natural key {}: {}", key_json, e)))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("corrupt timestamp {}: {}", s, e)))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsingest_core::dimension::{INSTRUMENT, VISIT};
    use tempfile::TempDir;

    fn test_registry() -> (SqliteRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let registry = SqliteRegistry::open(dir.path()).unwrap();
        (registry, dir)
    }

    fn instrument_record(name: &str) -> DependencyRecord {
        let mut record = DependencyRecord::new(INSTRUMENT, NaturalKey::new().with(INSTRUMENT, name));
        record.fields.insert("name".into(), serde_json::json!(name));
        record
    }

    fn detector_record(instrument: &str, detector: i64) -> DependencyRecord {
        let mut record = DependencyRecord::new(
            DETECTOR,
            NaturalKey::new().with(INSTRUMENT, instrument).with(DETECTOR, detector),
        );
        record.requires.push(instrument_record(instrument).reference());
        record
    }

    fn exposure(instrument: &str, id: i64, detector: i64) -> ExposureRecord {
        let detector = detector_record(instrument, detector).reference();
        ExposureRecord {
            instrument: instrument.into(),
            id,
            detector: detector.clone(),
            obs_id: Some(format!("OBS_{}", id)),
            physical_filter: None,
            observation_type: Some("science".into()),
            datetime_begin: Some(Utc::now()),
            datetime_end: None,
            exposure_time: Some(15.0),
            day_obs: Some(20240101),
            group_name: None,
            group_id: None,
            science_program: None,
            target_name: None,
            observation_reason: None,
            extras: Default::default(),
            references: vec![instrument_record(instrument).reference(), detector],
        }
    }

    #[test]
    fn test_insert_if_absent_keeps_first_writer() {
        let (registry, _dir) = test_registry();
        let tx = registry.begin().unwrap();
        assert!(tx.insert_if_absent(&instrument_record("X")).unwrap().inserted());

        let mut changed = instrument_record("X");
        changed.fields.insert("name".into(), serde_json::json!("other"));
        let outcome = tx.insert_if_absent(&changed).unwrap();
        assert!(!outcome.inserted());
        assert_eq!(outcome.record().fields["name"], "X");
        tx.commit().unwrap();

        assert_eq!(registry.count_dimension_records(INSTRUMENT).unwrap(), 1);
    }

    #[test]
    fn test_requirement_must_exist() {
        let (registry, _dir) = test_registry();
        let tx = registry.begin().unwrap();
        let err = tx.insert_if_absent(&detector_record("X", 1)).unwrap_err();
        assert!(matches!(err, Error::ForeignKeyViolation(_)));
    }

    #[test]
    fn test_exposure_requires_references() {
        let (registry, _dir) = test_registry();
        let tx = registry.begin().unwrap();
        tx.insert_if_absent(&instrument_record("X")).unwrap();
        let err = tx.insert_exposure(&exposure("X", 1001, 1)).unwrap_err();
        assert!(matches!(err, Error::ForeignKeyViolation(_)));
    }

    #[test]
    fn test_drop_rolls_back() {
        let (registry, _dir) = test_registry();
        {
            let tx = registry.begin().unwrap();
            tx.insert_if_absent(&instrument_record("X")).unwrap();
            tx.insert_if_absent(&detector_record("X", 1)).unwrap();
        }
        assert_eq!(registry.count_dimension_records(INSTRUMENT).unwrap(), 0);
        assert_eq!(registry.count_dimension_records(DETECTOR).unwrap(), 0);
    }

    #[test]
    fn test_failed_rollback_leaves_transaction_open() {
        let (registry, _dir) = test_registry();
        {
            // No BEGIN, so ROLLBACK has nothing to end.
            let mut tx = SqliteTransaction {
                conn: registry.conn.lock(),
                finished: false,
            };
            assert!(matches!(tx.finish("ROLLBACK"), Err(Error::Database(_))));
            assert!(!tx.finished);
        }

        let tx = registry.begin().unwrap();
        tx.insert_if_absent(&instrument_record("X")).unwrap();
        tx.rollback().unwrap();
        assert_eq!(registry.count_dimension_records(INSTRUMENT).unwrap(), 0);
        registry.begin().unwrap().commit().unwrap();
    }

    #[test]
    fn test_exposure_roundtrip_and_conflict() {
        let (registry, _dir) = test_registry();
        let record = exposure("X", 1001, 1);
        let tx = registry.begin().unwrap();
        tx.insert_if_absent(&instrument_record("X")).unwrap();
        tx.insert_if_absent(&detector_record("X", 1)).unwrap();
        tx.insert_if_absent(&detector_record("X", 2)).unwrap();
        assert_eq!(tx.insert_exposure(&record).unwrap(), ExposureInsert::Inserted);

        // Same exposure seen from another detector.
        let other_detector = {
            let mut r = record.clone();
            r.detector = detector_record("X", 2).reference();
            r.references[1] = r.detector.clone();
            r
        };
        assert_eq!(tx.insert_exposure(&other_detector).unwrap(), ExposureInsert::Existing);

        let mut conflicting = record.clone();
        conflicting.exposure_time = Some(30.0);
        assert!(matches!(
            tx.insert_exposure(&conflicting),
            Err(Error::ConflictingDefinition(_))
        ));
        let mut retargeted = other_detector.clone();
        retargeted.target_name = Some("M31".into());
        assert!(matches!(
            tx.insert_exposure(&retargeted),
            Err(Error::ConflictingDefinition(_))
        ));
        tx.commit().unwrap();

        let fetched = registry.fetch_exposure("X", 1001).unwrap().unwrap();
        assert_eq!(fetched.detector_num(), Some(1));
        assert_eq!(fetched.datetime_begin, record.datetime_begin);
        assert_eq!(fetched.references.len(), 3);
    }

    #[test]
    fn test_dataset_association_is_unique() {
        let (registry, _dir) = test_registry();
        let record = exposure("X", 1001, 1);
        let association = RawDatasetAssociation {
            dataset_id: "a".into(),
            instrument: "X".into(),
            exposure_id: 1001,
            detector: record.detector.clone(),
            location: "/data/raw_1001_1.fits".into(),
            checksum: None,
            ingested_at: Utc::now(),
        };

        let tx = registry.begin().unwrap();
        tx.insert_if_absent(&instrument_record("X")).unwrap();
        tx.insert_if_absent(&detector_record("X", 1)).unwrap();
        tx.insert_exposure(&record).unwrap();
        tx.associate_dataset(&association).unwrap();
        assert!(tx.dataset_exists("X", 1001, &record.detector).unwrap());

        let again = RawDatasetAssociation {
            dataset_id: "b".into(),
            ..association
        };
        assert!(matches!(
            tx.associate_dataset(&again),
            Err(Error::DuplicateExposure(_))
        ));
        tx.commit().unwrap();

        let datasets = registry.datasets_for_exposure("X", 1001).unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].dataset_id, "a");
    }

    #[test]
    fn test_visit_definition_links() {
        let (registry, _dir) = test_registry();
        let record = exposure("X", 1001, 1);
        let mut visit = DependencyRecord::new(VISIT, NaturalKey::new().with(INSTRUMENT, "X").with(VISIT, 1001));
        visit.requires.push(instrument_record("X").reference());

        let tx = registry.begin().unwrap();
        tx.insert_if_absent(&instrument_record("X")).unwrap();
        tx.insert_if_absent(&detector_record("X", 1)).unwrap();
        tx.insert_exposure(&record).unwrap();
        tx.insert_if_absent(&visit).unwrap();
        assert!(tx.insert_visit_definition(&visit.reference(), "X", 1001).unwrap());
        assert!(!tx.insert_visit_definition(&visit.reference(), "X", 1001).unwrap());
        tx.commit().unwrap();

        assert_eq!(registry.visit_exposures(&visit.reference()).unwrap(), vec![1001]);
        let stats = registry.get_stats().unwrap();
        assert_eq!(stats.visit_definitions, 1);
        assert_eq!(stats.dimension_records[VISIT], 1);
    }
}
