//! SQLite-backed document store.
//!
//! Identities, their per-family reference vectors and attendance live in
//! four tables. Roles are kept as raw JSON text so malformed historical
//! values survive until normalized or repaired. Embeddings are little-endian
//! f32 blobs with an explicit dimension column.

use chrono::NaiveDate;
use rollcall_core::attendance::{format_day, parse_day, AttendanceRecord};
use rollcall_core::store::{IdentityDocument, Store, StoreError};
use rollcall_core::{Embedding, EmbeddingFamily, RawRole, Role, RollNumber};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS identities (
    roll        TEXT PRIMARY KEY,
    id          INTEGER NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    father_name TEXT NOT NULL DEFAULT '',
    phone       TEXT NOT NULL DEFAULT '',
    role        TEXT,
    thumbnail   BLOB
);
CREATE INDEX IF NOT EXISTS idx_identities_name ON identities(name);

CREATE TABLE IF NOT EXISTS embeddings (
    roll          TEXT NOT NULL REFERENCES identities(roll) ON DELETE CASCADE,
    family        TEXT NOT NULL,
    dimension     INTEGER NOT NULL,
    vector        BLOB NOT NULL,
    model_version TEXT,
    PRIMARY KEY (roll, family)
);

CREATE TABLE IF NOT EXISTS attendance_records (
    roll        TEXT PRIMARY KEY,
    identity_id INTEGER
);

CREATE TABLE IF NOT EXISTS attendance_days (
    roll    TEXT NOT NULL REFERENCES attendance_records(roll) ON DELETE CASCADE,
    day     TEXT NOT NULL,
    present INTEGER NOT NULL,
    PRIMARY KEY (roll, day)
);
";

const IDENTITY_COLUMNS: &str = "id, roll, name, father_name, phone, role, thumbnail";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Corrupt { key, reason } => StoreError::Corrupt { key, reason },
            other => StoreError::Backend(Box::new(other)),
        }
    }
}

fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> DbError {
    DbError::Corrupt {
        key: key.into(),
        reason: reason.into(),
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "database opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct IdentityRow {
    id: i64,
    roll: String,
    name: String,
    father_name: String,
    phone: String,
    role: Option<String>,
    thumbnail: Option<Vec<u8>>,
}

fn read_identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        id: row.get(0)?,
        roll: row.get(1)?,
        name: row.get(2)?,
        father_name: row.get(3)?,
        phone: row.get(4)?,
        role: row.get(5)?,
        thumbnail: row.get(6)?,
    })
}

/// JSON when it parses, otherwise the bare text as a string role.
fn decode_role(text: Option<String>) -> RawRole {
    match text {
        None => RawRole::Absent,
        Some(t) => match serde_json::from_str(&t) {
            Ok(value) => RawRole::from_value(Some(value)),
            Err(_) => RawRole::Text(t),
        },
    }
}

fn encode_role(role: &RawRole) -> Option<String> {
    role.to_value().map(|v| v.to_string())
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn decode_vector(blob: &[u8], dimension: i64) -> Result<Vec<f32>, String> {
    let expected = usize::try_from(dimension)
        .ok()
        .and_then(|d| d.checked_mul(std::mem::size_of::<f32>()))
        .ok_or_else(|| format!("invalid dimension {dimension}"))?;
    if blob.len() != expected {
        return Err(format!("expected {expected} bytes, got {}", blob.len()));
    }

    let values: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err("non-finite value".into());
    }
    Ok(values)
}

fn parse_family(s: &str) -> Option<EmbeddingFamily> {
    EmbeddingFamily::ALL.into_iter().find(|f| f.as_str() == s)
}

fn to_id(id: u64) -> Result<i64, DbError> {
    i64::try_from(id).map_err(|_| corrupt(id.to_string(), "id out of range"))
}

fn from_id(key: &str, id: i64) -> Result<u64, DbError> {
    u64::try_from(id).map_err(|_| corrupt(key, format!("negative id {id}")))
}

fn parse_roll(text: &str) -> Result<RollNumber, DbError> {
    RollNumber::new(text).map_err(|e| corrupt(text, e.to_string()))
}

type EmbeddingMap = BTreeMap<EmbeddingFamily, Embedding>;

/// Reference vectors grouped by roll. Unreadable rows are logged and left out,
/// which the index then reports as a missing reference.
fn load_embeddings(
    conn: &Connection,
    roll: Option<&str>,
) -> Result<BTreeMap<String, EmbeddingMap>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT roll, family, dimension, vector, model_version FROM embeddings
         WHERE ?1 IS NULL OR roll = ?1",
    )?;
    let rows = stmt.query_map(params![roll], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut out: BTreeMap<String, EmbeddingMap> = BTreeMap::new();
    for row in rows {
        let (roll, family, dimension, blob, model_version) = row?;
        let Some(family_key) = parse_family(&family) else {
            tracing::warn!(roll = %roll, family = %family, "ignoring embedding of unknown family");
            continue;
        };
        match decode_vector(&blob, dimension) {
            Ok(values) => {
                out.entry(roll).or_default().insert(
                    family_key,
                    Embedding {
                        values,
                        model_version,
                    },
                );
            }
            Err(reason) => {
                tracing::error!(
                    roll = %roll,
                    family = %family,
                    %reason,
                    "unreadable stored embedding"
                );
            }
        }
    }
    Ok(out)
}

fn into_document(row: IdentityRow, embeddings: EmbeddingMap) -> Result<IdentityDocument, DbError> {
    Ok(IdentityDocument {
        id: from_id(&row.roll, row.id)?,
        roll: parse_roll(&row.roll)?,
        name: row.name,
        father_name: row.father_name,
        phone: row.phone,
        role: decode_role(row.role),
        embeddings,
        thumbnail: row.thumbnail,
    })
}

fn find_where(
    conn: &Connection,
    clause: &str,
    key: &str,
) -> Result<Option<IdentityDocument>, DbError> {
    let sql =
        format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE {clause} ORDER BY id LIMIT 1");
    let row = conn.query_row(&sql, params![key], read_identity_row).optional()?;

    match row {
        None => Ok(None),
        Some(row) => {
            let embeddings = load_embeddings(conn, Some(&row.roll))?
                .remove(&row.roll)
                .unwrap_or_default();
            into_document(row, embeddings).map(Some)
        }
    }
}

type DaysByRoll = BTreeMap<String, BTreeMap<NaiveDate, bool>>;

fn load_days(conn: &Connection, roll: Option<&str>) -> Result<DaysByRoll, DbError> {
    let mut stmt = conn.prepare(
        "SELECT roll, day, present FROM attendance_days WHERE ?1 IS NULL OR roll = ?1",
    )?;
    let rows = stmt.query_map(params![roll], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, bool>(2)?,
        ))
    })?;

    let mut out: BTreeMap<String, BTreeMap<NaiveDate, bool>> = BTreeMap::new();
    for row in rows {
        let (roll, day, present) = row?;
        let date = parse_day(&day).map_err(|e| corrupt(&roll, format!("bad date {day:?}: {e}")))?;
        out.entry(roll).or_default().insert(date, present);
    }
    Ok(out)
}

fn load_attendance(
    conn: &Connection,
    roll: Option<&str>,
) -> Result<Vec<AttendanceRecord>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT roll, identity_id FROM attendance_records
         WHERE ?1 IS NULL OR roll = ?1 ORDER BY roll",
    )?;
    let rows = stmt.query_map(params![roll], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
    })?;

    let mut days = load_days(conn, roll)?;
    let mut out = Vec::new();
    for row in rows {
        let (key, identity_id) = row?;
        let identity_id = identity_id.map(|id| from_id(&key, id)).transpose()?;
        out.push(AttendanceRecord {
            roll: parse_roll(&key)?,
            identity_id,
            days: days.remove(&key).unwrap_or_default(),
        });
    }
    Ok(out)
}

impl SqliteStore {
    fn insert(&self, doc: &IdentityDocument) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(DbError::from)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM identities WHERE roll = ?1",
                params![doc.roll.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(DbError::from)?
            .is_some();
        if exists {
            return Err(StoreError::Duplicate(doc.roll.to_string()));
        }

        tx.execute(
            "INSERT INTO identities (id, roll, name, father_name, phone, role, thumbnail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                to_id(doc.id)?,
                doc.roll.as_str(),
                doc.name,
                doc.father_name,
                doc.phone,
                encode_role(&doc.role),
                doc.thumbnail,
            ],
        )
        .map_err(DbError::from)?;

        for (family, embedding) in &doc.embeddings {
            tx.execute(
                "INSERT INTO embeddings (roll, family, dimension, vector, model_version)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    doc.roll.as_str(),
                    family.as_str(),
                    embedding.dim() as i64,
                    encode_vector(&embedding.values),
                    embedding.model_version,
                ],
            )
            .map_err(DbError::from)?;
        }

        tx.commit().map_err(DbError::from)?;
        Ok(())
    }

    fn remove(&self, roll: &RollNumber) -> Result<bool, DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM embeddings WHERE roll = ?1", params![roll.as_str()])?;
        let removed = tx.execute("DELETE FROM identities WHERE roll = ?1", params![roll.as_str()])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn upsert_day(&self, roll: &RollNumber, day: NaiveDate) -> Result<(), DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO attendance_records (roll, identity_id)
             VALUES (?1, (SELECT id FROM identities WHERE roll = ?1))
             ON CONFLICT(roll) DO NOTHING",
            params![roll.as_str()],
        )?;
        tx.execute(
            "INSERT INTO attendance_days (roll, day, present) VALUES (?1, ?2, 1)
             ON CONFLICT(roll, day) DO UPDATE SET present = 1",
            params![roll.as_str(), format_day(day)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove_attendance(&self, roll: &RollNumber) -> Result<bool, DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM attendance_days WHERE roll = ?1", params![roll.as_str()])?;
        let removed = tx.execute(
            "DELETE FROM attendance_records WHERE roll = ?1",
            params![roll.as_str()],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

impl Store for SqliteStore {
    fn find_identity(&self, roll: &RollNumber) -> Result<Option<IdentityDocument>, StoreError> {
        Ok(find_where(&self.conn(), "roll = ?1", roll.as_str())?)
    }

    fn find_identity_by_name(&self, name: &str) -> Result<Option<IdentityDocument>, StoreError> {
        Ok(find_where(&self.conn(), "name = ?1", name)?)
    }

    fn identities(&self) -> Result<Vec<IdentityDocument>, StoreError> {
        let conn = self.conn();
        let load = || -> Result<Vec<IdentityDocument>, DbError> {
            let mut embeddings = load_embeddings(&conn, None)?;
            let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], read_identity_row)?;

            let mut docs = Vec::new();
            for row in rows {
                let row = row?;
                let emb = embeddings.remove(&row.roll).unwrap_or_default();
                docs.push(into_document(row, emb)?);
            }
            Ok(docs)
        };
        Ok(load()?)
    }

    fn role_entries(&self) -> Result<Vec<(RollNumber, RawRole)>, StoreError> {
        let conn = self.conn();
        let load = || -> Result<Vec<(RollNumber, RawRole)>, DbError> {
            let mut stmt = conn.prepare("SELECT roll, role FROM identities ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (roll, role) = row?;
                out.push((parse_roll(&roll)?, decode_role(role)));
            }
            Ok(out)
        };
        Ok(load()?)
    }

    fn max_identity_id(&self) -> Result<Option<u64>, StoreError> {
        let max: Option<i64> = self
            .conn()
            .query_row("SELECT MAX(id) FROM identities", [], |row| row.get(0))
            .map_err(DbError::from)?;
        Ok(max.map(|id| from_id("max(id)", id)).transpose()?)
    }

    fn insert_identity(&self, doc: &IdentityDocument) -> Result<(), StoreError> {
        self.insert(doc)
    }

    fn set_role(&self, roll: &RollNumber, role: Role) -> Result<bool, StoreError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE identities SET role = ?2 WHERE roll = ?1",
                params![roll.as_str(), encode_role(&RawRole::from(role))],
            )
            .map_err(DbError::from)?;
        Ok(updated > 0)
    }

    fn delete_identity(&self, roll: &RollNumber) -> Result<bool, StoreError> {
        Ok(self.remove(roll)?)
    }

    fn create_attendance(&self, roll: &RollNumber, identity_id: u64) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO attendance_records (roll, identity_id) VALUES (?1, ?2)
                 ON CONFLICT(roll) DO NOTHING",
                params![roll.as_str(), to_id(identity_id)?],
            )
            .map_err(DbError::from)?;
        Ok(())
    }

    fn mark_present(&self, roll: &RollNumber, day: NaiveDate) -> Result<(), StoreError> {
        Ok(self.upsert_day(roll, day)?)
    }

    fn attendance(&self, roll: &RollNumber) -> Result<Option<AttendanceRecord>, StoreError> {
        Ok(load_attendance(&self.conn(), Some(roll.as_str()))?.into_iter().next())
    }

    fn all_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(load_attendance(&self.conn(), None)?)
    }

    fn delete_attendance(&self, roll: &RollNumber) -> Result<bool, StoreError> {
        Ok(self.remove_attendance(roll)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::role::RoleGovernor;
    use rollcall_core::{MatchPolicy, Roster};
    use serde_json::json;

    fn roll(s: &str) -> RollNumber {
        RollNumber::new(s).unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        parse_day(s).unwrap()
    }

    fn doc(id: u64, code: &str, role: RawRole) -> IdentityDocument {
        IdentityDocument {
            id,
            roll: roll(code),
            name: format!("name-{code}"),
            father_name: "F".into(),
            phone: "555".into(),
            role,
            embeddings: BTreeMap::from([
                (EmbeddingFamily::General, Embedding::new(vec![0.25, -1.5, 3.0])),
                (EmbeddingFamily::Compact, Embedding::new(vec![1.0, 0.0])),
            ]),
            thumbnail: Some(vec![0xFF, 0xD8, 0xFF]),
        }
    }

    #[test]
    fn test_identity_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let original = doc(1, "X1", RawRole::Text("admin".into()));
        store.insert_identity(&original).unwrap();

        assert_eq!(store.find_identity(&roll("X1")).unwrap(), Some(original.clone()));
        assert_eq!(store.find_identity_by_name("name-X1").unwrap(), Some(original));
        assert!(store.find_identity(&roll("X2")).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_roll_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&doc(1, "X1", RawRole::Absent)).unwrap();
        assert!(matches!(
            store.insert_identity(&doc(2, "X1", RawRole::Absent)),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn test_malformed_roles_survive_storage() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&doc(1, "A", RawRole::Absent)).unwrap();
        store
            .insert_identity(&doc(2, "B", RawRole::from_value(Some(json!({ "role": "admin" })))))
            .unwrap();
        store
            .insert_identity(&doc(3, "C", RawRole::from_value(Some(json!(7)))))
            .unwrap();

        let roles: Vec<RawRole> =
            store.role_entries().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(roles[0], RawRole::Absent);
        assert!(matches!(roles[1], RawRole::Structured(_)));
        assert_eq!(roles[2], RawRole::Wrong(json!(7)));
    }

    #[test]
    fn test_bare_text_role_is_read_as_string() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&doc(1, "A", RawRole::Absent)).unwrap();
        store
            .conn()
            .execute("UPDATE identities SET role = 'admin' WHERE roll = 'A'", [])
            .unwrap();
        assert_eq!(store.role_entries().unwrap()[0].1.canonical(), Some(Role::Admin));
    }

    #[test]
    fn test_set_role_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&doc(1, "A", RawRole::Absent)).unwrap();

        assert!(store.set_role(&roll("A"), Role::Admin).unwrap());
        assert!(!store.set_role(&roll("Z"), Role::Admin).unwrap());
        assert_eq!(store.role_entries().unwrap()[0].1, RawRole::Text("admin".into()));

        assert!(store.delete_identity(&roll("A")).unwrap());
        assert!(!store.delete_identity(&roll("A")).unwrap());
        assert!(store.identities().unwrap().is_empty());
        assert_eq!(store.max_identity_id().unwrap(), None);
    }

    #[test]
    fn test_mark_present_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&doc(4, "A", RawRole::Absent)).unwrap();
        store.create_attendance(&roll("A"), 4).unwrap();

        store.mark_present(&roll("A"), day("2024-01-01")).unwrap();
        store.mark_present(&roll("A"), day("2024-01-01")).unwrap();
        store.mark_present(&roll("A"), day("2024-01-02")).unwrap();
        store.create_attendance(&roll("A"), 4).unwrap();

        let record = store.attendance(&roll("A")).unwrap().unwrap();
        assert_eq!(record.identity_id, Some(4));
        assert_eq!(record.days.len(), 2);
        assert!(record.is_present(day("2024-01-01")));

        assert!(store.delete_attendance(&roll("A")).unwrap());
        assert!(store.attendance(&roll("A")).unwrap().is_none());
        assert!(store.all_attendance().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_embedding_is_left_out() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&doc(1, "A", RawRole::Absent)).unwrap();
        store
            .conn()
            .execute("UPDATE embeddings SET dimension = 99 WHERE family = 'general'", [])
            .unwrap();

        let docs = store.identities().unwrap();
        assert!(!docs[0].embeddings.contains_key(&EmbeddingFamily::General));
        assert!(docs[0].embeddings.contains_key(&EmbeddingFamily::Compact));
    }

    #[test]
    fn test_roster_over_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&doc(1, "A", RawRole::Text("admin".into()))).unwrap();
        store.insert_identity(&doc(2, "B", RawRole::Text("admin".into()))).unwrap();
        store.create_attendance(&roll("B"), 2).unwrap();
        let roster = Roster::open(store, RoleGovernor::default(), MatchPolicy::default()).unwrap();

        assert_eq!(roster.snapshot().len(), 2);
        roster.delete_identity(&roll("B")).unwrap();
        assert!(roster.delete_identity(&roll("A")).is_err());
        assert_eq!(roster.snapshot().len(), 1);
        assert!(roster.all_attendance().unwrap().is_empty());
    }
}
