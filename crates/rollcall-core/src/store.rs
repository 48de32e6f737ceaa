//! Document store contract.
//!
//! The store is the single source of truth. Every operation is atomic per
//! document; nothing here spans documents, which is why multi-step
//! mutations are serialized by the [`Roster`](crate::roster::Roster).

use crate::attendance::AttendanceRecord;
use crate::role::{RawRole, Role};
use crate::types::{Embedding, EmbeddingFamily, RollNumber};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt document {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("duplicate key: {0}")]
    Duplicate(String),
}

/// An enrolled identity as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityDocument {
    pub id: u64,
    pub roll: RollNumber,
    pub name: String,
    pub father_name: String,
    pub phone: String,
    pub role: RawRole,
    /// Reference embedding per family. A missing family is an integrity fault.
    pub embeddings: BTreeMap<EmbeddingFamily, Embedding>,
    /// Grayscale JPEG of the first usable enrollment crop.
    pub thumbnail: Option<Vec<u8>>,
}

pub trait Store: Send + Sync {
    fn find_identity(&self, roll: &RollNumber) -> Result<Option<IdentityDocument>, StoreError>;

    fn find_identity_by_name(&self, name: &str) -> Result<Option<IdentityDocument>, StoreError>;

    /// Every identity, ordered by id.
    fn identities(&self) -> Result<Vec<IdentityDocument>, StoreError>;

    /// Projection of every identity onto (roll, stored role).
    fn role_entries(&self) -> Result<Vec<(RollNumber, RawRole)>, StoreError>;

    fn max_identity_id(&self) -> Result<Option<u64>, StoreError>;

    fn insert_identity(&self, doc: &IdentityDocument) -> Result<(), StoreError>;

    /// Returns false if no identity has this roll.
    fn set_role(&self, roll: &RollNumber, role: Role) -> Result<bool, StoreError>;

    /// Returns false if no identity has this roll.
    fn delete_identity(&self, roll: &RollNumber) -> Result<bool, StoreError>;

    /// Create an empty attendance record. No-op if one exists.
    fn create_attendance(&self, roll: &RollNumber, identity_id: u64) -> Result<(), StoreError>;

    /// Upsert: create the record if needed, then set `day` to present.
    fn mark_present(&self, roll: &RollNumber, day: NaiveDate) -> Result<(), StoreError>;

    fn attendance(&self, roll: &RollNumber) -> Result<Option<AttendanceRecord>, StoreError>;

    fn all_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError>;

    fn delete_attendance(&self, roll: &RollNumber) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    identities: Vec<IdentityDocument>,
    attendance: BTreeMap<RollNumber, AttendanceRecord>,
}

/// In-process [`Store`]. Used by tests and embedders without a database.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

impl Store for MemoryStore {
    fn find_identity(&self, roll: &RollNumber) -> Result<Option<IdentityDocument>, StoreError> {
        Ok(self.read(|s| s.identities.iter().find(|d| &d.roll == roll).cloned()))
    }

    fn find_identity_by_name(&self, name: &str) -> Result<Option<IdentityDocument>, StoreError> {
        Ok(self.read(|s| s.identities.iter().find(|d| d.name == name).cloned()))
    }

    fn identities(&self) -> Result<Vec<IdentityDocument>, StoreError> {
        Ok(self.read(|s| {
            let mut docs = s.identities.clone();
            docs.sort_by_key(|d| d.id);
            docs
        }))
    }

    fn role_entries(&self) -> Result<Vec<(RollNumber, RawRole)>, StoreError> {
        Ok(self.read(|s| {
            s.identities
                .iter()
                .map(|d| (d.roll.clone(), d.role.clone()))
                .collect()
        }))
    }

    fn max_identity_id(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.read(|s| s.identities.iter().map(|d| d.id).max()))
    }

    fn insert_identity(&self, doc: &IdentityDocument) -> Result<(), StoreError> {
        self.write(|s| {
            if s.identities.iter().any(|d| d.roll == doc.roll) {
                return Err(StoreError::Duplicate(doc.roll.to_string()));
            }
            s.identities.push(doc.clone());
            Ok(())
        })
    }

    fn set_role(&self, roll: &RollNumber, role: Role) -> Result<bool, StoreError> {
        Ok(self.write(|s| match s.identities.iter_mut().find(|d| &d.roll == roll) {
            Some(doc) => {
                doc.role = RawRole::from(role);
                true
            }
            None => false,
        }))
    }

    fn delete_identity(&self, roll: &RollNumber) -> Result<bool, StoreError> {
        Ok(self.write(|s| {
            let before = s.identities.len();
            s.identities.retain(|d| &d.roll != roll);
            s.identities.len() != before
        }))
    }

    fn create_attendance(&self, roll: &RollNumber, identity_id: u64) -> Result<(), StoreError> {
        self.write(|s| {
            s.attendance
                .entry(roll.clone())
                .or_insert_with(|| AttendanceRecord::new(roll.clone(), Some(identity_id)));
        });
        Ok(())
    }

    fn mark_present(&self, roll: &RollNumber, day: NaiveDate) -> Result<(), StoreError> {
        self.write(|s| {
            s.attendance
                .entry(roll.clone())
                .or_insert_with(|| AttendanceRecord::new(roll.clone(), None))
                .mark(day);
        });
        Ok(())
    }

    fn attendance(&self, roll: &RollNumber) -> Result<Option<AttendanceRecord>, StoreError> {
        Ok(self.read(|s| s.attendance.get(roll).cloned()))
    }

    fn all_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.read(|s| s.attendance.values().cloned().collect()))
    }

    fn delete_attendance(&self, roll: &RollNumber) -> Result<bool, StoreError> {
        Ok(self.write(|s| s.attendance.remove(roll).is_some()))
    }
}
