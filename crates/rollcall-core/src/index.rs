//! Read-optimized, point-in-time copy of every enrolled identity.
//!
//! A [`Snapshot`] is built wholesale from the store and never patched. The
//! [`EmbeddingIndex`] publishes snapshots behind an `Arc` so readers keep
//! whatever snapshot they loaded while a rebuild is in progress.

use crate::role::{Role, RoleGovernor};
use crate::store::{IdentityDocument, Store, StoreError};
use crate::types::{Embedding, EmbeddingFamily, RollNumber};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub id: u64,
    pub roll: RollNumber,
    pub name: String,
    /// Already normalized.
    pub role: Role,
    pub embeddings: BTreeMap<EmbeddingFamily, Embedding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityFault {
    /// The stored identity has no reference vector for the family.
    MissingEmbedding,
    /// The reference vector has zero norm or a dimension unlike its peers.
    DegenerateEmbedding,
}

/// A stored identity that could not be fully indexed. Logged at rebuild
/// time and kept on the snapshot so status reports can surface it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityViolation {
    pub roll: RollNumber,
    pub family: EmbeddingFamily,
    pub fault: IntegrityFault,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: Vec<SnapshotEntry>,
    violations: Vec<IntegrityViolation>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read every identity from the store and build a fresh snapshot.
    ///
    /// Zero documents is not an error. Identities with a missing or
    /// degenerate reference are excluded from that family's gallery and
    /// recorded as violations; they never abort the rebuild.
    pub fn rebuild<S: Store + ?Sized>(
        store: &S,
        governor: &RoleGovernor,
    ) -> Result<Self, StoreError> {
        let docs = store.identities()?;
        let snapshot = Self::from_documents(docs, governor);

        if snapshot.is_empty() {
            tracing::info!("index rebuilt: no identities enrolled");
        } else {
            tracing::info!(
                identities = snapshot.len(),
                violations = snapshot.violations.len(),
                "index rebuilt"
            );
        }

        Ok(snapshot)
    }

    pub fn from_documents(docs: Vec<IdentityDocument>, governor: &RoleGovernor) -> Self {
        let mut entries = Vec::with_capacity(docs.len());
        let mut violations = Vec::new();
        let family_dims = reference_dims(&docs);

        for doc in docs {
            let role = governor.normalize(&doc.role, &doc.roll);
            let mut embeddings = doc.embeddings;

            for family in EmbeddingFamily::ALL {
                let fault = match embeddings.get(&family) {
                    None => Some(IntegrityFault::MissingEmbedding),
                    Some(e) => {
                        let zero = e.values.iter().all(|v| *v == 0.0);
                        let outlier = family_dims.get(&family) != Some(&e.dim());
                        (zero || outlier).then_some(IntegrityFault::DegenerateEmbedding)
                    }
                };

                if let Some(fault) = fault {
                    tracing::error!(
                        roll = %doc.roll,
                        family = %family,
                        ?fault,
                        "integrity violation: identity excluded from family gallery"
                    );
                    embeddings.remove(&family);
                    violations.push(IntegrityViolation {
                        roll: doc.roll.clone(),
                        family,
                        fault,
                    });
                }
            }

            entries.push(SnapshotEntry {
                id: doc.id,
                roll: doc.roll,
                name: doc.name,
                role,
                embeddings,
            });
        }

        Self {
            entries,
            violations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn violations(&self) -> &[IntegrityViolation] {
        &self.violations
    }

    pub fn find(&self, roll: &RollNumber) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| &e.roll == roll)
    }

    /// Entries holding a reference for `family`, in snapshot order.
    pub fn gallery(
        &self,
        family: EmbeddingFamily,
    ) -> impl Iterator<Item = (&SnapshotEntry, &Embedding)> + '_ {
        self.entries
            .iter()
            .filter_map(move |e| e.embeddings.get(&family).map(|emb| (e, emb)))
    }
}

/// Most common reference dimension per family. Ties go to the dimension
/// seen first in id order.
fn reference_dims(docs: &[IdentityDocument]) -> BTreeMap<EmbeddingFamily, usize> {
    let mut counts: BTreeMap<EmbeddingFamily, Vec<(usize, usize)>> = BTreeMap::new();
    for doc in docs {
        for (family, embedding) in &doc.embeddings {
            let seen = counts.entry(*family).or_default();
            match seen.iter_mut().find(|(dim, _)| *dim == embedding.dim()) {
                Some((_, n)) => *n += 1,
                None => seen.push((embedding.dim(), 1)),
            }
        }
    }

    counts
        .into_iter()
        .filter_map(|(family, seen)| {
            let mut best: Option<(usize, usize)> = None;
            for (dim, n) in seen {
                if best.map_or(true, |(_, top)| n > top) {
                    best = Some((dim, n));
                }
            }
            best.map(|(dim, _)| (family, dim))
        })
        .collect()
}

/// Holder of the currently published snapshot.
pub struct EmbeddingIndex {
    current: RwLock<Arc<Snapshot>>,
}

impl EmbeddingIndex {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The published snapshot. Cheap; holds the lock only to clone the `Arc`.
    pub fn load(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the published snapshot. Readers holding the old one are unaffected.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        snapshot
    }
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new(Snapshot::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::RawRole;
    use crate::store::MemoryStore;

    fn doc(
        id: u64,
        roll: &str,
        general: Option<Vec<f32>>,
        compact: Option<Vec<f32>>,
    ) -> IdentityDocument {
        let mut embeddings = BTreeMap::new();
        if let Some(v) = general {
            embeddings.insert(EmbeddingFamily::General, Embedding::new(v));
        }
        if let Some(v) = compact {
            embeddings.insert(EmbeddingFamily::Compact, Embedding::new(v));
        }
        IdentityDocument {
            id,
            roll: RollNumber::new(roll).unwrap(),
            name: roll.to_lowercase(),
            father_name: String::new(),
            phone: String::new(),
            role: RawRole::Text("admin".into()),
            embeddings,
            thumbnail: None,
        }
    }

    #[test]
    fn test_rebuild_empty_store() {
        let store = MemoryStore::new();
        let snapshot = Snapshot::rebuild(&store, &RoleGovernor::default()).unwrap();
        assert!(snapshot.is_empty());
        assert!(snapshot.violations().is_empty());
    }

    #[test]
    fn test_rebuild_preserves_id_order_and_normalizes_roles() {
        let store = MemoryStore::new();
        store.insert_identity(&doc(2, "B", Some(vec![0.0, 1.0]), Some(vec![1.0]))).unwrap();
        store.insert_identity(&doc(1, "A", Some(vec![1.0, 0.0]), Some(vec![1.0]))).unwrap();

        let snapshot = Snapshot::rebuild(&store, &RoleGovernor::default()).unwrap();
        let rolls: Vec<&str> = snapshot.entries().iter().map(|e| e.roll.as_str()).collect();
        assert_eq!(rolls, vec!["A", "B"]);
        assert!(snapshot.entries().iter().all(|e| e.role == Role::Admin));
    }

    #[test]
    fn test_missing_embedding_is_recorded_not_fatal() {
        let store = MemoryStore::new();
        store.insert_identity(&doc(1, "A", Some(vec![1.0, 0.0]), Some(vec![1.0]))).unwrap();
        store.insert_identity(&doc(2, "B", None, Some(vec![1.0]))).unwrap();

        let snapshot = Snapshot::rebuild(&store, &RoleGovernor::default()).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.gallery(EmbeddingFamily::General).count(), 1);
        assert_eq!(snapshot.gallery(EmbeddingFamily::Compact).count(), 2);
        assert_eq!(
            snapshot.violations(),
            &[IntegrityViolation {
                roll: RollNumber::new("B").unwrap(),
                family: EmbeddingFamily::General,
                fault: IntegrityFault::MissingEmbedding,
            }]
        );
    }

    #[test]
    fn test_degenerate_reference_excluded() {
        let docs = vec![
            doc(1, "A", Some(vec![1.0, 0.0]), Some(vec![1.0])),
            doc(2, "B", Some(vec![0.0, 0.0]), Some(vec![1.0])),
            doc(3, "C", Some(vec![1.0, 0.0, 0.0]), Some(vec![1.0])),
        ];
        let snapshot = Snapshot::from_documents(docs, &RoleGovernor::default());
        assert_eq!(snapshot.gallery(EmbeddingFamily::General).count(), 1);
        assert_eq!(snapshot.violations().len(), 2);
        assert!(snapshot
            .violations()
            .iter()
            .all(|v| v.fault == IntegrityFault::DegenerateEmbedding));
    }

    #[test]
    fn test_outlier_dimension_first_in_order_is_excluded() {
        let docs = vec![
            doc(1, "OLD", Some(vec![1.0, 0.0, 0.0]), Some(vec![1.0])),
            doc(2, "A", Some(vec![1.0, 0.0]), Some(vec![1.0])),
            doc(3, "B", Some(vec![0.0, 1.0]), Some(vec![1.0])),
        ];
        let snapshot = Snapshot::from_documents(docs, &RoleGovernor::default());

        let general: Vec<&str> = snapshot
            .gallery(EmbeddingFamily::General)
            .map(|(e, _)| e.roll.as_str())
            .collect();
        assert_eq!(general, vec!["A", "B"]);
        assert_eq!(
            snapshot.violations(),
            &[IntegrityViolation {
                roll: RollNumber::new("OLD").unwrap(),
                family: EmbeddingFamily::General,
                fault: IntegrityFault::DegenerateEmbedding,
            }]
        );

        let probe = Embedding::new(vec![0.0, 1.0]);
        let best = snapshot
            .gallery(EmbeddingFamily::General)
            .map(|(e, reference)| (e.roll.as_str(), probe.similarity(reference).unwrap()))
            .fold(("", f32::MIN), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
        assert_eq!(best.0, "B");
    }

    #[test]
    fn test_publish_leaves_old_readers_untouched() {
        let index = EmbeddingIndex::default();
        let before = index.load();

        let store = MemoryStore::new();
        store.insert_identity(&doc(1, "A", Some(vec![1.0]), Some(vec![1.0]))).unwrap();
        index.publish(Snapshot::rebuild(&store, &RoleGovernor::default()).unwrap());

        assert!(before.is_empty());
        assert_eq!(index.load().len(), 1);
    }
}
