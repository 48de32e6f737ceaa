//! The roster: every operation on enrolled identities goes through here.
//!
//! Readers (matching, listings, lookups) work off the published snapshot or
//! single store reads and never block on each other. Anything that reads a
//! role and then writes (role changes, deletion, enrollment, attendance
//! marks, repairs) holds the one mutation lock from the first read through
//! the index rebuild, so two concurrent demotions cannot both observe two
//! admins.

use crate::attendance::{AttendanceRecord, AttendanceRecorder};
use crate::enroll::{aggregate, EnrollError, EnrollmentProfile, ProbeExtraction};
use crate::index::{EmbeddingIndex, IntegrityViolation, Snapshot};
use crate::matcher::{CosineMatcher, MatchOutcome, MatchPolicy, Matcher};
use crate::role::{InvalidRole, LastAdminProtected, Role, RoleGovernor, RoleRepair};
use crate::store::{IdentityDocument, Store, StoreError};
use crate::types::{DegenerateVector, Embedding, EmbeddingFamily, InvalidRollNumber, RollNumber};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },
    #[error(transparent)]
    LastAdminProtected(#[from] LastAdminProtected),
    #[error("user '{0}' already exists")]
    DuplicateIdentity(String),
    #[error("no valid faces detected")]
    NoFaceDetected,
    #[error("face detected belongs to {detected}, but you entered {claimed}")]
    FaceMismatch { detected: String, claimed: String },
    #[error("face not recognized (similarity {similarity:.3})")]
    NotRecognized { similarity: f32 },
    #[error("no registered faces")]
    NoRegisteredIdentities,
    #[error("identity {roll} has no {family} reference embedding")]
    MissingReference {
        roll: RollNumber,
        family: EmbeddingFamily,
    },
    #[error(transparent)]
    DegenerateVector(#[from] DegenerateVector),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RosterError {
    fn user_not_found(roll: &RollNumber) -> Self {
        RosterError::NotFound {
            what: "user",
            key: roll.to_string(),
        }
    }

    /// Data-integrity and backend failures. Callers log these in full and
    /// report them opaquely.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            RosterError::MissingReference { .. }
                | RosterError::DegenerateVector(_)
                | RosterError::Store(_)
        )
    }
}

impl From<EnrollError> for RosterError {
    fn from(e: EnrollError) -> Self {
        match e {
            EnrollError::InvalidRoll(_) | EnrollError::MissingField(_) => {
                RosterError::InvalidInput(e.to_string())
            }
            EnrollError::NoFaceDetected { .. } => RosterError::NoFaceDetected,
            EnrollError::Degenerate(d) => RosterError::DegenerateVector(d),
        }
    }
}

impl From<InvalidRollNumber> for RosterError {
    fn from(e: InvalidRollNumber) -> Self {
        RosterError::InvalidInput(e.to_string())
    }
}

impl From<InvalidRole> for RosterError {
    fn from(e: InvalidRole) -> Self {
        RosterError::InvalidInput(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub id: u64,
    pub roll: RollNumber,
    pub name: String,
    pub role: Role,
}

/// Everything stored about an identity except its embeddings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityDetails {
    pub id: u64,
    pub roll: RollNumber,
    pub name: String,
    pub father_name: String,
    pub phone: String,
    pub role: Role,
    #[serde(skip)]
    pub thumbnail: Option<Vec<u8>>,
}

/// Successful login.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckIn {
    pub roll: RollNumber,
    pub name: String,
    pub similarity: f32,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterStatus {
    pub identities: usize,
    pub admins: usize,
    pub violations: Vec<IntegrityViolation>,
    pub thresholds: MatchPolicy,
    pub bootstrap_admin: Option<RollNumber>,
}

pub struct Roster<S> {
    store: S,
    governor: RoleGovernor,
    policy: MatchPolicy,
    matcher: CosineMatcher,
    index: EmbeddingIndex,
    mutation: Mutex<()>,
    /// Set when a rebuild failed after the store changed.
    stale: AtomicBool,
}

impl<S: Store> Roster<S> {
    /// Build the first snapshot from `store` and publish it.
    pub fn open(
        store: S,
        governor: RoleGovernor,
        policy: MatchPolicy,
    ) -> Result<Self, RosterError> {
        let snapshot = Snapshot::rebuild(&store, &governor)?;
        Ok(Self {
            store,
            governor,
            policy,
            matcher: CosineMatcher,
            index: EmbeddingIndex::new(snapshot),
            mutation: Mutex::new(()),
            stale: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn governor(&self) -> &RoleGovernor {
        &self.governor
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// The published snapshot. A stale index is rebuilt first when no
    /// mutation is in flight.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        if self.stale.load(Ordering::Acquire) {
            if let Ok(guard) = self.mutation.try_lock() {
                if let Err(e) = self.rebuild_locked(&guard) {
                    tracing::warn!(error = %e, "stale index could not be rebuilt");
                }
            }
        }
        self.index.load()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Caller must hold the mutation lock; the guard is the proof.
    fn rebuild_locked(&self, _guard: &MutexGuard<'_, ()>) -> Result<Arc<Snapshot>, RosterError> {
        match Snapshot::rebuild(&self.store, &self.governor) {
            Ok(snapshot) => {
                self.stale.store(false, Ordering::Release);
                Ok(self.index.publish(snapshot))
            }
            Err(e) => {
                self.stale.store(true, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Republish after the store has been written, even when a later write in
    /// the same operation failed. The write error takes precedence.
    fn commit_locked<T>(
        &self,
        guard: &MutexGuard<'_, ()>,
        written: Result<T, RosterError>,
    ) -> Result<T, RosterError> {
        let rebuilt = self.rebuild_locked(guard);
        match (written, rebuilt) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(rebuild)) => {
                tracing::error!(error = %rebuild, "index rebuild failed after partial write");
                Err(e)
            }
        }
    }

    /// Rebuild from the store and publish, e.g. after out-of-band edits.
    pub fn refresh(&self) -> Result<Arc<Snapshot>, RosterError> {
        let guard = self.lock();
        self.rebuild_locked(&guard)
    }

    /// Match each probe against the general family gallery, in probe order.
    pub fn identify(&self, probes: &[Embedding]) -> Result<Vec<MatchOutcome>, RosterError> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Ok(vec![MatchOutcome::NoRegisteredIdentities]);
        }

        let family = EmbeddingFamily::General;
        let outcomes =
            self.matcher
                .compare_all(probes, &snapshot, family, self.policy.threshold(family))?;
        Ok(outcomes)
    }

    /// [`identify`](Self::identify), then mark every recognized identity present on `day`.
    pub fn take_attendance(
        &self,
        probes: &[Embedding],
        day: NaiveDate,
    ) -> Result<Vec<MatchOutcome>, RosterError> {
        let outcomes = self.identify(probes)?;
        for roll in outcomes.iter().filter_map(MatchOutcome::roll) {
            self.mark_present(roll, day)?;
        }
        Ok(outcomes)
    }

    /// Fails with `NotFound` unless `roll` is enrolled.
    pub fn require_enrolled(&self, roll: &RollNumber) -> Result<IdentityDocument, RosterError> {
        self.store
            .find_identity(roll)?
            .ok_or_else(|| RosterError::user_not_found(roll))
    }

    /// Login: the first probe must be recognized as `claimed`.
    pub fn check_in(
        &self,
        claimed: &RollNumber,
        probes: &[Embedding],
        day: NaiveDate,
    ) -> Result<CheckIn, RosterError> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Err(RosterError::NoRegisteredIdentities);
        }
        let doc = self.require_enrolled(claimed)?;

        let Some(probe) = probes.first() else {
            return Err(RosterError::NoFaceDetected);
        };

        let family = EmbeddingFamily::General;
        let outcome =
            self.matcher
                .compare(probe, &snapshot, family, self.policy.threshold(family))?;

        match outcome {
            MatchOutcome::Recognized {
                roll,
                name,
                similarity,
                role,
                ..
            } if &roll == claimed => {
                self.mark_present(&roll, day)?;
                tracing::info!(roll = %roll, similarity, "login accepted");
                Ok(CheckIn {
                    roll,
                    name,
                    similarity,
                    role,
                })
            }
            MatchOutcome::Recognized { name, roll, .. } => {
                tracing::warn!(claimed = %claimed, detected = %roll, "login face mismatch");
                Err(RosterError::FaceMismatch {
                    detected: name,
                    claimed: doc.name,
                })
            }
            MatchOutcome::Unknown { similarity } => {
                tracing::warn!(claimed = %claimed, similarity, "login face not recognized");
                Err(RosterError::NotRecognized { similarity })
            }
            MatchOutcome::NoRegisteredIdentities => Err(RosterError::NoRegisteredIdentities),
        }
    }

    /// 1:1 check of a compact-family probe against the claimed identity.
    /// Does not mark attendance.
    pub fn verify_compact(
        &self,
        claimed: &RollNumber,
        probe: &Embedding,
    ) -> Result<CheckIn, RosterError> {
        let doc = self.require_enrolled(claimed)?;
        let snapshot = self.snapshot();
        let family = EmbeddingFamily::Compact;

        let entry = snapshot.find(claimed);
        let Some((entry, reference)) =
            entry.and_then(|e| e.embeddings.get(&family).map(|emb| (e, emb)))
        else {
            return Err(RosterError::MissingReference {
                roll: doc.roll,
                family,
            });
        };

        let (accepted, similarity) =
            CosineMatcher::verify(probe, reference, self.policy.threshold(family))?;
        if !accepted {
            tracing::warn!(claimed = %claimed, similarity, "compact verification rejected");
            return Err(RosterError::NotRecognized { similarity });
        }

        tracing::info!(roll = %claimed, similarity, "compact verification accepted");
        Ok(CheckIn {
            roll: entry.roll.clone(),
            name: entry.name.clone(),
            similarity,
            role: entry.role,
        })
    }

    /// `DuplicateIdentity` if the roll or the display name is taken.
    pub fn ensure_unique(&self, roll: &RollNumber, name: &str) -> Result<(), RosterError> {
        if self.store.find_identity(roll)?.is_some() {
            return Err(RosterError::DuplicateIdentity(roll.to_string()));
        }
        if self.store.find_identity_by_name(name)?.is_some() {
            return Err(RosterError::DuplicateIdentity(name.to_string()));
        }
        Ok(())
    }

    /// Persist a new identity from per-probe extractions and republish the index.
    pub fn enroll(
        &self,
        profile: EnrollmentProfile,
        extractions: &[ProbeExtraction],
    ) -> Result<IdentitySummary, RosterError> {
        let guard = self.lock();
        self.ensure_unique(&profile.roll, &profile.name)?;

        let references = aggregate(extractions, &EmbeddingFamily::ALL)?;
        let id = self.store.max_identity_id()?.map_or(1, |max| max + 1);
        let role = self.governor.initial_role(&profile.roll);

        let doc = IdentityDocument {
            id,
            roll: profile.roll,
            name: profile.name,
            father_name: profile.father_name,
            phone: profile.phone,
            role: role.into(),
            embeddings: references.embeddings,
            thumbnail: references.thumbnail,
        };

        self.store.insert_identity(&doc).map_err(|e| match e {
            StoreError::Duplicate(key) => RosterError::DuplicateIdentity(key),
            other => other.into(),
        })?;
        let created = self.store.create_attendance(&doc.roll, id);
        self.commit_locked(&guard, created.map_err(RosterError::from))?;

        tracing::info!(
            id,
            roll = %doc.roll,
            role = %role,
            contributions = ?references.contributions,
            "identity enrolled"
        );

        Ok(IdentitySummary {
            id,
            roll: doc.roll,
            name: doc.name,
            role,
        })
    }

    /// Admin count over a full scan of stored roles.
    pub fn count_admins(&self) -> Result<usize, RosterError> {
        let entries = self.store.role_entries()?;
        Ok(self.governor.count_admins(entries.iter().map(|(r, raw)| (r, raw))))
    }

    pub fn update_role(&self, roll: &RollNumber, requested: Role) -> Result<Role, RosterError> {
        let guard = self.lock();
        let doc = self.require_enrolled(roll)?;
        let current = self.governor.normalize(&doc.role, roll);
        let admins = self.count_admins()?;

        if let Err(e) = RoleGovernor::authorize_role_change(current, requested, admins) {
            tracing::warn!(roll = %roll, %current, %requested, admins, "role change rejected");
            return Err(e.into());
        }

        let written = self.store.set_role(roll, requested);
        if !self.commit_locked(&guard, written.map_err(RosterError::from))? {
            return Err(RosterError::user_not_found(roll));
        }

        tracing::info!(roll = %roll, from = %current, to = %requested, "role updated");
        Ok(requested)
    }

    /// Remove an identity and its attendance record.
    pub fn delete_identity(&self, roll: &RollNumber) -> Result<(), RosterError> {
        let guard = self.lock();
        let doc = self.require_enrolled(roll)?;
        let current = self.governor.normalize(&doc.role, roll);
        let admins = self.count_admins()?;

        if let Err(e) = RoleGovernor::authorize_deletion(current, admins) {
            tracing::warn!(roll = %roll, admins, "deletion rejected");
            return Err(e.into());
        }

        if !self.store.delete_identity(roll)? {
            return Err(RosterError::user_not_found(roll));
        }
        let cascaded = self.store.delete_attendance(roll);
        let had_attendance = self.commit_locked(&guard, cascaded.map_err(RosterError::from))?;

        tracing::info!(roll = %roll, had_attendance, "identity deleted");
        Ok(())
    }

    /// Returns false, without writing, when the identity no longer exists.
    pub fn mark_present(&self, roll: &RollNumber, day: NaiveDate) -> Result<bool, RosterError> {
        let _guard = self.lock();
        if self.store.find_identity(roll)?.is_none() {
            tracing::warn!(roll = %roll, "skipping attendance for identity that no longer exists");
            return Ok(false);
        }
        AttendanceRecorder::new(&self.store).mark_present(roll, day)?;
        Ok(true)
    }

    pub fn identities(&self) -> Result<Vec<IdentitySummary>, RosterError> {
        Ok(self
            .store
            .identities()?
            .into_iter()
            .map(|doc| IdentitySummary {
                id: doc.id,
                role: self.governor.normalize(&doc.role, &doc.roll),
                roll: doc.roll,
                name: doc.name,
            })
            .collect())
    }

    /// Look up by display name first, then by roll.
    pub fn identity_details(&self, key: &str) -> Result<IdentityDetails, RosterError> {
        let doc = match self.store.find_identity_by_name(key)? {
            Some(doc) => Some(doc),
            None => match RollNumber::new(key) {
                Ok(roll) => self.store.find_identity(&roll)?,
                Err(_) => None,
            },
        };

        let doc = doc.ok_or_else(|| RosterError::NotFound {
            what: "user",
            key: key.to_string(),
        })?;

        Ok(IdentityDetails {
            id: doc.id,
            role: self.governor.normalize(&doc.role, &doc.roll),
            roll: doc.roll,
            name: doc.name,
            father_name: doc.father_name,
            phone: doc.phone,
            thumbnail: doc.thumbnail,
        })
    }

    pub fn attendance_for(&self, roll: &RollNumber) -> Result<AttendanceRecord, RosterError> {
        self.require_enrolled(roll)?;
        AttendanceRecorder::new(&self.store)
            .get_attendance(roll)?
            .ok_or_else(|| RosterError::NotFound {
                what: "attendance record",
                key: roll.to_string(),
            })
    }

    pub fn all_attendance(&self) -> Result<Vec<AttendanceRecord>, RosterError> {
        Ok(self.store.all_attendance()?)
    }

    /// Rewrite every stored role that is not a canonical value.
    pub fn repair_roles(&self, dry_run: bool) -> Result<Vec<RoleRepair>, RosterError> {
        let guard = self.lock();
        let repairs = self.governor.plan_repairs(&self.store.role_entries()?);

        if dry_run || repairs.is_empty() {
            return Ok(repairs);
        }

        let written: Result<(), RosterError> = repairs.iter().try_for_each(|repair| {
            self.store.set_role(&repair.roll, repair.repaired)?;
            tracing::info!(
                roll = %repair.roll,
                stored = ?repair.stored,
                repaired = %repair.repaired,
                "role repaired"
            );
            Ok(())
        });
        self.commit_locked(&guard, written)?;

        Ok(repairs)
    }

    pub fn status(&self) -> Result<RosterStatus, RosterError> {
        let snapshot = self.snapshot();
        Ok(RosterStatus {
            identities: snapshot.len(),
            admins: self.count_admins()?,
            violations: snapshot.violations().to_vec(),
            thresholds: self.policy,
            bootstrap_admin: self.governor.bootstrap_admin().cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::RawRole;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Barrier;

    fn roll(s: &str) -> RollNumber {
        RollNumber::new(s).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    fn probes(general: &[f32], compact: &[f32]) -> ProbeExtraction {
        ProbeExtraction {
            embeddings: BTreeMap::from([
                (EmbeddingFamily::General, emb(general)),
                (EmbeddingFamily::Compact, emb(compact)),
            ]),
            thumbnail: Some(vec![0xFF, 0xD8]),
        }
    }

    fn roster() -> Roster<MemoryStore> {
        Roster::open(MemoryStore::new(), RoleGovernor::default(), MatchPolicy::default()).unwrap()
    }

    fn enroll(
        roster: &Roster<MemoryStore>,
        code: &str,
        name: &str,
        general: &[f32],
    ) -> IdentitySummary {
        let profile = EnrollmentProfile::new(code, name, "", "").unwrap();
        roster.enroll(profile, &[probes(general, &[1.0, 0.0])]).unwrap()
    }

    fn insert_raw(store: &MemoryStore, id: u64, code: &str, role: RawRole) {
        store
            .insert_identity(&IdentityDocument {
                id,
                roll: roll(code),
                name: code.to_lowercase(),
                father_name: String::new(),
                phone: String::new(),
                role,
                embeddings: BTreeMap::from([
                    (EmbeddingFamily::General, emb(&[1.0, 0.0])),
                    (EmbeddingFamily::Compact, emb(&[1.0, 0.0])),
                ]),
                thumbnail: None,
            })
            .unwrap();
    }

    /// Delegates to a `MemoryStore`; the flagged operations fail.
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryStore,
        fail_create_attendance: AtomicBool,
        fail_delete_attendance: AtomicBool,
        fail_identities: AtomicBool,
    }

    impl FailingStore {
        fn check(flag: &AtomicBool) -> Result<(), StoreError> {
            if flag.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("injected failure".into()));
            }
            Ok(())
        }
    }

    impl Store for FailingStore {
        fn find_identity(
            &self,
            roll: &RollNumber,
        ) -> Result<Option<IdentityDocument>, StoreError> {
            self.inner.find_identity(roll)
        }

        fn find_identity_by_name(
            &self,
            name: &str,
        ) -> Result<Option<IdentityDocument>, StoreError> {
            self.inner.find_identity_by_name(name)
        }

        fn identities(&self) -> Result<Vec<IdentityDocument>, StoreError> {
            Self::check(&self.fail_identities)?;
            self.inner.identities()
        }

        fn role_entries(&self) -> Result<Vec<(RollNumber, RawRole)>, StoreError> {
            self.inner.role_entries()
        }

        fn max_identity_id(&self) -> Result<Option<u64>, StoreError> {
            self.inner.max_identity_id()
        }

        fn insert_identity(&self, doc: &IdentityDocument) -> Result<(), StoreError> {
            self.inner.insert_identity(doc)
        }

        fn set_role(&self, roll: &RollNumber, role: Role) -> Result<bool, StoreError> {
            self.inner.set_role(roll, role)
        }

        fn delete_identity(&self, roll: &RollNumber) -> Result<bool, StoreError> {
            self.inner.delete_identity(roll)
        }

        fn create_attendance(&self, roll: &RollNumber, identity_id: u64) -> Result<(), StoreError> {
            Self::check(&self.fail_create_attendance)?;
            self.inner.create_attendance(roll, identity_id)
        }

        fn mark_present(&self, roll: &RollNumber, day: NaiveDate) -> Result<(), StoreError> {
            self.inner.mark_present(roll, day)
        }

        fn attendance(
            &self,
            roll: &RollNumber,
        ) -> Result<Option<AttendanceRecord>, StoreError> {
            self.inner.attendance(roll)
        }

        fn all_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
            self.inner.all_attendance()
        }

        fn delete_attendance(&self, roll: &RollNumber) -> Result<bool, StoreError> {
            Self::check(&self.fail_delete_attendance)?;
            self.inner.delete_attendance(roll)
        }
    }

    fn failing_roster() -> Roster<FailingStore> {
        let store = FailingStore::default();
        insert_raw(&store.inner, 1, "ADM", RawRole::Text("admin".into()));
        insert_raw(&store.inner, 2, "USR", RawRole::Absent);
        Roster::open(store, RoleGovernor::default(), MatchPolicy::default()).unwrap()
    }

    #[test]
    fn test_enroll_then_match_round_trip() {
        let roster = roster();
        let summary = enroll(&roster, "x1", "A", &[1.0, 0.0]);
        assert_eq!(summary.id, 1);
        assert_eq!(summary.roll.as_str(), "X1");
        assert_eq!(summary.role, Role::User);

        let outcomes = roster.identify(&[emb(&[1.0, 0.0]), emb(&[0.0, 1.0])]).unwrap();
        match &outcomes[0] {
            MatchOutcome::Recognized { roll, similarity, .. } => {
                assert_eq!(roll.as_str(), "X1");
                assert!((similarity - 1.0).abs() < 1e-6);
            }
            other => panic!("expected recognized, got {other:?}"),
        }
        assert_eq!(outcomes[1], MatchOutcome::Unknown { similarity: 0.0 });
    }

    #[test]
    fn test_enroll_persists_attendance_record_and_rebuilds() {
        let roster = roster();
        assert!(roster.snapshot().is_empty());
        enroll(&roster, "X1", "A", &[1.0, 0.0]);

        assert_eq!(roster.snapshot().len(), 1);
        let record = roster.attendance_for(&roll("X1")).unwrap();
        assert_eq!(record.identity_id, Some(1));
        assert!(record.days.is_empty());
    }

    #[test]
    fn test_enroll_ids_increase() {
        let roster = roster();
        enroll(&roster, "X1", "A", &[1.0, 0.0]);
        enroll(&roster, "X2", "B", &[0.0, 1.0]);
        roster.delete_identity(&roll("X1")).unwrap();
        assert_eq!(enroll(&roster, "X3", "C", &[1.0, 1.0]).id, 3);
    }

    #[test]
    fn test_enroll_rejects_duplicates() {
        let roster = roster();
        enroll(&roster, "X1", "A", &[1.0, 0.0]);

        let same_roll = EnrollmentProfile::new("x1", "Other", "", "").unwrap();
        assert!(matches!(
            roster.enroll(same_roll, &[probes(&[1.0], &[1.0])]),
            Err(RosterError::DuplicateIdentity(k)) if k == "X1"
        ));
        let same_name = EnrollmentProfile::new("X9", "A", "", "").unwrap();
        assert!(matches!(
            roster.enroll(same_name, &[probes(&[1.0], &[1.0])]),
            Err(RosterError::DuplicateIdentity(k)) if k == "A"
        ));
    }

    #[test]
    fn test_enroll_without_faces() {
        let roster = roster();
        let profile = EnrollmentProfile::new("X1", "A", "", "").unwrap();
        let empty = [ProbeExtraction::default(), ProbeExtraction::default()];
        let result = roster.enroll(profile, &empty);
        assert!(matches!(result, Err(RosterError::NoFaceDetected)));
        assert!(roster.identities().unwrap().is_empty());
    }

    #[test]
    fn test_bootstrap_admin_enrolls_as_admin() {
        let roster = Roster::open(
            MemoryStore::new(),
            RoleGovernor::new(Some(roll("BOOT01"))),
            MatchPolicy::default(),
        )
        .unwrap();
        let profile = EnrollmentProfile::new("boot01", "Root", "", "").unwrap();
        let summary = roster.enroll(profile, &[probes(&[1.0], &[1.0])]).unwrap();
        assert_eq!(summary.role, Role::Admin);
        assert_eq!(roster.count_admins().unwrap(), 1);
    }

    #[test]
    fn test_identify_empty_roster() {
        let outcomes = roster().identify(&[emb(&[1.0, 0.0])]).unwrap();
        assert_eq!(outcomes, vec![MatchOutcome::NoRegisteredIdentities]);
    }

    #[test]
    fn test_take_attendance_marks_only_recognized() {
        let roster = roster();
        enroll(&roster, "X1", "A", &[1.0, 0.0]);
        enroll(&roster, "X2", "B", &[0.0, 1.0]);

        let outcomes = roster
            .take_attendance(&[emb(&[1.0, 0.0]), emb(&[-1.0, -1.0])], day())
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(roster.attendance_for(&roll("X1")).unwrap().is_present(day()));
        assert!(!roster.attendance_for(&roll("X2")).unwrap().is_present(day()));
    }

    #[test]
    fn test_check_in() {
        let roster = roster();
        assert!(matches!(
            roster.check_in(&roll("X1"), &[emb(&[1.0, 0.0])], day()),
            Err(RosterError::NoRegisteredIdentities)
        ));

        enroll(&roster, "X1", "Alice", &[1.0, 0.0]);
        enroll(&roster, "X2", "Bob", &[0.0, 1.0]);

        let ok = roster.check_in(&roll("X1"), &[emb(&[1.0, 0.0])], day()).unwrap();
        assert_eq!(ok.name, "Alice");
        assert!(roster.attendance_for(&roll("X1")).unwrap().is_present(day()));

        match roster.check_in(&roll("X1"), &[emb(&[0.0, 1.0])], day()) {
            Err(RosterError::FaceMismatch { detected, claimed }) => {
                assert_eq!(detected, "Bob");
                assert_eq!(claimed, "Alice");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }

        assert!(matches!(
            roster.check_in(&roll("X1"), &[emb(&[-1.0, -1.0])], day()),
            Err(RosterError::NotRecognized { .. })
        ));
        assert!(matches!(
            roster.check_in(&roll("X1"), &[], day()),
            Err(RosterError::NoFaceDetected)
        ));
        assert!(matches!(
            roster.check_in(&roll("NOPE"), &[emb(&[1.0, 0.0])], day()),
            Err(RosterError::NotFound { .. })
        ));
    }

    #[test]
    fn test_verify_compact() {
        let roster = roster();
        enroll(&roster, "X1", "Alice", &[1.0, 0.0]);

        let ok = roster.verify_compact(&roll("X1"), &emb(&[1.0, 0.0])).unwrap();
        assert_eq!(ok.roll.as_str(), "X1");
        assert!(matches!(
            roster.verify_compact(&roll("X1"), &emb(&[3.0, 4.0])),
            Err(RosterError::NotRecognized { .. })
        ));
        assert!(roster.attendance_for(&roll("X1")).unwrap().days.is_empty());
    }

    #[test]
    fn test_demote_until_last_admin() {
        let store = MemoryStore::new();
        insert_raw(&store, 1, "A1", RawRole::Text("admin".into()));
        insert_raw(&store, 2, "A2", RawRole::Text("admin".into()));
        let roster = Roster::open(store, RoleGovernor::default(), MatchPolicy::default()).unwrap();

        assert_eq!(roster.update_role(&roll("A1"), Role::User).unwrap(), Role::User);
        let err = roster.update_role(&roll("A2"), Role::User).unwrap_err();
        assert!(matches!(err, RosterError::LastAdminProtected(LastAdminProtected::Demotion)));
        assert_eq!(roster.count_admins().unwrap(), 1);
        assert_eq!(roster.snapshot().find(&roll("A1")).unwrap().role, Role::User);
    }

    #[test]
    fn test_delete_sole_admin_rejected_user_cascades() {
        let store = MemoryStore::new();
        insert_raw(&store, 1, "ADM", RawRole::Text("admin".into()));
        insert_raw(&store, 2, "USR", RawRole::Absent);
        store.mark_present(&roll("USR"), day()).unwrap();
        let roster = Roster::open(store, RoleGovernor::default(), MatchPolicy::default()).unwrap();

        assert!(matches!(
            roster.delete_identity(&roll("ADM")),
            Err(RosterError::LastAdminProtected(LastAdminProtected::Deletion))
        ));

        roster.delete_identity(&roll("USR")).unwrap();
        assert!(roster.store().attendance(&roll("USR")).unwrap().is_none());
        assert!(roster.snapshot().find(&roll("USR")).is_none());
        assert!(matches!(
            roster.delete_identity(&roll("USR")),
            Err(RosterError::NotFound { .. })
        ));
    }

    #[test]
    fn test_concurrent_demotions_leave_one_admin() {
        let store = MemoryStore::new();
        insert_raw(&store, 1, "A1", RawRole::Text("admin".into()));
        insert_raw(&store, 2, "A2", RawRole::Text("admin".into()));
        let roster = Roster::open(store, RoleGovernor::default(), MatchPolicy::default()).unwrap();
        let barrier = Barrier::new(2);

        let results: Vec<Result<Role, RosterError>> = std::thread::scope(|s| {
            let handles: Vec<_> = ["A1", "A2"]
                .into_iter()
                .map(|code| {
                    let (roster, barrier) = (&roster, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        roster.update_role(&roll(code), Role::User)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(roster.count_admins().unwrap(), 1);
    }

    #[test]
    fn test_mark_present_skips_vanished_identity() {
        let roster = roster();
        assert!(!roster.mark_present(&roll("GHOST"), day()).unwrap());
        assert!(roster.all_attendance().unwrap().is_empty());
    }

    #[test]
    fn test_identity_details_by_name_then_roll() {
        let roster = roster();
        enroll(&roster, "X1", "Alice", &[1.0, 0.0]);

        let by_name = roster.identity_details("Alice").unwrap();
        let by_roll = roster.identity_details("x1").unwrap();
        assert_eq!(by_name, by_roll);
        assert_eq!(by_name.thumbnail.as_deref(), Some(&[0xFF, 0xD8][..]));
        assert!(matches!(
            roster.identity_details("nobody"),
            Err(RosterError::NotFound { .. })
        ));
    }

    #[test]
    fn test_repair_roles() {
        let store = MemoryStore::new();
        insert_raw(&store, 1, "BOOT01", RawRole::from_value(Some(json!({ "role": "user" }))));
        insert_raw(&store, 2, "B", RawRole::Text("superuser".into()));
        insert_raw(&store, 3, "C", RawRole::Text("admin".into()));
        let roster = Roster::open(
            store,
            RoleGovernor::new(Some(roll("BOOT01"))),
            MatchPolicy::default(),
        )
        .unwrap();

        let planned = roster.repair_roles(true).unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(roster.store().role_entries().unwrap()[1].1, RawRole::Text("superuser".into()));

        let applied = roster.repair_roles(false).unwrap();
        assert_eq!(applied, planned);
        assert_eq!(applied[0].repaired, Role::Admin);
        assert_eq!(applied[1].repaired, Role::User);
        assert!(roster.repair_roles(false).unwrap().is_empty());
        assert_eq!(roster.count_admins().unwrap(), 2);
    }

    #[test]
    fn test_status_reports_violations() {
        let store = MemoryStore::new();
        insert_raw(&store, 1, "A", RawRole::Absent);
        store
            .insert_identity(&IdentityDocument {
                id: 2,
                roll: roll("B"),
                name: "b".into(),
                father_name: String::new(),
                phone: String::new(),
                role: RawRole::Absent,
                embeddings: BTreeMap::new(),
                thumbnail: None,
            })
            .unwrap();
        let roster = Roster::open(store, RoleGovernor::default(), MatchPolicy::default()).unwrap();

        let status = roster.status().unwrap();
        assert_eq!(status.identities, 2);
        assert_eq!(status.violations.len(), 2);
        assert_eq!(status.admins, 0);

        assert!(matches!(
            roster.verify_compact(&roll("B"), &emb(&[1.0, 0.0])),
            Err(ref e @ RosterError::MissingReference { .. }) if e.is_integrity()
        ));
    }

    #[test]
    fn test_failed_attendance_delete_still_unpublishes_identity() {
        let roster = failing_roster();
        roster.store().fail_delete_attendance.store(true, Ordering::SeqCst);

        let err = roster.delete_identity(&roll("USR")).unwrap_err();
        assert!(matches!(err, RosterError::Store(_)));
        assert!(roster.store().find_identity(&roll("USR")).unwrap().is_none());
        assert!(roster.snapshot().find(&roll("USR")).is_none());
        assert_eq!(roster.snapshot().len(), 1);
    }

    #[test]
    fn test_failed_attendance_create_still_publishes_identity() {
        let roster = failing_roster();
        roster.store().fail_create_attendance.store(true, Ordering::SeqCst);

        let profile = EnrollmentProfile::new("NEW", "Nia", "", "").unwrap();
        let result = roster.enroll(profile, &[probes(&[0.0, 1.0], &[0.0, 1.0])]);
        assert!(matches!(result, Err(RosterError::Store(_))));
        assert!(roster.store().find_identity(&roll("NEW")).unwrap().is_some());
        assert!(roster.snapshot().find(&roll("NEW")).is_some());

        match &roster.identify(&[emb(&[0.0, 1.0])]).unwrap()[0] {
            MatchOutcome::Recognized { roll, .. } => assert_eq!(roll.as_str(), "NEW"),
            other => panic!("expected recognized, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_rebuild_is_retried_on_next_read() {
        let roster = failing_roster();
        roster.store().fail_identities.store(true, Ordering::SeqCst);

        assert!(matches!(
            roster.delete_identity(&roll("USR")),
            Err(RosterError::Store(_))
        ));
        assert!(roster.snapshot().find(&roll("USR")).is_some());

        roster.store().fail_identities.store(false, Ordering::SeqCst);
        assert!(roster.snapshot().find(&roll("USR")).is_none());
    }
}
