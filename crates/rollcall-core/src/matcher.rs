//! Similarity search of a probe embedding against a snapshot gallery.

use crate::index::{Snapshot, SnapshotEntry};
use crate::role::Role;
use crate::types::{DegenerateVector, Embedding, EmbeddingFamily, RollNumber};
use serde::{Deserialize, Serialize};

/// Result of matching one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchOutcome {
    Recognized {
        id: u64,
        roll: RollNumber,
        name: String,
        similarity: f32,
        role: Role,
    },
    /// Best candidate did not clear the threshold.
    Unknown { similarity: f32 },
    /// The gallery was empty; nothing was compared.
    NoRegisteredIdentities,
}

impl MatchOutcome {
    pub fn roll(&self) -> Option<&RollNumber> {
        match self {
            MatchOutcome::Recognized { roll, .. } => Some(roll),
            _ => None,
        }
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self, MatchOutcome::Recognized { .. })
    }
}

/// Acceptance threshold per embedding family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub general: f32,
    pub compact: f32,
}

impl MatchPolicy {
    pub fn threshold(&self, family: EmbeddingFamily) -> f32 {
        match family {
            EmbeddingFamily::General => self.general,
            EmbeddingFamily::Compact => self.compact,
        }
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            general: EmbeddingFamily::General.default_threshold(),
            compact: EmbeddingFamily::Compact.default_threshold(),
        }
    }
}

/// Strategy for comparing a probe embedding against a snapshot gallery.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        snapshot: &Snapshot,
        family: EmbeddingFamily,
        threshold: f32,
    ) -> Result<MatchOutcome, DegenerateVector>;

    /// One outcome per probe, in probe order.
    fn compare_all(
        &self,
        probes: &[Embedding],
        snapshot: &Snapshot,
        family: EmbeddingFamily,
        threshold: f32,
    ) -> Result<Vec<MatchOutcome>, DegenerateVector> {
        probes
            .iter()
            .map(|probe| self.compare(probe, snapshot, family, threshold))
            .collect()
    }
}

/// Exhaustive cosine similarity matcher.
///
/// Always visits every gallery entry. The best entry only changes on a
/// strictly greater similarity, so ties go to the earliest entry in
/// snapshot order (ascending identity id). Acceptance is strict: a
/// similarity equal to the threshold is rejected.
pub struct CosineMatcher;

impl CosineMatcher {
    /// 1:1 check of a probe against a single reference.
    pub fn verify(
        probe: &Embedding,
        reference: &Embedding,
        threshold: f32,
    ) -> Result<(bool, f32), DegenerateVector> {
        let similarity = probe.similarity(reference)?;
        Ok((similarity > threshold, similarity))
    }
}

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        snapshot: &Snapshot,
        family: EmbeddingFamily,
        threshold: f32,
    ) -> Result<MatchOutcome, DegenerateVector> {
        let mut best: Option<(f32, &SnapshotEntry)> = None;

        for (entry, reference) in snapshot.gallery(family) {
            let sim = probe.similarity(reference)?;
            let is_better = match best {
                None => true,
                Some((best_sim, _)) => sim > best_sim,
            };
            if is_better {
                best = Some((sim, entry));
            }
        }

        Ok(match best {
            None => MatchOutcome::NoRegisteredIdentities,
            Some((similarity, entry)) if similarity > threshold => MatchOutcome::Recognized {
                id: entry.id,
                roll: entry.roll.clone(),
                name: entry.name.clone(),
                similarity,
                role: entry.role,
            },
            Some((similarity, _)) => MatchOutcome::Unknown { similarity },
        })
    }
}
