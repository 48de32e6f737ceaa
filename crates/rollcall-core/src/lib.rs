//! rollcall-core: face-recognition attendance and role governance.
//!
//! Holds the embedding index, cosine matching, the at-least-one-admin role
//! rules, idempotent attendance marks and enrollment aggregation. Models and
//! persistence plug in through the [`vision`] and [`store`] traits.

pub mod attendance;
pub mod enroll;
pub mod index;
pub mod matcher;
pub mod role;
pub mod roster;
pub mod store;
pub mod types;
pub mod vision;

pub use attendance::{AttendanceRecord, AttendanceRecorder};
pub use enroll::{EnrollError, EnrollmentBuilder, EnrollmentProfile, ProbeExtraction};
pub use index::{EmbeddingIndex, Snapshot};
pub use matcher::{CosineMatcher, MatchOutcome, MatchPolicy, Matcher};
pub use role::{RawRole, Role, RoleGovernor};
pub use roster::{Roster, RosterError};
pub use store::{IdentityDocument, MemoryStore, Store, StoreError};
pub use types::{BoundingBox, Embedding, EmbeddingFamily, RollNumber};
pub use vision::{FaceDetector, FaceEmbedder, FamilyPipeline, VisionError};
