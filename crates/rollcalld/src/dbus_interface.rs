use crate::engine::EngineHandle;
use crate::error::ServiceError;
use crate::store::SqliteStore;
use base64::Engine as _;
use rollcall_core::attendance::{format_day, today, AttendanceRecord};
use rollcall_core::roster::{CheckIn, RosterError};
use rollcall_core::{EmbeddingFamily, EnrollmentProfile, MatchOutcome, Role, RollNumber, Roster};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    roster: Arc<Roster<SqliteStore>>,
    engine: EngineHandle,
    enroll_probes: usize,
}

impl RollcallService {
    pub fn new(
        roster: Arc<Roster<SqliteStore>>,
        engine: EngineHandle,
        enroll_probes: usize,
    ) -> Self {
        Self {
            roster,
            engine,
            enroll_probes,
        }
    }

    /// Run a roster operation on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&Roster<SqliteStore>) -> Result<T, RosterError> + Send + 'static,
        T: Send + 'static,
    {
        let roster = Arc::clone(&self.roster);
        Ok(tokio::task::spawn_blocking(move || f(roster.as_ref())).await??)
    }

    async fn do_register(
        &self,
        roll: &str,
        name: &str,
        father_name: &str,
        phone: &str,
        images: Vec<Vec<u8>>,
    ) -> Result<Value, ServiceError> {
        let profile =
            EnrollmentProfile::new(roll, name, father_name, phone).map_err(RosterError::from)?;
        if images.len() < self.enroll_probes {
            return Err(ServiceError::InvalidInput(format!(
                "{} images required, got {}",
                self.enroll_probes,
                images.len()
            )));
        }

        let (check_roll, check_name) = (profile.roll.clone(), profile.name.clone());
        self.blocking(move |r| r.ensure_unique(&check_roll, &check_name))
            .await?;

        let extractions = self.engine.extract(images).await?;
        let summary = self
            .blocking(move |r| r.enroll(profile, &extractions))
            .await?;

        Ok(json!({
            "message": "user registered successfully",
            "id": summary.id,
            "roll": summary.roll,
            "name": summary.name,
            "role": summary.role,
        }))
    }

    async fn do_login(&self, roll: &str, image: Vec<u8>) -> Result<Value, ServiceError> {
        let claimed = parse_roll(roll)?;
        if self.roster.snapshot().is_empty() {
            return Err(RosterError::NoRegisteredIdentities.into());
        }
        let lookup = claimed.clone();
        self.blocking(move |r| r.require_enrolled(&lookup)).await?;

        let probes = self.engine.identify(image).await?;
        let check_in = self
            .blocking(move |r| r.check_in(&claimed, &probes, today()))
            .await?;
        Ok(check_in_view(&check_in))
    }

    async fn do_compact_login(&self, roll: &str, image: Vec<u8>) -> Result<Value, ServiceError> {
        let claimed = parse_roll(roll)?;
        let lookup = claimed.clone();
        self.blocking(move |r| r.require_enrolled(&lookup)).await?;

        let probe = self
            .engine
            .embed_first(EmbeddingFamily::Compact, image)
            .await?
            .ok_or(RosterError::NoFaceDetected)?;
        let check_in = self
            .blocking(move |r| r.verify_compact(&claimed, &probe))
            .await?;
        Ok(check_in_view(&check_in))
    }

    /// Match every face in `image`. Recognized identities are marked present
    /// when `mark` is set.
    async fn do_recognize(&self, image: Vec<u8>, mark: bool) -> Result<Value, ServiceError> {
        if image.is_empty() {
            return Err(ServiceError::InvalidInput("image is required".into()));
        }
        if self.roster.snapshot().is_empty() {
            return Ok(json!([outcome_view(&MatchOutcome::NoRegisteredIdentities)]));
        }

        let probes = self.engine.identify(image).await?;
        if probes.is_empty() {
            return Err(RosterError::NoFaceDetected.into());
        }

        let outcomes = self
            .blocking(move |r| {
                if mark {
                    r.take_attendance(&probes, today())
                } else {
                    r.identify(&probes)
                }
            })
            .await?;

        tracing::info!(
            faces = outcomes.len(),
            recognized = outcomes.iter().filter(|o| o.is_recognized()).count(),
            mark,
            "recognition complete"
        );
        Ok(Value::Array(outcomes.iter().map(outcome_view).collect()))
    }

    async fn do_list_users(&self) -> Result<Value, ServiceError> {
        let users = self.blocking(|r| r.identities()).await?;
        Ok(json!({ "count": users.len(), "users": users }))
    }

    async fn do_update_role(&self, roll: &str, role: &str) -> Result<Value, ServiceError> {
        let roll = parse_roll(roll)?;
        let requested: Role = role.parse().map_err(RosterError::from)?;
        let target = roll.clone();
        let role = self
            .blocking(move |r| r.update_role(&target, requested))
            .await?;
        Ok(json!({
            "message": format!("role of {roll} updated to {role}"),
            "role": role,
        }))
    }

    async fn do_delete_user(&self, roll: &str) -> Result<Value, ServiceError> {
        let roll = parse_roll(roll)?;
        let target = roll.clone();
        self.blocking(move |r| r.delete_identity(&target)).await?;
        Ok(json!({ "message": format!("user {roll} deleted") }))
    }

    async fn do_user_details(&self, key: &str) -> Result<Value, ServiceError> {
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(ServiceError::InvalidInput("name or roll number is required".into()));
        }
        let details = self.blocking(move |r| r.identity_details(&key)).await?;

        let mut view = serde_json::to_value(&details)?;
        view["thumbnail"] = match &details.thumbnail {
            Some(jpeg) => Value::String(base64::engine::general_purpose::STANDARD.encode(jpeg)),
            None => Value::Null,
        };
        Ok(json!({ "details": view }))
    }

    async fn do_user_attendance(&self, roll: &str) -> Result<Value, ServiceError> {
        let roll = parse_roll(roll)?;
        let record = self.blocking(move |r| r.attendance_for(&roll)).await?;
        Ok(days_view(&record))
    }

    async fn do_attendance(&self) -> Result<Value, ServiceError> {
        let records = self.blocking(|r| r.all_attendance()).await?;
        let attendance: Vec<Value> = records
            .iter()
            .map(|record| {
                json!({
                    "roll": record.roll,
                    "id": record.identity_id,
                    "days": days_view(record),
                })
            })
            .collect();
        Ok(json!({ "attendance": attendance }))
    }

    async fn do_repair_roles(&self, dry_run: bool) -> Result<Value, ServiceError> {
        let repairs = self.blocking(move |r| r.repair_roles(dry_run)).await?;
        Ok(json!({ "dry_run": dry_run, "repairs": repairs }))
    }

    async fn do_status(&self) -> Result<Value, ServiceError> {
        let status = self.blocking(|r| r.status()).await?;
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": status.identities,
            "admins": status.admins,
            "integrity_violations": status.violations,
            "thresholds": status.thresholds,
            "bootstrap_admin": status.bootstrap_admin,
            "enroll_probes": self.enroll_probes,
        }))
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Enroll a new identity from several probe images.
    async fn register(
        &self,
        roll: &str,
        name: &str,
        father_name: &str,
        phone: &str,
        images: Vec<Vec<u8>>,
    ) -> Result<String, ServiceError> {
        tracing::info!(roll, images = images.len(), "register requested");
        Ok(self
            .do_register(roll, name, father_name, phone, images)
            .await?
            .to_string())
    }

    /// Check in as `roll`: the first face in `image` must be that identity.
    async fn login(&self, roll: &str, image: Vec<u8>) -> Result<String, ServiceError> {
        tracing::info!(roll, "login requested");
        Ok(self.do_login(roll, image).await?.to_string())
    }

    /// 1:1 verification against `roll` with the compact family.
    async fn compact_login(&self, roll: &str, image: Vec<u8>) -> Result<String, ServiceError> {
        tracing::info!(roll, "compact login requested");
        Ok(self.do_compact_login(roll, image).await?.to_string())
    }

    /// Recognize every face and mark recognized identities present.
    async fn recognize(&self, image: Vec<u8>) -> Result<String, ServiceError> {
        tracing::info!("recognize requested");
        Ok(self.do_recognize(image, true).await?.to_string())
    }

    /// Recognize every face without touching attendance.
    async fn identify(&self, image: Vec<u8>) -> Result<String, ServiceError> {
        tracing::info!("identify requested");
        Ok(self.do_recognize(image, false).await?.to_string())
    }

    async fn list_users(&self) -> Result<String, ServiceError> {
        Ok(self.do_list_users().await?.to_string())
    }

    async fn update_role(&self, roll: &str, role: &str) -> Result<String, ServiceError> {
        tracing::info!(roll, role, "update_role requested");
        Ok(self.do_update_role(roll, role).await?.to_string())
    }

    async fn delete_user(&self, roll: &str) -> Result<String, ServiceError> {
        tracing::info!(roll, "delete_user requested");
        Ok(self.do_delete_user(roll).await?.to_string())
    }

    /// Stored fields by display name or roll, thumbnail as base64 JPEG.
    async fn user_details(&self, key: &str) -> Result<String, ServiceError> {
        Ok(self.do_user_details(key).await?.to_string())
    }

    async fn user_attendance(&self, roll: &str) -> Result<String, ServiceError> {
        Ok(self.do_user_attendance(roll).await?.to_string())
    }

    async fn attendance(&self) -> Result<String, ServiceError> {
        Ok(self.do_attendance().await?.to_string())
    }

    /// Rewrite malformed stored roles. Nothing is written when `dry_run` is set.
    async fn repair_roles(&self, dry_run: bool) -> Result<String, ServiceError> {
        tracing::info!(dry_run, "repair_roles requested");
        Ok(self.do_repair_roles(dry_run).await?.to_string())
    }

    async fn status(&self) -> Result<String, ServiceError> {
        Ok(self.do_status().await?.to_string())
    }
}

fn parse_roll(roll: &str) -> Result<RollNumber, ServiceError> {
    Ok(RollNumber::new(roll).map_err(RosterError::from)?)
}

fn check_in_view(check_in: &CheckIn) -> Value {
    json!({
        "name": check_in.name,
        "probability": check_in.similarity,
        "role": check_in.role,
    })
}

fn outcome_view(outcome: &MatchOutcome) -> Value {
    match outcome {
        MatchOutcome::Recognized {
            roll,
            name,
            similarity,
            role,
            ..
        } => json!({
            "status": "recognized",
            "roll": roll,
            "name": name,
            "probability": similarity,
            "role": role,
        }),
        MatchOutcome::Unknown { similarity } => json!({
            "status": "unknown",
            "name": "Unknown",
            "probability": similarity,
            "role": "unknown",
        }),
        MatchOutcome::NoRegisteredIdentities => json!({
            "status": "no_registered_identities",
            "name": "No registered faces",
            "probability": 0.0,
            "role": "unknown",
        }),
    }
}

fn days_view(record: &AttendanceRecord) -> Value {
    let days: Map<String, Value> = record
        .days
        .iter()
        .map(|(day, present)| (format_day(*day), Value::Bool(*present)))
        .collect();
    Value::Object(days)
}
