use crate::engine::EngineError;
use rollcall_core::{RosterError, VisionError};

/// Errors returned over D-Bus as `org.rollcall.Error.*`.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.rollcall.Error")]
pub enum ServiceError {
    #[zbus(error)]
    ZBus(zbus::Error),
    InvalidInput(String),
    NotFound(String),
    LastAdminProtected(String),
    DuplicateIdentity(String),
    NoFaceDetected(String),
    FaceMismatch(String),
    NotRecognized(String),
    NoRegisteredIdentities(String),
    /// Opaque. Details go to the log, never to the caller.
    Internal(String),
}

impl ServiceError {
    pub fn internal() -> Self {
        ServiceError::Internal("internal error".into())
    }
}

impl From<RosterError> for ServiceError {
    fn from(e: RosterError) -> Self {
        if e.is_integrity() {
            tracing::error!(error = %e, "integrity failure");
            return ServiceError::internal();
        }
        let msg = e.to_string();
        match e {
            RosterError::InvalidInput(_) => ServiceError::InvalidInput(msg),
            RosterError::NotFound { .. } => ServiceError::NotFound(msg),
            RosterError::LastAdminProtected(_) => ServiceError::LastAdminProtected(msg),
            RosterError::DuplicateIdentity(_) => ServiceError::DuplicateIdentity(msg),
            RosterError::NoFaceDetected => ServiceError::NoFaceDetected(msg),
            RosterError::FaceMismatch { .. } => ServiceError::FaceMismatch(msg),
            RosterError::NotRecognized { .. } => ServiceError::NotRecognized(msg),
            RosterError::NoRegisteredIdentities => ServiceError::NoRegisteredIdentities(msg),
            RosterError::MissingReference { .. }
            | RosterError::DegenerateVector(_)
            | RosterError::Store(_) => ServiceError::internal(),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Vision(v) if v.is_input_error() => {
                ServiceError::InvalidInput(v.to_string())
            }
            other => {
                tracing::error!(error = %other, "inference failure");
                ServiceError::internal()
            }
        }
    }
}

impl From<VisionError> for ServiceError {
    fn from(e: VisionError) -> Self {
        EngineError::Vision(e).into()
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        tracing::error!(error = %e, "blocking task failed");
        ServiceError::internal()
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        tracing::error!(error = %e, "response serialization failed");
        ServiceError::internal()
    }
}
