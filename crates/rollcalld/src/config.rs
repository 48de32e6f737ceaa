use rollcall_core::{MatchPolicy, RollNumber};
use rollcall_vision::VisionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "system" => Ok(BusKind::System),
            "session" => Ok(BusKind::Session),
            other => Err(format!("expected system or session, got {other:?}")),
        }
    }
}

/// Optional TOML base layer. Every key mirrors a `ROLLCALL_*` variable.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    general_threshold: Option<f32>,
    compact_threshold: Option<f32>,
    bootstrap_admin: Option<String>,
    enroll_probes: Option<usize>,
    detector_confidence: Option<f32>,
    compact_min_face: Option<f32>,
    bus: Option<BusKind>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

/// Daemon configuration: TOML file, then `ROLLCALL_*` overrides, then defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Acceptance threshold per embedding family.
    pub policy: MatchPolicy,
    /// Identity that always normalizes to admin.
    pub bootstrap_admin: Option<RollNumber>,
    /// Probe images required per registration.
    pub enroll_probes: usize,
    pub detector_confidence: f32,
    /// Minimum face edge in pixels for the compact family.
    pub compact_min_face: f32,
    pub bus: BusKind,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                tracing::info!(path = %path.display(), "reading config file");
                FileConfig::read(&path)?
            }
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("rollcall.db"));

        let defaults = MatchPolicy::default();
        let policy = MatchPolicy {
            general: env_parse(&env, "ROLLCALL_GENERAL_THRESHOLD")?
                .or(file.general_threshold)
                .unwrap_or(defaults.general),
            compact: env_parse(&env, "ROLLCALL_COMPACT_THRESHOLD")?
                .or(file.compact_threshold)
                .unwrap_or(defaults.compact),
        };
        for (key, value) in [
            ("general_threshold", policy.general),
            ("compact_threshold", policy.compact),
        ] {
            if !(-1.0..1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{value} is outside [-1, 1)"),
                });
            }
        }

        let bootstrap_admin = env("ROLLCALL_BOOTSTRAP_ADMIN")
            .or(file.bootstrap_admin)
            .filter(|s| !s.trim().is_empty())
            .map(|s| RollNumber::new(&s))
            .transpose()
            .map_err(|e| ConfigError::Invalid {
                key: "bootstrap_admin",
                reason: e.to_string(),
            })?;

        let enroll_probes = env_parse(&env, "ROLLCALL_ENROLL_PROBES")?
            .or(file.enroll_probes)
            .unwrap_or(5);
        if enroll_probes == 0 {
            return Err(ConfigError::Invalid {
                key: "enroll_probes",
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            model_dir,
            db_path,
            policy,
            bootstrap_admin,
            enroll_probes,
            detector_confidence: env_parse(&env, "ROLLCALL_DETECTOR_CONFIDENCE")?
                .or(file.detector_confidence)
                .unwrap_or(0.7),
            compact_min_face: env_parse(&env, "ROLLCALL_COMPACT_MIN_FACE")?
                .or(file.compact_min_face)
                .unwrap_or(100.0),
            bus: env_parse(&env, "ROLLCALL_BUS")?
                .or(file.bus)
                .unwrap_or(BusKind::System),
        })
    }

    pub fn vision(&self) -> VisionConfig {
        VisionConfig {
            model_dir: self.model_dir.clone(),
            detector_confidence: self.detector_confidence,
            compact_min_face: self.compact_min_face,
        }
    }
}

fn env_parse<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|v| {
            v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: format!("{v:?}: {e}"),
            })
        })
        .transpose()
}
