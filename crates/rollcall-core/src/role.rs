//! Role normalization and last-admin protection.
//!
//! Stored roles are untrusted: older records may carry no role, a number,
//! a nested object, or a misspelled string. Every read goes through
//! [`RoleGovernor::normalize`], which is total over [`RawRole`].

use crate::types::RollNumber;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Canonical role. The closed set every stored value normalizes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    /// Role given to identities whose stored role is unusable.
    pub const DEFAULT: Role = Role::User;

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid role: {0:?}")]
pub struct InvalidRole(pub String);

impl FromStr for Role {
    type Err = InvalidRole;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(InvalidRole(s.to_string())),
        }
    }
}

/// A role value exactly as persisted, before normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RawRole {
    /// Field missing or null.
    #[default]
    Absent,
    Text(String),
    /// A nested object where a string was expected.
    Structured(Map<String, Value>),
    /// Any other JSON type (number, bool, array).
    Wrong(Value),
}

impl RawRole {
    pub fn from_value(value: Option<Value>) -> Self {
        match value {
            None | Some(Value::Null) => RawRole::Absent,
            Some(Value::String(s)) => RawRole::Text(s),
            Some(Value::Object(map)) => RawRole::Structured(map),
            Some(other) => RawRole::Wrong(other),
        }
    }

    pub fn to_value(&self) -> Option<Value> {
        match self {
            RawRole::Absent => None,
            RawRole::Text(s) => Some(Value::String(s.clone())),
            RawRole::Structured(map) => Some(Value::Object(map.clone())),
            RawRole::Wrong(v) => Some(v.clone()),
        }
    }

    /// The canonical role this value spells, if it is a well-formed string.
    pub fn canonical(&self) -> Option<Role> {
        match self {
            RawRole::Text(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl From<Role> for RawRole {
    fn from(role: Role) -> Self {
        RawRole::Text(role.as_str().to_string())
    }
}

impl Serialize for RawRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RawRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<Value>::deserialize(deserializer).map(RawRole::from_value)
    }
}

/// Rejection of a role change or deletion that would leave no admin.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastAdminProtected {
    #[error("cannot remove the last admin")]
    Demotion,
    #[error("cannot delete the last admin")]
    Deletion,
}

/// A stored role that does not spell a canonical value, with its replacement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleRepair {
    pub roll: RollNumber,
    pub stored: RawRole,
    pub repaired: Role,
}

/// Normalizes stored roles and enforces the at-least-one-admin invariant.
#[derive(Debug, Clone, Default)]
pub struct RoleGovernor {
    bootstrap_admin: Option<RollNumber>,
}

impl RoleGovernor {
    pub fn new(bootstrap_admin: Option<RollNumber>) -> Self {
        Self { bootstrap_admin }
    }

    pub fn bootstrap_admin(&self) -> Option<&RollNumber> {
        self.bootstrap_admin.as_ref()
    }

    fn is_bootstrap(&self, roll: &RollNumber) -> bool {
        self.bootstrap_admin.as_ref() == Some(roll)
    }

    /// Map any stored role to a canonical one. Never fails.
    ///
    /// A well-formed string wins. Otherwise the bootstrap admin gets
    /// `Admin` and everybody else gets [`Role::DEFAULT`].
    pub fn normalize(&self, raw: &RawRole, roll: &RollNumber) -> Role {
        if let Some(role) = raw.canonical() {
            return role;
        }

        match raw {
            RawRole::Absent => tracing::debug!(roll = %roll, "stored role missing"),
            other => tracing::warn!(roll = %roll, raw = ?other, "malformed stored role"),
        }

        self.fallback(roll)
    }

    fn fallback(&self, roll: &RollNumber) -> Role {
        if self.is_bootstrap(roll) {
            Role::Admin
        } else {
            Role::DEFAULT
        }
    }

    /// Role persisted for a freshly enrolled identity.
    pub fn initial_role(&self, roll: &RollNumber) -> Role {
        self.fallback(roll)
    }

    /// Number of identities whose normalized role is `Admin`.
    pub fn count_admins<'a, I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (&'a RollNumber, &'a RawRole)>,
    {
        entries
            .into_iter()
            .filter(|(roll, raw)| self.normalize(raw, roll) == Role::Admin)
            .count()
    }

    /// Reject iff the change would demote the last remaining admin.
    pub fn authorize_role_change(
        current: Role,
        requested: Role,
        admin_count: usize,
    ) -> Result<(), LastAdminProtected> {
        if current == Role::Admin && requested != Role::Admin && admin_count <= 1 {
            return Err(LastAdminProtected::Demotion);
        }
        Ok(())
    }

    /// Deletion removes the role entirely, so any admin deletion counts as a demotion.
    pub fn authorize_deletion(current: Role, admin_count: usize) -> Result<(), LastAdminProtected> {
        if current == Role::Admin && admin_count <= 1 {
            return Err(LastAdminProtected::Deletion);
        }
        Ok(())
    }

    /// Stored roles that need rewriting to their normalized value.
    pub fn plan_repairs(&self, entries: &[(RollNumber, RawRole)]) -> Vec<RoleRepair> {
        entries
            .iter()
            .filter(|(_, raw)| raw.canonical().is_none())
            .map(|(roll, raw)| RoleRepair {
                roll: roll.clone(),
                stored: raw.clone(),
                repaired: self.fallback(roll),
            })
            .collect()
    }
}
