use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role attached to an inbound caller by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerRole {
    Administrator,
    Teacher,
    Parent,
}

impl CallerRole {
    pub const fn label(self) -> &'static str {
        match self {
            CallerRole::Administrator => "administrator",
            CallerRole::Teacher => "teacher",
            CallerRole::Parent => "parent",
        }
    }
}

impl FromStr for CallerRole {
    type Err = AuthorizationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" | "administrator" => Ok(Self::Administrator),
            "teacher" => Ok(Self::Teacher),
            "parent" => Ok(Self::Parent),
            other => Err(AuthorizationError::UnknownRole(other.to_string())),
        }
    }
}

/// Operations exposed over a transport that require a role check first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    IssueConsent,
    ViewClassConsents,
    SubmitConsent,
    ViewOwnConsents,
    ViewStatusReport,
    ViewFleetReport,
    TriggerSweep,
    ManageEnrollment,
}

impl Capability {
    pub const fn allowed_roles(self) -> &'static [CallerRole] {
        match self {
            Capability::IssueConsent | Capability::ViewClassConsents => &[CallerRole::Teacher],
            Capability::SubmitConsent | Capability::ViewOwnConsents => &[CallerRole::Parent],
            Capability::ViewStatusReport => &[CallerRole::Teacher, CallerRole::Administrator],
            Capability::ViewFleetReport
            | Capability::TriggerSweep
            | Capability::ManageEnrollment => &[CallerRole::Administrator],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    #[error("caller is not authenticated")]
    Unauthenticated,
    #[error("unknown role '{0}'")]
    UnknownRole(String),
    #[error("role {role} may not perform this action; requires one of: {required}")]
    Forbidden { role: &'static str, required: String },
}

/// Check a capability before dispatching to the lifecycle core.
pub fn ensure_capability(
    role: Option<CallerRole>,
    capability: Capability,
) -> Result<CallerRole, AuthorizationError> {
    let role = role.ok_or(AuthorizationError::Unauthenticated)?;
    let allowed = capability.allowed_roles();
    if allowed.contains(&role) {
        return Ok(role);
    }

    Err(AuthorizationError::Forbidden {
        role: role.label(),
        required: allowed
            .iter()
            .map(|role| role.label())
            .collect::<Vec<_>>()
            .join(", "),
    })
}
