//! Roles and the single authorization check for service operations.
//!
//! Every edit and timer-control path consults [`authorize`]; nothing else
//! derives capability from a role.

use serde::{Deserialize, Serialize};

use crate::agenda::{Service, UserId};

/// Role claim issued by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full access to every service.
    Admin,
    /// Plans services; full access to every service.
    Planner,
    /// Access only to services that list them in `editable_by`.
    Volunteer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Planner => write!(f, "planner"),
            Self::Volunteer => write!(f, "volunteer"),
        }
    }
}

/// Error returned when parsing an unknown role name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "planner" => Ok(Self::Planner),
            "volunteer" => Ok(Self::Volunteer),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Provider-issued user id.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Trusted role claim.
    pub role: Role,
}

impl UserIdentity {
    /// Creates an identity.
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
            role,
        }
    }
}

/// What a caller wants to do with a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    /// Change the service or its agenda.
    Edit,
    /// Issue timer control commands.
    ControlTimer,
}

/// Whether `user` holds `capability` on `service`.
///
/// Admins and planners always do. Volunteers only when their id is in the
/// service's `editable_by` set. Both capabilities currently share this rule.
#[must_use]
pub fn authorize(user: &UserIdentity, service: &Service, capability: Capability) -> bool {
    match (user.role, capability) {
        (Role::Admin | Role::Planner, _) => true,
        (Role::Volunteer, Capability::Edit | Capability::ControlTimer) => {
            service.editable_by.contains(&user.id)
        }
    }
}

/// Shorthand for [`authorize`] with [`Capability::Edit`].
#[must_use]
pub fn can_edit(user: &UserIdentity, service: &Service) -> bool {
    authorize(user, service, Capability::Edit)
}

/// Shorthand for [`authorize`] with [`Capability::ControlTimer`].
#[must_use]
pub fn can_control_timer(user: &UserIdentity, service: &Service) -> bool {
    authorize(user, service, Capability::ControlTimer)
}
