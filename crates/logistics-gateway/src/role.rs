//! Role policy: which identity roles satisfy a route's required role.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role carried by an authenticated identity (the identity service's `userType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Customer,
    Driver,
    Admin,
}

/// Role a route demands from its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequiredRole {
    /// Any authenticated customer, driver or admin.
    User,
    Driver,
    Admin,
}

/// Returns true when `role` is allowed on a route requiring `required`.
pub fn satisfies(required: RequiredRole, role: Role) -> bool {
    match required {
        RequiredRole::User => matches!(role, Role::Customer | Role::Driver | Role::Admin),
        RequiredRole::Driver => matches!(role, Role::Driver | Role::Admin),
        RequiredRole::Admin => role == Role::Admin,
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "CUSTOMER",
            Role::Driver => "DRIVER",
            Role::Admin => "ADMIN",
        }
    }
}

impl RequiredRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredRole::User => "USER",
            RequiredRole::Driver => "DRIVER",
            RequiredRole::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for RequiredRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CUSTOMER" => Ok(Role::Customer),
            "DRIVER" => Ok(Role::Driver),
            "ADMIN" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

impl FromStr for RequiredRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(RequiredRole::User),
            "DRIVER" => Ok(RequiredRole::Driver),
            "ADMIN" => Ok(RequiredRole::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ROLES: [Role; 3] = [Role::Customer, Role::Driver, Role::Admin];

    #[test]
    fn test_user_requirement_accepts_every_role() {
        for role in ALL_ROLES {
            assert!(satisfies(RequiredRole::User, role), "{role} should satisfy USER");
        }
    }

    #[test]
    fn test_driver_requirement() {
        assert!(!satisfies(RequiredRole::Driver, Role::Customer));
        assert!(satisfies(RequiredRole::Driver, Role::Driver));
        assert!(satisfies(RequiredRole::Driver, Role::Admin));
    }

    #[test]
    fn test_admin_requirement() {
        assert!(!satisfies(RequiredRole::Admin, Role::Customer));
        assert!(!satisfies(RequiredRole::Admin, Role::Driver));
        assert!(satisfies(RequiredRole::Admin, Role::Admin));
    }

    #[test]
    fn test_parse_roles() {
        assert_eq!("DRIVER".parse::<Role>().unwrap(), Role::Driver);
        assert_eq!("USER".parse::<RequiredRole>().unwrap(), RequiredRole::User);
        // USER is a requirement, never an identity role
        assert!("USER".parse::<Role>().is_err());
        assert!("driver".parse::<Role>().is_err());
    }

    #[test]
    fn test_serde_uses_uppercase_names() {
        let json = serde_json::to_string(&RequiredRole::Admin).unwrap();
        assert_eq!(json, "\"ADMIN\"");
        let role: Role = serde_json::from_str("\"CUSTOMER\"").unwrap();
        assert_eq!(role, Role::Customer);
    }
}
