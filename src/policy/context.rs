use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The caller a policy is evaluated for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user: Option<AuthUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    /// Compared against owner columns, so it must have the column's JSON shape.
    pub id: Value,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl AuthContext {
    /// No current user. Only rules that hold for unauthenticated callers grant access.
    pub fn anonymous() -> Self {
        Self { user: None }
    }

    pub fn user(user: AuthUser) -> Self {
        Self { user: Some(user) }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user.is_none()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.user
            .as_ref()
            .is_some_and(|u| u.roles.iter().any(|r| r == role))
    }
}

impl AuthUser {
    pub fn new(id: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}
