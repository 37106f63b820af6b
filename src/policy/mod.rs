//! Access-policy layer wrapped around a [`crate::db::Db`].

pub mod context;
pub mod enhanced;
pub mod rules;

pub use context::{AuthContext, AuthUser};
pub use enhanced::{EnhancedDb, enhance};
pub use rules::{FieldPolicy, ModelPolicy, Operation, OperationRules, PolicySet, Rule};
