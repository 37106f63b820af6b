pub mod config;
pub mod db;
pub mod error;
pub mod policy;

pub use db::{Db, GetDbParams, ModelClient, Record, get_db};
pub use error::WardenError;
pub use policy::{AuthContext, EnhancedDb, PolicySet, enhance};
