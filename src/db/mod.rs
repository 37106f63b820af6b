//! Database module: client factory, model operations and the process-wide handles.
//!
//! Layout:
//! - `client.rs`: `get_db` factory and the `Db` handle bound to its pool
//! - `query.rs`: SQL construction over JSON records
//! - `model.rs`: `ModelClient` operations, implemented by `Db`
//! - `global.rs`: lazily built singletons and pool shutdown

pub mod client;
pub mod global;
pub mod model;
pub mod query;

pub use client::{Db, GetDbParams, PoolSettings, get_db};
pub use global::{client, enhanced_client, shutdown};
pub use model::ModelClient;
pub use query::{Record, RowScope};
