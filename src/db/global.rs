//! Process-wide client handles.
//!
//! Both handles are built on first request and live until [`shutdown`] closes the pool.
//! A failed build is returned to the caller and leaves the cell empty, so the next call
//! tries again rather than handing out a half-built client.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::CONFIG;
use crate::db::client::{Db, GetDbParams, get_db};
use crate::error::WardenError;
use crate::policy::{AuthContext, EnhancedDb, PolicySet, enhance};

static CLIENT: OnceCell<Db> = OnceCell::const_new();
static ENHANCED: OnceCell<EnhancedDb> = OnceCell::const_new();

/// The shared raw client, built from `DIRECT_URL`.
pub async fn client() -> Result<&'static Db, WardenError> {
    CLIENT
        .get_or_try_init(|| async {
            let params =
                GetDbParams::new(CONFIG.direct_url.clone()).with_pool(CONFIG.pool_settings());
            get_db(params)
        })
        .await
}

/// The shared policy-enforcing client: the raw client seen by an anonymous caller.
pub async fn enhanced_client() -> Result<&'static EnhancedDb, WardenError> {
    ENHANCED
        .get_or_try_init(|| async {
            let db = client().await?;
            let policy = match CONFIG.policy_path.as_deref() {
                Some(path) => {
                    let set = PolicySet::from_toml_file(path)?;
                    info!(path = %path.display(), models = set.models.len(), "access policy loaded");
                    set
                }
                None => {
                    info!("no POLICY_PATH configured; enhanced client denies every operation");
                    PolicySet::deny_all()
                }
            };
            Ok::<_, WardenError>(enhance(db, Arc::new(policy), AuthContext::anonymous()))
        })
        .await
}

/// Close the shared pool if it was ever built.
pub async fn shutdown() {
    if let Some(db) = CLIENT.get() {
        db.close().await;
    }
}
