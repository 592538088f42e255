//! `arca-configd`: the transactional configuration datastore and
//! exclusive-editing lock manager for an `arca-router` device.
//!
//! This crate owns the hard part of router configuration management: a
//! versioned configuration document (a stable *running* configuration plus
//! per-session *candidate* drafts), an atomic commit/rollback engine, and a
//! distributed, lease-bound mutual-exclusion lock that survives process
//! crashes and clock skew — all presented identically over two storage
//! engines, an embedded WAL-journaled SQLite database and a replicated
//! etcd cluster.
//!
//! Out of scope, by design: the interactive CLI parser, hierarchy
//! pretty-printing, CLI command dispatch, and integration with the
//! data-plane daemons that consume the running configuration. Callers
//! embed this crate and build those concerns on top of [`ConfigStore`],
//! [`session::Session`], and [`commit`].

pub mod audit;
pub mod commit;
pub mod config;
pub mod diff;
pub mod error;
pub mod lock;
pub mod parser;
pub mod session;
pub mod shutdown;
pub mod storage;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

pub use error::{Error, Result};
pub use storage::ConfigStore;

use config::{Backend, StoreConfig};

/// Construct the configured [`ConfigStore`] backend, connecting to etcd or
/// opening the SQLite database as appropriate (§4.1, §6).
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ConfigStore>> {
    match config.backend {
        Backend::Sqlite => {
            let store = storage::sqlite::SqliteStore::open(&config.sqlite.path).await?;
            Ok(Arc::new(store))
        }
        Backend::Etcd => {
            config.etcd.validate()?;
            let connect_opts = storage::etcd::EtcdConnectOptions::from(&config.etcd);
            let store = storage::etcd::open(&connect_opts).await?;
            Ok(Arc::new(store))
        }
    }
}

/// The default per-operation I/O deadline threaded through [`ConfigStore`]
/// calls made without a more specific budget (§5).
#[must_use]
pub const fn default_io_timeout() -> Duration {
    storage::DEFAULT_IO_TIMEOUT
}
