//! Snapshot-based user/grant catalog for MySQL-compatible proxy
//! authentication.
//!
//! A [`catalog::Catalog`] holds an immutable, atomically-swapped snapshot of
//! the backends' `mysql.user`/`mysql.db`/`mysql.tables_priv` tables. A
//! [`loader::Loader`] periodically refreshes it from one or more backend
//! connections; an [`authenticator::Authenticator`] matches client
//! handshakes against the current snapshot without ever touching a backend
//! itself; a [`persist::Persister`] saves and restores the snapshot across
//! restarts.

pub mod authenticator;
pub mod catalog;
pub mod error;
pub mod host_pattern;
pub mod loader;
pub mod password;
pub mod persist;

pub use authenticator::{AuthRequest, AuthResult, Authenticator, AuthenticatorOptions};
pub use catalog::{Catalog, CatalogSnapshot, DbPattern, GrantRow};
pub use error::CatalogError;
pub use host_pattern::HostPattern;
pub use loader::{BackendConnection, BackendTarget, LoadReport, Loader, LoaderOptions, MysqlBackend};
pub use persist::{PersistOptions, Persister};
