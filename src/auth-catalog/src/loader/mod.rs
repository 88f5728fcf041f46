//! Refreshing the catalog from one or more backend servers.
//!
//! `Loader` is generic over [`BackendConnection`], the capability to ask a
//! backend server the handful of questions a refresh needs. `MysqlBackend`
//! (below) is the concrete implementor built on `mysql_async`; tests use a
//! hand-rolled stub implementor instead of standing up a real server.

mod mysql_backend;

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, DbPattern, GrantRow};
use crate::error::CatalogError;
use crate::host_pattern::HostPattern;
use crate::password::OLD_PASSWORD_HASH_LEN;

pub use mysql_backend::MysqlBackend;

/// Address and per-operation timeouts for one backend server.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub addr: String,
    pub connect_timeout: std::time::Duration,
    pub read_timeout: std::time::Duration,
    pub write_timeout: std::time::Duration,
}

/// Which column holds the password hash on this server's `mysql.user` table.
/// MySQL 5.7 and earlier use `Password`; 8.0 and MariaDB use
/// `authentication_string`. The loader picks this from the server's reported
/// version before running the grant query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordColumn {
    Password,
    AuthenticationString,
}

/// One grant row as reported by a backend, before host/password parsing.
///
/// Mirrors one line of the grant query's result set: a `u.user`/`u.host`
/// pair, the `d.db`/`t.db` column from whichever side of the `UNION` this row
/// came from (`None` when the `LEFT JOIN` found no matching `mysql.db`/
/// `mysql.tables_priv` row), `u.select_priv`, and the password column chosen
/// for this server's version.
#[derive(Debug, Clone)]
pub struct RawGrantRow {
    pub user: String,
    pub host: String,
    /// The joined `db` column, still carrying any `%`/`_` wildcard. `None`
    /// when the `LEFT JOIN` produced no row — i.e. this user/host pair holds
    /// no per-database grant at all.
    pub db: Option<String>,
    /// `u.select_priv == "Y"`: this account may access any database
    /// regardless of `db`.
    pub anydb: bool,
    /// The password column value exactly as stored by the server: empty for
    /// a passwordless account, otherwise a leading `*` followed by 40 hex
    /// digits (stripped and decoded into raw bytes during loading).
    pub password_column: String,
}

/// The capability the loader needs from a backend connection. Implemented by
/// [`MysqlBackend`] for real servers and by hand-rolled stubs in tests.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    async fn server_version(&self) -> Result<String, CatalogError>;
    async fn check_select(&self, table: &str) -> Result<(), CatalogError>;
    async fn grant_rows(
        &self,
        pw_column: PasswordColumn,
        include_root: bool,
    ) -> Result<Vec<RawGrantRow>, CatalogError>;
    async fn show_databases(&self) -> Result<Vec<String>, CatalogError>;
}

/// Knobs controlling how a refresh treats individual rows.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Skip the zero-row sanity `SELECT` against each grant table before the
    /// real query. Intended for backends known to restrict `SHOW GRANTS`
    /// output in a way that would otherwise abort an entire server's load.
    pub skip_permission_checks: bool,
    /// Strip a literal `\%`/`\_` SQL escape from a database pattern before
    /// matching the wildcard, leaving the literal character in place.
    pub strip_db_esc: bool,
    /// Load the `root` account's rows. Defaults to `false`: most deployments
    /// don't want to expose `root` through the proxy's own auth path.
    pub enable_root: bool,
    /// Union rows from every configured backend rather than stopping at the
    /// first one that answers. When `false`, later servers are only tried if
    /// an earlier one is unreachable.
    pub users_from_all: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            skip_permission_checks: false,
            strip_db_esc: true,
            enable_root: false,
            users_from_all: true,
        }
    }
}

/// Outcome of attempting to load from one configured backend.
#[derive(Debug)]
pub enum ServerLoadOutcome {
    Success { addr: String, rows_loaded: usize },
    Failed { addr: String, error: CatalogError },
}

/// Summary of a full `load`/`refresh` call, across all configured backends.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub rows_loaded: usize,
    pub databases_loaded: usize,
    pub per_server: Vec<ServerLoadOutcome>,
}

/// Drives a full catalog refresh against a set of backend connections.
pub struct Loader {
    options: LoaderOptions,
}

impl Loader {
    pub fn new(options: LoaderOptions) -> Self {
        Self { options }
    }

    /// Load grant rows from `backends` and install the resulting snapshot
    /// into `catalog`. Equivalent to `refresh`; both exist because the host
    /// calls `load` once at startup before the first request can be served,
    /// and `refresh` periodically afterward — the behavior is identical.
    pub async fn load(
        &self,
        catalog: &Catalog,
        backends: &[(BackendTarget, Box<dyn BackendConnection>)],
    ) -> LoadReport {
        self.refresh(catalog, backends).await
    }

    pub async fn refresh(
        &self,
        catalog: &Catalog,
        backends: &[(BackendTarget, Box<dyn BackendConnection>)],
    ) -> LoadReport {
        let mut rows: Vec<GrantRow> = Vec::new();
        let mut databases: HashSet<String> = HashSet::new();
        let mut saw_anonymous_user = false;
        let mut per_server = Vec::with_capacity(backends.len());

        for (target, conn) in backends {
            match self.load_one(conn.as_ref(), &mut databases).await {
                Ok((server_rows, server_saw_anonymous_user)) => {
                    saw_anonymous_user |= server_saw_anonymous_user;
                    info!(addr = %target.addr, rows = server_rows.len(), "loaded grant rows from backend");
                    per_server.push(ServerLoadOutcome::Success {
                        addr: target.addr.clone(),
                        rows_loaded: server_rows.len(),
                    });
                    rows.extend(server_rows);
                    if !self.options.users_from_all {
                        break;
                    }
                }
                Err(error) => {
                    warn!(addr = %target.addr, %error, "failed to load from backend");
                    per_server.push(ServerLoadOutcome::Failed {
                        addr: target.addr.clone(),
                        error,
                    });
                }
            }
        }

        let report = LoadReport {
            rows_loaded: rows.len(),
            databases_loaded: databases.len(),
            per_server,
        };
        // An anonymous-user row (empty `user`) appearing anywhere disables
        // the synthesized `localhost` wildcard-host match; its absence
        // enables it.
        catalog.replace_all(rows, databases, !saw_anonymous_user);
        report
    }

    /// Run the per-server load algorithm: sanity checks, grant query, row
    /// parsing, database-wildcard expansion. Returns the rows and whether an
    /// anonymous-user (`user == ""`) row was present in this server's result.
    async fn load_one(
        &self,
        conn: &dyn BackendConnection,
        databases: &mut HashSet<String>,
    ) -> Result<(Vec<GrantRow>, bool), CatalogError> {
        let version = conn.server_version().await?;
        let pw_column = password_column_for_version(&version);

        if !self.options.skip_permission_checks {
            for table in ["mysql.user", "mysql.db", "mysql.tables_priv"] {
                conn.check_select(table).await?;
            }
        }

        let known_databases = conn.show_databases().await?;
        databases.extend(known_databases.iter().cloned());

        let raw_rows = conn.grant_rows(pw_column, self.options.enable_root).await?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        let mut saw_anonymous_user = false;

        for raw in raw_rows {
            if raw.user == "root" && !self.options.enable_root {
                continue;
            }
            if raw.user.is_empty() {
                saw_anonymous_user = true;
            }

            let host = match HostPattern::parse(&raw.host) {
                Ok(host) => host,
                Err(error) => {
                    debug!(user = %raw.user, host = %raw.host, %error, "skipping row with malformed host pattern");
                    continue;
                }
            };

            // A leading `*` (5.7+ native-password format) is stripped before
            // decoding; passwordless accounts store an empty column.
            let password_text = raw.password_column.strip_prefix('*').unwrap_or(&raw.password_column);
            let password_hash = match hex::decode(password_text) {
                Ok(bytes) if bytes.len() == OLD_PASSWORD_HASH_LEN => {
                    debug!(user = %raw.user, "skipping row with legacy pre-4.1 password hash");
                    continue;
                }
                Ok(bytes) => bytes,
                Err(error) => {
                    debug!(user = %raw.user, %error, "skipping row with unparsable password hash");
                    continue;
                }
            };

            let database_patterns = if raw.anydb {
                vec![DbPattern::Global]
            } else {
                match &raw.db {
                    None => vec![DbPattern::Unset],
                    Some(pattern) => self.expand_database_pattern(pattern, &known_databases),
                }
            };

            for database in database_patterns {
                rows.push(GrantRow {
                    user: raw.user.clone(),
                    host: host.clone(),
                    database,
                    password_hash: password_hash.clone(),
                });
            }
        }

        Ok((rows, saw_anonymous_user))
    }

    /// Expand a `mysql.db`/`mysql.tables_priv` database pattern (possibly
    /// containing SQL `%`/`_` wildcards) into the literal, known database
    /// names it matches.
    fn expand_database_pattern(&self, pattern: &str, known: &[String]) -> Vec<DbPattern> {
        let cleaned = if self.options.strip_db_esc {
            pattern.replace("\\%", "%").replace("\\_", "_")
        } else {
            pattern.to_string()
        };

        if cleaned.is_empty() {
            // An *empty* database_pattern is a global grant: any database
            // accepted.
            return vec![DbPattern::Global];
        }

        if !cleaned.contains('%') && !cleaned.contains('_') {
            return vec![DbPattern::Database(cleaned)];
        }

        let regex_source = format!(
            "^{}$",
            regex::escape(&cleaned).replace("%", ".*").replace("_", ".")
        );
        match Regex::new(&format!("(?i){regex_source}")) {
            Ok(re) => known
                .iter()
                .filter(|db| re.is_match(db))
                .map(|db| DbPattern::Database(db.clone()))
                .collect(),
            Err(error) => {
                warn!(%pattern, %error, "failed to compile database wildcard pattern");
                Vec::new()
            }
        }
    }
}

fn password_column_for_version(version: &str) -> PasswordColumn {
    // MySQL 5.7 moved the password hash to `authentication_string`; every
    // other version this proxy targets (5.6 and earlier, 8.0+, MariaDB)
    // still carries it in `password`.
    if version.contains("5.7.") {
        PasswordColumn::AuthenticationString
    } else {
        PasswordColumn::Password
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_column_selection_matches_server_version() {
        assert_eq!(
            password_column_for_version("5.7.21-log"),
            PasswordColumn::AuthenticationString
        );
        assert_eq!(
            password_column_for_version("10.2.6-MariaDB"),
            PasswordColumn::Password
        );
        assert_eq!(password_column_for_version("8.0.34"), PasswordColumn::Password);
        assert_eq!(password_column_for_version("5.6.51"), PasswordColumn::Password);
    }

    struct StubBackend {
        version: &'static str,
        databases: Vec<String>,
        rows: Vec<RawGrantRow>,
    }

    #[async_trait]
    impl BackendConnection for StubBackend {
        async fn server_version(&self) -> Result<String, CatalogError> {
            Ok(self.version.to_string())
        }

        async fn check_select(&self, _table: &str) -> Result<(), CatalogError> {
            Ok(())
        }

        async fn grant_rows(
            &self,
            _pw_column: PasswordColumn,
            _include_root: bool,
        ) -> Result<Vec<RawGrantRow>, CatalogError> {
            Ok(self.rows.clone())
        }

        async fn show_databases(&self) -> Result<Vec<String>, CatalogError> {
            Ok(self.databases.clone())
        }
    }

    /// A realistic `mysql.user` password column value: a leading `*`
    /// followed by 40 hex digits, as the server actually stores it.
    fn password_column() -> String {
        format!("*{}", hex::encode(crate::password::hash_password("hunter2")).to_uppercase())
    }

    #[tokio::test]
    async fn loads_rows_and_expands_database_wildcards() {
        let backend = StubBackend {
            version: "8.0.34",
            databases: vec!["app_prod".to_string(), "app_staging".to_string(), "other".to_string()],
            rows: vec![RawGrantRow {
                user: "alice".to_string(),
                host: "%".to_string(),
                db: Some("app\\_%".to_string()),
                anydb: false,
                password_column: password_column(),
            }],
        };
        let catalog = Catalog::new();
        let loader = Loader::new(LoaderOptions::default());
        let report = loader
            .load(&catalog, &[(
                BackendTarget {
                    addr: "127.0.0.1:3306".to_string(),
                    connect_timeout: std::time::Duration::from_secs(1),
                    read_timeout: std::time::Duration::from_secs(1),
                    write_timeout: std::time::Duration::from_secs(1),
                },
                Box::new(backend),
            )])
            .await;

        assert_eq!(report.rows_loaded, 2);
        let snapshot = catalog.snapshot();
        assert!(snapshot.database_exists("app_prod"));
        assert!(snapshot.lookup("alice", 0, None, "app_prod").is_some());
        assert!(snapshot.lookup("alice", 0, None, "other").is_none());
    }

    #[tokio::test]
    async fn realistic_starred_password_column_round_trips_through_password_check() {
        let backend = StubBackend {
            version: "8.0.34",
            databases: vec![],
            rows: vec![RawGrantRow {
                user: "alice".to_string(),
                host: "%".to_string(),
                db: None,
                anydb: true,
                password_column: password_column(),
            }],
        };
        let catalog = Catalog::new();
        let loader = Loader::new(LoaderOptions::default());
        loader
            .load(&catalog, &[(
                BackendTarget {
                    addr: "127.0.0.1:3306".to_string(),
                    connect_timeout: std::time::Duration::from_secs(1),
                    read_timeout: std::time::Duration::from_secs(1),
                    write_timeout: std::time::Duration::from_secs(1),
                },
                Box::new(backend),
            )])
            .await;

        let snapshot = catalog.snapshot();
        let row = snapshot.lookup("alice", 0, None, "").expect("row should load");
        assert_eq!(row.password_hash, crate::password::hash_password("hunter2"));

        let scramble = [7u8; 20];
        let response = crate::password::client_response("hunter2", &scramble);
        let (ok, _) = crate::password::check(&row.password_hash, &scramble, &response);
        assert!(ok, "a real `*`-prefixed hex password column must authenticate the matching password");
    }

    #[tokio::test]
    async fn unset_database_pattern_denies_any_named_database() {
        let backend = StubBackend {
            version: "8.0.34",
            databases: vec!["app_prod".to_string()],
            rows: vec![RawGrantRow {
                user: "alice".to_string(),
                host: "%".to_string(),
                db: None,
                anydb: false,
                password_column: password_column(),
            }],
        };
        let catalog = Catalog::new();
        let loader = Loader::new(LoaderOptions::default());
        loader
            .load(&catalog, &[(
                BackendTarget {
                    addr: "127.0.0.1:3306".to_string(),
                    connect_timeout: std::time::Duration::from_secs(1),
                    read_timeout: std::time::Duration::from_secs(1),
                    write_timeout: std::time::Duration::from_secs(1),
                },
                Box::new(backend),
            )])
            .await;
        let snapshot = catalog.snapshot();
        // a bare mysql.user row with no db/tables_priv grant and select_priv
        // != 'Y' admits a connection that names no database...
        assert!(snapshot.lookup("alice", 0, None, "").is_some());
        // ...but denies one that names any database at all.
        assert!(snapshot.lookup("alice", 0, None, "app_prod").is_none());
    }

    #[tokio::test]
    async fn select_priv_grants_any_database_regardless_of_db_column() {
        let backend = StubBackend {
            version: "8.0.34",
            databases: vec!["app_prod".to_string(), "other".to_string()],
            rows: vec![RawGrantRow {
                user: "alice".to_string(),
                host: "%".to_string(),
                db: None,
                anydb: true,
                password_column: password_column(),
            }],
        };
        let catalog = Catalog::new();
        let loader = Loader::new(LoaderOptions::default());
        loader
            .load(&catalog, &[(
                BackendTarget {
                    addr: "127.0.0.1:3306".to_string(),
                    connect_timeout: std::time::Duration::from_secs(1),
                    read_timeout: std::time::Duration::from_secs(1),
                    write_timeout: std::time::Duration::from_secs(1),
                },
                Box::new(backend),
            )])
            .await;
        let snapshot = catalog.snapshot();
        assert!(snapshot.lookup("alice", 0, None, "app_prod").is_some());
        assert!(snapshot.lookup("alice", 0, None, "other").is_some());
    }

    #[tokio::test]
    async fn root_is_skipped_unless_enabled() {
        let backend = StubBackend {
            version: "5.7.40",
            databases: vec![],
            rows: vec![RawGrantRow {
                user: "root".to_string(),
                host: "localhost".to_string(),
                db: None,
                anydb: true,
                password_column: password_column(),
            }],
        };
        let catalog = Catalog::new();
        let loader = Loader::new(LoaderOptions::default());
        let report = loader
            .load(&catalog, &[(
                BackendTarget {
                    addr: "127.0.0.1:3306".to_string(),
                    connect_timeout: std::time::Duration::from_secs(1),
                    read_timeout: std::time::Duration::from_secs(1),
                    write_timeout: std::time::Duration::from_secs(1),
                },
                Box::new(backend),
            )])
            .await;
        assert_eq!(report.rows_loaded, 0);
    }

    #[tokio::test]
    async fn anonymous_user_row_disables_localhost_wildcard_flag() {
        let backend = StubBackend {
            version: "8.0.34",
            databases: vec![],
            rows: vec![
                RawGrantRow {
                    user: "alice".to_string(),
                    host: "%".to_string(),
                    db: None,
                    anydb: true,
                    password_column: password_column(),
                },
                RawGrantRow {
                    user: String::new(),
                    host: "%".to_string(),
                    db: None,
                    anydb: false,
                    password_column: String::new(),
                },
            ],
        };
        let catalog = Catalog::new();
        let loader = Loader::new(LoaderOptions::default());
        loader
            .load(&catalog, &[(
                BackendTarget {
                    addr: "127.0.0.1:3306".to_string(),
                    connect_timeout: std::time::Duration::from_secs(1),
                    read_timeout: std::time::Duration::from_secs(1),
                    write_timeout: std::time::Duration::from_secs(1),
                },
                Box::new(backend),
            )])
            .await;
        assert!(!catalog.snapshot().localhost_match_wildcard_host);
    }

    #[tokio::test]
    async fn absence_of_anonymous_user_enables_localhost_wildcard_flag() {
        let backend = StubBackend {
            version: "8.0.34",
            databases: vec![],
            rows: vec![RawGrantRow {
                user: "alice".to_string(),
                host: "%".to_string(),
                db: None,
                anydb: true,
                password_column: password_column(),
            }],
        };
        let catalog = Catalog::new();
        let loader = Loader::new(LoaderOptions::default());
        loader
            .load(&catalog, &[(
                BackendTarget {
                    addr: "127.0.0.1:3306".to_string(),
                    connect_timeout: std::time::Duration::from_secs(1),
                    read_timeout: std::time::Duration::from_secs(1),
                    write_timeout: std::time::Duration::from_secs(1),
                },
                Box::new(backend),
            )])
            .await;
        assert!(catalog.snapshot().localhost_match_wildcard_host);
    }

    #[tokio::test]
    async fn legacy_password_hash_row_is_skipped() {
        let backend = StubBackend {
            version: "8.0.34",
            databases: vec![],
            rows: vec![RawGrantRow {
                user: "legacy".to_string(),
                host: "%".to_string(),
                db: None,
                anydb: true,
                password_column: hex::encode([0u8; OLD_PASSWORD_HASH_LEN]),
            }],
        };
        let catalog = Catalog::new();
        let loader = Loader::new(LoaderOptions::default());
        let report = loader
            .load(&catalog, &[(
                BackendTarget {
                    addr: "127.0.0.1:3306".to_string(),
                    connect_timeout: std::time::Duration::from_secs(1),
                    read_timeout: std::time::Duration::from_secs(1),
                    write_timeout: std::time::Duration::from_secs(1),
                },
                Box::new(backend),
            )])
            .await;
        assert_eq!(report.rows_loaded, 0);
    }
}
