//! The in-memory grant catalog: a mutex-guarded pointer to an immutable
//! snapshot, swapped atomically on each refresh so readers never block on a
//! load in progress.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::host_pattern::HostPattern;

/// The database-grant scope of a single catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DbPattern {
    /// No `mysql.db`/`mysql.tables_priv` row was found for this (user, host)
    /// and `select_priv` was not `Y`: no database restriction was recorded.
    /// A row in this state denies any request that names a database.
    Unset,
    /// `select_priv == 'Y'` on `mysql.user`, or an explicit empty database
    /// name: grants apply regardless of database.
    Global,
    /// A `mysql.db`/`mysql.tables_priv` row restricted to one database name
    /// (already expanded from any `%` wildcard at load time — see loader).
    Database(String),
}

/// One row of the catalog: a (user, host pattern, database scope) grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRow {
    pub user: String,
    pub host: HostPattern,
    pub database: DbPattern,
    /// Double-SHA1 native-password hash, empty for a passwordless account.
    pub password_hash: Vec<u8>,
}

/// An immutable point-in-time view of the catalog, shared via `Arc` so a
/// reader that acquired one never observes a later refresh mid-read.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    rows: Vec<GrantRow>,
    databases: HashSet<String>,
    /// Set by the loader when at least one backend's `mysql.user` carries a
    /// `localhost`-only root/admin row, signalling to the host that it
    /// should synthesize a loopback-equivalent entry at session time. This
    /// crate only threads the flag through; it does not act on it.
    pub localhost_match_wildcard_host: bool,
}

impl CatalogSnapshot {
    pub fn rows(&self) -> &[GrantRow] {
        &self.rows
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.contains(name)
    }

    /// The full set of known database names, as reported by `SHOW DATABASES`
    /// at the most recent load. Used by the Persister, which must round-trip
    /// this set even for databases no grant row happens to name.
    pub fn databases(&self) -> &HashSet<String> {
        &self.databases
    }

    /// All rows belonging to `user`, regardless of host or database scope.
    /// Used by the authenticator to distinguish an unknown user from one
    /// whose rows simply don't match this client's host.
    pub fn rows_for_user<'a>(&'a self, user: &'a str) -> impl Iterator<Item = &'a GrantRow> {
        self.rows.iter().filter(move |row| row.user == user)
    }

    /// Find the most specific grant row matching `user`, `client_addr` (and,
    /// if already resolved, `client_hostname`), optionally restricted to
    /// `requested_db`.
    ///
    /// Matching rule: among rows for `user` whose host pattern matches the
    /// client, prefer a row whose `database` is `Database(requested_db)` over
    /// one that is `Global`; among rows tied on that axis, prefer the host
    /// pattern with more specific bits. When `requested_db` is non-empty, the
    /// database must also exist in the current snapshot for the lookup to
    /// succeed.
    pub fn lookup(
        &self,
        user: &str,
        client_addr: u32,
        client_hostname: Option<&str>,
        requested_db: &str,
    ) -> Option<&GrantRow> {
        if !requested_db.is_empty() && !self.database_exists(requested_db) {
            return None;
        }

        let user_rows: Vec<&GrantRow> = self.rows.iter().filter(|row| row.user == user).collect();
        best_match_for_user(&user_rows, client_addr, client_hostname, requested_db)
    }
}

/// Find the most specific row in `user_rows` matching `client_addr` (and, if
/// resolved, `client_hostname`), optionally restricted to `requested_db`.
///
/// Host-pattern kinds are tried in strict priority order — numeric, then
/// single-char, then hostname — and a lower-priority kind is only considered
/// when the higher-priority kind has *no* match anywhere in `user_rows`,
/// regardless of whether that match's database scope would admit the
/// request. Otherwise a numeric row that matches the client but denies on
/// database scope could be bypassed by an unrelated, lower-priority row for
/// the same user.
pub(crate) fn best_match_for_user<'a>(
    user_rows: &[&'a GrantRow],
    client_addr: u32,
    client_hostname: Option<&str>,
    requested_db: &str,
) -> Option<&'a GrantRow> {
    // The single-char wildcard path matches against the client's own
    // dotted-quad address string, not a resolved hostname: it never depends
    // on reverse DNS succeeding.
    let client_dotted = Ipv4Addr::from(client_addr).to_string();

    let numeric: Vec<&'a GrantRow> =
        user_rows.iter().copied().filter(|row| row.host.matches_numeric(client_addr)).collect();
    let candidates: Vec<&'a GrantRow> = if !numeric.is_empty() {
        numeric
    } else {
        let single_char: Vec<&'a GrantRow> = user_rows
            .iter()
            .copied()
            .filter(|row| row.host.matches_single_char(&client_dotted))
            .collect();
        if !single_char.is_empty() {
            single_char
        } else if let Some(hostname) = client_hostname {
            user_rows.iter().copied().filter(|row| row.host.matches_hostname(hostname)).collect()
        } else {
            Vec::new()
        }
    };

    let mut best: Option<&'a GrantRow> = None;
    for row in candidates {
        if !requested_db.is_empty() {
            match &row.database {
                DbPattern::Global => {}
                DbPattern::Database(db) if db == requested_db => {}
                DbPattern::Database(_) => continue,
                DbPattern::Unset => continue,
            }
        }
        best = Some(better_of(best, row));
    }
    best
}

/// Rank two matching rows and return the more specific one, per spec.md
/// §4.2's tie-break rule: the longer host prefix wins outright; only on
/// equal prefixes does a row scoped to the requested database outrank a
/// global one.
pub(crate) fn better_of<'a>(current: Option<&'a GrantRow>, candidate: &'a GrantRow) -> &'a GrantRow {
    let Some(current) = current else {
        return candidate;
    };
    let current_bits = current.host.numeric_prefix().map(|(_, b)| b).unwrap_or(0);
    let candidate_bits = candidate.host.numeric_prefix().map(|(_, b)| b).unwrap_or(0);
    if candidate_bits != current_bits {
        return if candidate_bits > current_bits { candidate } else { current };
    }
    let current_specific = matches!(current.database, DbPattern::Database(_));
    let candidate_specific = matches!(candidate.database, DbPattern::Database(_));
    if candidate_specific && !current_specific {
        candidate
    } else {
        current
    }
}

/// Mutex-guarded pointer to the current `CatalogSnapshot`. Readers call
/// [`Catalog::snapshot`] once and then read the returned `Arc` lock-free;
/// writers call [`Catalog::replace_all`] to atomically install a new
/// snapshot built by the loader.
#[derive(Debug)]
pub struct Catalog {
    current: Mutex<Arc<CatalogSnapshot>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            current: Mutex::new(Arc::new(CatalogSnapshot::default())),
        }
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the current snapshot. Cheap: clones an `Arc`, never blocks on
    /// a concurrent refresh for longer than the pointer swap itself.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.lock().expect("catalog mutex poisoned"))
    }

    /// Install a freshly loaded snapshot, replacing the prior one in its
    /// entirety: there is no incremental delta update, each refresh rebuilds
    /// the full row set from scratch.
    pub fn replace_all(&self, rows: Vec<GrantRow>, databases: HashSet<String>, localhost_match_wildcard_host: bool) {
        let snapshot = Arc::new(CatalogSnapshot {
            rows,
            databases,
            localhost_match_wildcard_host,
        });
        *self.current.lock().expect("catalog mutex poisoned") = snapshot;
    }

    /// A debug dump of the current snapshot's rows, keyed by user, for
    /// diagnostics. Not used on the authentication hot path.
    pub fn dump(&self) -> HashMap<String, Vec<GrantRow>> {
        let snapshot = self.snapshot();
        let mut out: HashMap<String, Vec<GrantRow>> = HashMap::new();
        for row in &snapshot.rows {
            out.entry(row.user.clone()).or_default().push(row.clone());
        }
        out
    }
}
