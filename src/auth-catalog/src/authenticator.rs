//! Matching a client handshake against the catalog without consulting a
//! backend.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::catalog::{best_match_for_user, Catalog, GrantRow};
use crate::password;

/// Resolves a client's numeric address to a hostname for the `Hostname`/
/// `SingleChar` matching path. A real implementation wraps a reverse-DNS
/// lookup; tests use a fixed-table stub. This crate never caches resolver
/// results itself (see the design notes on reverse-DNS caching) — a caching
/// resolver, if wanted, is the host's composition to make.
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    async fn resolve(&self, addr: Ipv4Addr) -> Option<String>;
}

/// A resolver that never resolves anything, for hosts that run with
/// hostname-pattern grants disabled or absent.
pub struct NoopResolver;

#[async_trait]
impl ReverseResolver for NoopResolver {
    async fn resolve(&self, _addr: Ipv4Addr) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct AuthenticatorOptions {
    /// Whether a client whose address matches no numeric/wildcard host
    /// pattern should fall back to a reverse-DNS lookup and hostname match.
    /// Defaults to `true`.
    pub enable_hostname_fallback: bool,
}

impl Default for AuthenticatorOptions {
    fn default() -> Self {
        Self {
            enable_hostname_fallback: true,
        }
    }
}

/// Everything needed to evaluate one client handshake.
#[derive(Debug, Clone)]
pub struct AuthRequest<'a> {
    pub user: &'a str,
    pub client_addr: Ipv4Addr,
    pub requested_db: &'a str,
    pub scramble: &'a [u8],
    pub client_response: &'a [u8],
}

/// Outcome of matching a handshake against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Admitted. `used_password` is `false` only for a passwordless account
    /// that authenticated with an empty response, carried through so the
    /// host can log it. `password_sha1` is `SHA1(password)`, recovered by
    /// `PasswordCheck` without ever reconstructing the plaintext, for the
    /// proxy to replay in its own handshake against the backend.
    Success {
        used_password: bool,
        password_sha1: [u8; password::HASH_LEN],
    },
    /// No row admits this `(user, client address)` pair: either there is no
    /// catalog row for `user` at all, or none matches this client's address
    /// (numerically, by single-char wildcard, or by resolved hostname). The
    /// spec's handshake algorithm (§4.5 steps 1-3) does not distinguish these
    /// two cases at the reported result, only internally while matching.
    UnknownUser,
    /// A row matched the client's host, but the password check failed.
    BadPassword,
    /// A row matched the client's host and its password checked out, but
    /// `requested_db` is non-empty and not present in the current snapshot.
    NoSuchDatabase,
}

pub struct Authenticator {
    catalog: Arc<Catalog>,
    resolver: Arc<dyn ReverseResolver>,
    options: AuthenticatorOptions,
}

impl Authenticator {
    pub fn new(
        catalog: Arc<Catalog>,
        resolver: Arc<dyn ReverseResolver>,
        options: AuthenticatorOptions,
    ) -> Self {
        Self {
            catalog,
            resolver,
            options,
        }
    }

    /// Evaluate a handshake against the current catalog snapshot.
    ///
    /// 1. Collect every row for `user`; if there are none, `UnknownUser`.
    /// 2. Match those rows against the client's numeric address and, for
    ///    `requested_db`, its database scope.
    /// 3. If nothing matched and hostname fallback is enabled, resolve the
    ///    client's address and retry the match against resolved hostname
    ///    patterns.
    /// 4. If still nothing matched, `UnknownUser` (per spec.md §4.5 step 3,
    ///    a host mismatch is reported identically to an unknown user).
    /// 5. Check the matched row's password hash against `client_response`;
    ///    on mismatch, `BadPassword`.
    /// 6. Only once a row has matched and its password has checked out,
    ///    check `database_exists` against a freshly-acquired snapshot (see
    ///    the design note on this race: a reverse-DNS lookup in step 3 can
    ///    take long enough for a concurrent refresh to drop `requested_db`
    ///    out from under the snapshot this request matched against). A
    ///    nonexistent database is reported identically whether or not a row
    ///    would otherwise have matched — but only after host and password
    ///    have both been checked, never before.
    pub async fn authenticate(&self, req: &AuthRequest<'_>) -> AuthResult {
        let snapshot = self.catalog.snapshot();

        let user_rows: Vec<&GrantRow> = snapshot.rows_for_user(req.user).collect();
        if user_rows.is_empty() {
            return AuthResult::UnknownUser;
        }

        let client_addr_u32 = u32::from(req.client_addr);
        let mut matched = best_match_for_user(&user_rows, client_addr_u32, None, req.requested_db);

        if matched.is_none() && self.options.enable_hostname_fallback {
            if let Some(hostname) = self.resolver.resolve(req.client_addr).await {
                debug!(user = %req.user, %hostname, "falling back to resolved hostname for host match");
                matched = best_match_for_user(
                    &user_rows,
                    client_addr_u32,
                    Some(hostname.as_str()),
                    req.requested_db,
                );
            }
        }

        let Some(row) = matched else {
            return AuthResult::UnknownUser;
        };

        let used_password = !row.password_hash.is_empty();
        let (password_ok, password_sha1) =
            password::check(&row.password_hash, req.scramble, req.client_response);
        if !password_ok {
            return AuthResult::BadPassword;
        }

        if !req.requested_db.is_empty() {
            let fresh = self.catalog.snapshot();
            if !fresh.database_exists(req.requested_db) {
                return AuthResult::NoSuchDatabase;
            }
        }

        AuthResult::Success { used_password, password_sha1 }
    }
}
