//! A [`BackendConnection`] implementation talking to a real MySQL-compatible
//! server as a client, via `mysql_async`. This is a different concern from
//! the proxy's own wire-protocol *server* framing, which stays out of scope
//! for this crate.

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool};

use super::{BackendConnection, PasswordColumn, RawGrantRow};
use crate::error::CatalogError;

/// A pooled connection to one backend server, used only during a catalog
/// refresh (never on the per-client authentication hot path).
pub struct MysqlBackend {
    addr: String,
    pool: Pool,
}

impl MysqlBackend {
    pub fn connect(
        addr: &str,
        user: &str,
        password: &str,
        connect_timeout: std::time::Duration,
    ) -> Result<Self, CatalogError> {
        let (host, port) = split_addr(addr);
        let opts = OptsBuilder::from_opts(Opts::default())
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(user))
            .pass(Some(password))
            .tcp_connect_timeout(Some(connect_timeout));
        Ok(Self {
            addr: addr.to_string(),
            pool: Pool::new(opts),
        })
    }

    async fn conn(&self) -> Result<mysql_async::Conn, CatalogError> {
        self.pool.get_conn().await.map_err(|source| CatalogError::BackendUnreachable {
            addr: self.addr.clone(),
            source: source.into(),
        })
    }

    fn query_failed(&self, source: mysql_async::Error) -> CatalogError {
        CatalogError::QueryFailed {
            addr: self.addr.clone(),
            source: source.into(),
        }
    }
}

fn split_addr(addr: &str) -> (&str, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(3306)),
        None => (addr, 3306),
    }
}

#[async_trait]
impl BackendConnection for MysqlBackend {
    async fn server_version(&self) -> Result<String, CatalogError> {
        let mut conn = self.conn().await?;
        let version: String = "SELECT VERSION()"
            .with(())
            .fetch(&mut conn)
            .await
            .map_err(|e| self.query_failed(e))?
            .into_iter()
            .next()
            .unwrap_or_default();
        Ok(version)
    }

    async fn check_select(&self, table: &str) -> Result<(), CatalogError> {
        let mut conn = self.conn().await?;
        let query = format!("SELECT COUNT(*) FROM {table} LIMIT 0");
        query
            .with(())
            .fetch::<u64, _>(&mut conn)
            .await
            .map_err(|source| CatalogError::PermissionsMissing {
                addr: self.addr.clone(),
                table: match table {
                    "mysql.user" => "mysql.user",
                    "mysql.db" => "mysql.db",
                    _ => "mysql.tables_priv",
                },
                detail: source.to_string(),
            })?;
        Ok(())
    }

    async fn grant_rows(
        &self,
        pw_column: PasswordColumn,
        include_root: bool,
    ) -> Result<Vec<RawGrantRow>, CatalogError> {
        let mut conn = self.conn().await?;
        let pw_column_name = match pw_column {
            PasswordColumn::Password => "Password",
            PasswordColumn::AuthenticationString => "authentication_string",
        };
        let root_filter = if include_root { "" } else { "WHERE u.User NOT IN ('root')" };

        // A UNION of a LEFT JOIN against mysql.db and a LEFT JOIN against
        // mysql.tables_priv, so every mysql.user row is represented even when
        // it holds no per-database grant (the `Db` column comes back NULL in
        // that case, decoded below as `db: None`). The password column is
        // selected raw: it already holds the textual `*`+40-hex-digit
        // native-password hash (or an empty string), not a binary value —
        // wrapping it in `HEX()` would hex-encode that ASCII text a second
        // time.
        let query = format!(
            "SELECT u.User, u.Host, d.Db, u.Select_priv, u.{pw_column_name} \
             FROM mysql.user AS u LEFT JOIN mysql.db AS d \
               ON (u.User = d.User AND u.Host = d.Host) \
             {root_filter} \
             UNION \
             SELECT u.User, u.Host, t.Db, u.Select_priv, u.{pw_column_name} \
             FROM mysql.user AS u LEFT JOIN mysql.tables_priv AS t \
               ON (u.User = t.User AND u.Host = t.Host) \
             {root_filter}"
        );
        query
            .with(())
            .map(
                &mut conn,
                |(user, host, db, select_priv, password_column): (
                    String,
                    String,
                    Option<String>,
                    String,
                    String,
                )| RawGrantRow {
                    user,
                    host,
                    db,
                    anydb: select_priv == "Y",
                    password_column,
                },
            )
            .await
            .map_err(|e| self.query_failed(e))
    }

    async fn show_databases(&self) -> Result<Vec<String>, CatalogError> {
        let mut conn = self.conn().await?;
        "SHOW DATABASES"
            .with(())
            .fetch(&mut conn)
            .await
            .map_err(|e| self.query_failed(e))
    }
}
