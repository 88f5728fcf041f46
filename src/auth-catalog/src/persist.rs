//! Serializing the catalog to disk and reading it back before the first
//! load completes, so a restarting proxy has *something* to authenticate
//! against rather than rejecting every connection until the next refresh.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tempfile::NamedTempFile;

use crate::catalog::{Catalog, DbPattern, GrantRow};
use crate::error::CatalogError;
use crate::host_pattern::HostPattern;

const MAGIC: &[u8; 4] = b"ACT1";
const FORMAT_VERSION: u32 = 1;

const HOST_TAG_ANY: u8 = 0;
const HOST_TAG_PREFIX: u8 = 1;
const HOST_TAG_SINGLE_CHAR: u8 = 2;
const HOST_TAG_HOSTNAME: u8 = 3;

const DB_TAG_GLOBAL: u8 = 0;
const DB_TAG_DATABASE: u8 = 1;
const DB_TAG_UNSET: u8 = 2;

/// Where the catalog is persisted and read back from at startup.
#[derive(Debug, Clone)]
pub struct PersistOptions {
    pub path: PathBuf,
}

/// Reads and writes the catalog's on-disk snapshot.
///
/// The format is a flat, little-endian binary layout: a 4-byte magic, a
/// format version, the row count and rows, then the known-database set and
/// the `localhost_match_wildcard_host` flag. There is no checksum — a
/// truncated or corrupted file is surfaced as a `PersistenceIO` error from
/// the first read that runs past the end of the buffer, which is adequate
/// given this file is only ever written by this crate's own `save`.
pub struct Persister {
    options: PersistOptions,
}

impl Persister {
    pub fn new(options: PersistOptions) -> Self {
        Self { options }
    }

    /// Write the catalog's current snapshot to disk, atomically: the new
    /// contents land in a temp file in the same directory as the
    /// destination, then replace it in one rename so a reader never
    /// observes a partially-written file.
    pub fn save(&self, catalog: &Catalog) -> Result<(), CatalogError> {
        let snapshot = catalog.snapshot();
        let dir = self
            .options
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut temp = NamedTempFile::new_in(dir)?;
        write_snapshot(
            temp.as_file_mut(),
            snapshot.rows(),
            snapshot.databases(),
            snapshot.localhost_match_wildcard_host,
        )?;
        temp.persist(&self.options.path)
            .map_err(|e| CatalogError::PersistenceIO(e.error))?;
        Ok(())
    }

    /// Load a previously persisted catalog from disk into `catalog`. Intended
    /// for use at startup, before the first live load completes; a missing
    /// file is not an error (there's simply nothing to prime the catalog
    /// with yet).
    pub fn load(&self, catalog: &Catalog) -> Result<bool, CatalogError> {
        let bytes = match std::fs::read(&self.options.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CatalogError::PersistenceIO(e)),
        };
        let (rows, databases, localhost_match_wildcard_host) = read_snapshot(&bytes)?;
        catalog.replace_all(rows, databases, localhost_match_wildcard_host);
        Ok(true)
    }
}

fn write_snapshot(
    out: &mut impl Write,
    rows: &[GrantRow],
    databases: &HashSet<String>,
    localhost_match_wildcard_host: bool,
) -> Result<(), CatalogError> {
    out.write_all(MAGIC)?;
    out.write_u32::<LittleEndian>(FORMAT_VERSION)?;

    out.write_u32::<LittleEndian>(rows.len() as u32)?;
    for row in rows {
        write_string(out, &row.user)?;
        write_host(out, &row.host)?;
        write_db_pattern(out, &row.database)?;
        write_bytes(out, &row.password_hash)?;
    }

    out.write_u32::<LittleEndian>(databases.len() as u32)?;
    for db in databases {
        write_string(out, db)?;
    }

    out.write_u8(localhost_match_wildcard_host as u8)?;
    Ok(())
}

fn read_snapshot(
    bytes: &[u8],
) -> Result<(Vec<GrantRow>, HashSet<String>, bool), CatalogError> {
    let mut cur = io::Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CatalogError::PersistenceIO(io::Error::new(
            io::ErrorKind::InvalidData,
            "catalog file magic mismatch",
        )));
    }
    let version = cur.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(CatalogError::PersistenceIO(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported catalog file version {version}"),
        )));
    }

    let row_count = cur.read_u32::<LittleEndian>()?;
    let mut rows = Vec::with_capacity(row_count as usize);
    for _ in 0..row_count {
        let user = read_string(&mut cur)?;
        let host = read_host(&mut cur)?;
        let database = read_db_pattern(&mut cur)?;
        let password_hash = read_bytes(&mut cur)?;
        rows.push(GrantRow {
            user,
            host,
            database,
            password_hash,
        });
    }

    let db_count = cur.read_u32::<LittleEndian>()?;
    let mut databases = HashSet::with_capacity(db_count as usize);
    for _ in 0..db_count {
        databases.insert(read_string(&mut cur)?);
    }

    let localhost_match_wildcard_host = cur.read_u8()? != 0;

    Ok((rows, databases, localhost_match_wildcard_host))
}

fn write_string(out: &mut impl Write, s: &str) -> io::Result<()> {
    write_bytes(out, s.as_bytes())
}

fn write_bytes(out: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    out.write_u32::<LittleEndian>(bytes.len() as u32)?;
    out.write_all(bytes)
}

fn read_string(cur: &mut impl Read) -> io::Result<String> {
    let bytes = read_bytes(cur)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn read_bytes(cur: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = cur.read_u32::<LittleEndian>()?;
    let mut buf = vec![0u8; len as usize];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_host(out: &mut impl Write, host: &HostPattern) -> io::Result<()> {
    match host {
        HostPattern::AnyHost => out.write_u8(HOST_TAG_ANY),
        HostPattern::Prefix { addr, bits } => {
            out.write_u8(HOST_TAG_PREFIX)?;
            out.write_u32::<LittleEndian>(*addr)?;
            out.write_u8(*bits)
        }
        HostPattern::SingleChar(s) => {
            out.write_u8(HOST_TAG_SINGLE_CHAR)?;
            write_string(out, s)
        }
        HostPattern::Hostname(s) => {
            out.write_u8(HOST_TAG_HOSTNAME)?;
            write_string(out, s)
        }
    }
}

fn read_host(cur: &mut impl Read) -> io::Result<HostPattern> {
    let tag = cur.read_u8()?;
    match tag {
        HOST_TAG_ANY => Ok(HostPattern::AnyHost),
        HOST_TAG_PREFIX => {
            let addr = cur.read_u32::<LittleEndian>()?;
            let bits = cur.read_u8()?;
            Ok(HostPattern::Prefix { addr, bits })
        }
        HOST_TAG_SINGLE_CHAR => Ok(HostPattern::SingleChar(read_string(cur)?)),
        HOST_TAG_HOSTNAME => Ok(HostPattern::Hostname(read_string(cur)?)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown host pattern tag {other}"),
        )),
    }
}

fn write_db_pattern(out: &mut impl Write, pattern: &DbPattern) -> io::Result<()> {
    match pattern {
        DbPattern::Global => out.write_u8(DB_TAG_GLOBAL),
        DbPattern::Database(name) => {
            out.write_u8(DB_TAG_DATABASE)?;
            write_string(out, name)
        }
        DbPattern::Unset => out.write_u8(DB_TAG_UNSET),
    }
}

fn read_db_pattern(cur: &mut impl Read) -> io::Result<DbPattern> {
    let tag = cur.read_u8()?;
    match tag {
        DB_TAG_GLOBAL => Ok(DbPattern::Global),
        DB_TAG_DATABASE => Ok(DbPattern::Database(read_string(cur)?)),
        DB_TAG_UNSET => Ok(DbPattern::Unset),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown database pattern tag {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: &str, host: &str, db: DbPattern, pw: &[u8]) -> GrantRow {
        GrantRow {
            user: user.to_string(),
            host: HostPattern::parse(host).unwrap(),
            database: db,
            password_hash: pw.to_vec(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.bin");
        let persister = Persister::new(PersistOptions { path: path.clone() });

        let catalog = Catalog::new();
        let mut databases = HashSet::new();
        databases.insert("appdb".to_string());
        catalog.replace_all(
            vec![
                row("alice", "%", DbPattern::Global, b"hash-a"),
                row(
                    "bob",
                    "10.0.0.%",
                    DbPattern::Database("appdb".to_string()),
                    b"hash-b",
                ),
            ],
            databases,
            true,
        );
        persister.save(&catalog).unwrap();

        let restored = Catalog::new();
        let loaded = persister.load(&restored).unwrap();
        assert!(loaded);
        let snapshot = restored.snapshot();
        assert!(snapshot.database_exists("appdb"));
        assert!(snapshot.localhost_match_wildcard_host);
        assert_eq!(snapshot.rows().len(), 2);
        let found = snapshot.lookup("bob", u32::from(std::net::Ipv4Addr::new(10, 0, 0, 9)), None, "appdb");
        assert_eq!(found.unwrap().password_hash, b"hash-b");
    }

    #[test]
    fn databases_with_no_referencing_row_still_round_trip() {
        // a database with no grant row naming it directly (only reachable
        // through a global grant) must still survive save/load: the known-
        // database set is persisted as its own field, not reconstructed from
        // `DbPattern::Database` rows.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.bin");
        let persister = Persister::new(PersistOptions { path });

        let catalog = Catalog::new();
        let mut databases = HashSet::new();
        databases.insert("orphan_db".to_string());
        catalog.replace_all(
            vec![row("alice", "%", DbPattern::Unset, b"hash-a")],
            databases,
            false,
        );
        persister.save(&catalog).unwrap();

        let restored = Catalog::new();
        persister.load(&restored).unwrap();
        let snapshot = restored.snapshot();
        assert!(snapshot.database_exists("orphan_db"));
        assert!(snapshot.lookup("alice", 0, None, "orphan_db").is_none());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.bin");
        let persister = Persister::new(PersistOptions { path });
        let catalog = Catalog::new();
        let loaded = persister.load(&catalog).unwrap();
        assert!(!loaded);
    }
}
