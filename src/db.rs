//! Shared SQLite plumbing: schema, fresh-db creation, and the thin
//! query/exec wrappers every store (peer registry, ledger, vending pool)
//! builds on.

use std::fmt;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, Transaction};

pub const DB_VERSION: i64 = 1;

pub const SCHEMA: &str = "\
CREATE TABLE version (
    version INTEGER NOT NULL
);

CREATE TABLE coin_bindings (
    coin TEXT PRIMARY KEY NOT NULL,
    node_id TEXT NOT NULL
);

CREATE TABLE vended_addresses (
    node_id TEXT NOT NULL,
    address TEXT NOT NULL,
    UNIQUE(node_id, address)
);
CREATE INDEX vended_addresses_node_id ON vended_addresses(node_id);

CREATE TABLE ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    service TEXT NOT NULL,
    method TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    status TEXT NOT NULL,
    payment_type TEXT NOT NULL,
    payment_amount INTEGER NOT NULL,
    payment_currency TEXT NOT NULL,
    perf TEXT
);
CREATE INDEX ledger_node_id ON ledger(node_id);
CREATE INDEX ledger_service_method ON ledger(service, method);
";

#[derive(Debug)]
pub enum DbError {
    FileCreation(std::io::Error),
    FileNotFound,
    UnsupportedVersion(i64),
    Rusqlite(rusqlite::Error),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DbError::FileCreation(e) => write!(f, "could not create database file: {}", e),
            DbError::FileNotFound => write!(f, "database file not found"),
            DbError::UnsupportedVersion(v) => write!(f, "unsupported database version {}", v),
            DbError::Rusqlite(e) => write!(f, "sqlite error: {}", e),
        }
    }
}

impl std::error::Error for DbError {}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        DbError::Rusqlite(e)
    }
}

/// Open (creating if missing) the sqlite database at `db_path`, applying the
/// fixed schema on first creation. There is exactly one schema version; a
/// future revision would grow a `migrate_v1_to_v2` and a dispatch loop the
/// way `lianad`'s sqlite module does, but nothing here warrants it yet.
pub fn open(db_path: &Path) -> Result<Connection, DbError> {
    let fresh = !db_path.exists();
    if fresh {
        create_db_file(db_path)?;
    }
    let conn = Connection::open(db_path)?;
    configure_connection(&conn)?;
    if fresh {
        conn.execute_batch(SCHEMA)?;
        conn.execute("INSERT INTO version (version) VALUES (?1)", [DB_VERSION])?;
    } else {
        let version: i64 = conn.query_row("SELECT version FROM version", [], |row| row.get(0))?;
        if version != DB_VERSION {
            return Err(DbError::UnsupportedVersion(version));
        }
    }
    Ok(conn)
}

/// WAL journaling plus a generous busy timeout, so the three independent
/// connections the daemon opens against one `oc.sqlite3` file (peer
/// registry, ledger, vending pool) wait out each other's writers instead of
/// surfacing `SQLITE_BUSY` to a request in flight.
pub fn configure_connection(conn: &Connection) -> Result<(), DbError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

#[cfg(unix)]
fn create_db_file(db_path: &Path) -> Result<(), DbError> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(db_path)
        .map(|_| ())
        .map_err(DbError::FileCreation)
}

#[cfg(not(unix))]
fn create_db_file(db_path: &Path) -> Result<(), DbError> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(db_path)
        .map(|_| ())
        .map_err(DbError::FileCreation)
}

/// Run `modifications` inside an immediate transaction, committing on `Ok`
/// and rolling back on `Err`. Generic over the caller's own error type so a
/// store can return a domain error (e.g. a coin-reuse rejection) straight
/// out of the closure instead of laundering it through `rusqlite::Error`.
pub fn db_exec<F, E>(conn: &mut Connection, modifications: F) -> Result<(), E>
where
    F: FnOnce(&Transaction) -> Result<(), E>,
    E: From<rusqlite::Error>,
{
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    modifications(&tx)?;
    tx.commit()?;
    Ok(())
}

/// Run a query expected to return zero-or-one row. `conn` also accepts a
/// `&Transaction`, which derefs to `&Connection`.
pub fn db_query_row<P, F, T, E>(
    conn: &Connection,
    stmt: &str,
    params: P,
    f: F,
) -> Result<Option<T>, E>
where
    P: rusqlite::Params,
    F: FnOnce(&Row) -> rusqlite::Result<T>,
    E: From<rusqlite::Error>,
{
    let mut stmt = conn.prepare(stmt)?;
    Ok(stmt.query_row(params, f).optional()?)
}

/// Run a query expected to return zero-or-more rows.
pub fn db_query<P, F, T, E>(conn: &Connection, stmt: &str, params: P, f: F) -> Result<Vec<T>, E>
where
    P: rusqlite::Params,
    F: FnMut(&Row) -> rusqlite::Result<T>,
    E: From<rusqlite::Error>,
{
    let mut stmt = conn.prepare(stmt)?;
    let rows = stmt.query_map(params, f)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn curr_timestamp() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the Unix epoch")
        .as_secs()
        .try_into()
        .expect("system clock is past year 2106")
}
