//! Local SQLite storage shared by the alarm log, tool history and production
//! tally.
//!
//! One database file holds every table. The connection sits behind a mutex;
//! each store takes the lock for a single statement, and a busy timeout bounds
//! how long a write may wait.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::Result;

/// Longest wait for a locked database file.
const BUSY_TIMEOUT: Duration = Duration::from_millis(500);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alarm_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alarm_name TEXT NOT NULL,
    alarm_value INTEGER NOT NULL,
    code INTEGER NOT NULL DEFAULT 1,
    start_time TEXT NOT NULL,
    end_time TEXT
);
CREATE INDEX IF NOT EXISTS idx_alarm_log_name_start ON alarm_log (alarm_name, start_time);

CREATE TABLE IF NOT EXISTS tool_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bank TEXT NOT NULL,
    tool_id TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    change_reason TEXT NOT NULL,
    new_life_setting INTEGER NOT NULL,
    operator TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS change_reason_history (reason TEXT PRIMARY KEY);
CREATE TABLE IF NOT EXISTS operator_history (operator TEXT PRIMARY KEY);

CREATE TABLE IF NOT EXISTS production (
    date TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0
);
";

/// Handle to the shared database. Clones share one connection.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the file cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened storage");
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the schema cannot be applied.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        debug!("storage schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if `f` fails.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}
