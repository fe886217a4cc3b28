// Pooled SQLite connections with explicit open/close lifetime.
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::core::error::{Error, ErrorKind};

const DEFAULT_MAX_IDLE: usize = 4;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub read_write: bool,
    pub max_idle: usize,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_write: false,
            max_idle: DEFAULT_MAX_IDLE,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_read_write(mut self, read_write: bool) -> Self {
        self.read_write = read_write;
        self
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }
}

/// Connection provider for the backing store.
///
/// Cloning is cheap; clones share one idle list. Connections are opened on
/// demand and returned to the idle list when their guard drops, up to
/// `max_idle`. `close` drops idle connections and stops recycling.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    idle: Mutex<Vec<Connection>>,
    closed: AtomicBool,
}

impl Store {
    /// Opens the store, failing fast if the database cannot be opened.
    pub fn open(config: StoreConfig) -> Result<Self, Error> {
        let conn = open_connection(&config)?;
        info!(path = %config.path.display(), read_write = config.read_write, "store opened");
        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };
        store.release(conn);
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn connect(&self) -> Result<PooledConnection, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Store).with_message("store is closed"));
        }
        let idle = self.inner.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                debug!("opening new store connection");
                open_connection(&self.inner.config)?
            }
        };
        Ok(PooledConnection {
            conn: Some(conn),
            store: self.clone(),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let dropped = std::mem::take(&mut *self.inner.idle.lock());
        info!(connections = dropped.len(), "store closed");
    }

    fn release(&self, conn: Connection) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let mut idle = self.inner.idle.lock();
        if idle.len() < self.inner.config.max_idle {
            idle.push(conn);
        }
    }
}

fn open_connection(config: &StoreConfig) -> Result<Connection, Error> {
    let flags = if config.read_write {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let conn = Connection::open_with_flags(&config.path, flags).map_err(|err| {
        Error::store("failed to open database", err)
            .with_path(&config.path)
            .with_hint("Check --database points at an existing SQLite file.")
    })?;
    conn.busy_timeout(config.busy_timeout)
        .map_err(|err| Error::store("failed to set busy timeout", err))?;
    Ok(conn)
}

/// Request-scoped connection; returns to the store on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    store: Store,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.store.release(conn);
        }
    }
}
