// src/core/userdb.rs

//! The user-credentials store seam. The store itself is owned outside the
//! pool; each worker only prepares, uses and finally drops its own lookup
//! handle so no statement is ever shared between threads.

use crate::core::errors::UserDbError;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::debug;

/// The query each worker prepares against the user database.
pub const GET_USER_SQL: &str = "SELECT user,ether,atime,desc FROM users WHERE ip = ?1";

/// A row of the `users` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user: String,
    pub ether: String,
    pub atime: i64,
    pub desc: Option<String>,
}

/// A user-credentials store able to hand out per-worker lookup handles.
pub trait UserDb: Send + Sync {
    fn prepare_user_lookup(&self, worker: usize) -> Result<Box<dyn UserLookup>, UserDbError>;
}

/// A prepared, reusable user lookup owned by exactly one worker. Dropping it
/// finalizes the statement.
pub trait UserLookup: Send {
    fn lookup(&mut self, ip: IpAddr) -> Result<Option<UserRecord>, UserDbError>;
}

/// A SQLite-backed store. Every worker opens its own connection to the same
/// database file and keeps the prepared statement in that connection's cache.
#[derive(Debug, Clone)]
pub struct SqliteUserDb {
    path: PathBuf,
}

impl SqliteUserDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UserDb for SqliteUserDb {
    fn prepare_user_lookup(&self, worker: usize) -> Result<Box<dyn UserLookup>, UserDbError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // Fails here, at startup, if the table or columns are missing.
        conn.prepare_cached(GET_USER_SQL)?;
        debug!(
            "thr={} prepared user lookup against {}",
            worker,
            self.path.display()
        );
        Ok(Box::new(SqliteUserLookup { conn }))
    }
}

struct SqliteUserLookup {
    conn: Connection,
}

impl UserLookup for SqliteUserLookup {
    fn lookup(&mut self, ip: IpAddr) -> Result<Option<UserRecord>, UserDbError> {
        let mut stmt = self.conn.prepare_cached(GET_USER_SQL)?;
        let user = stmt
            .query_row(params![ip.to_string()], |row| {
                Ok(UserRecord {
                    user: row.get(0)?,
                    ether: row.get(1)?,
                    atime: row.get(2)?,
                    desc: row.get(3)?,
                })
            })
            .optional()?;
        Ok(user)
    }
}
