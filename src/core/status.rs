// src/core/status.rs

//! Point-in-time diagnostic snapshots of the pool and its workers.
//!
//! The `Display` impls render the same one-line-per-connection dump the
//! worker logs on its status timer, with children indented under their
//! parent.

use crate::connection::{ConnId, Descriptors, EofFlags};
use crate::core::pool::registry::Registry;
use crate::core::pool::worker::WorkerState;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A snapshot of one registered connection and, recursively, its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub id: ConnId,
    pub descriptors: Descriptors,
    pub eof: EofFlags,
    /// Time since the record was created.
    pub age: Duration,
    pub idle: Duration,
    pub dest_addr: Option<SocketAddr>,
    /// Set once the connection has been detached but is still pinned.
    pub detached: bool,
    pub parent: Option<ConnId>,
    pub children: Vec<ConnectionStatus>,
}

impl ConnectionStatus {
    fn capture(registry: &Registry, id: &ConnId, now: Instant) -> Option<Self> {
        let slot = registry.get(id)?;
        let record = &slot.record;
        Some(Self {
            id: *id,
            descriptors: record.descriptors(),
            eof: record.eof(),
            age: now.saturating_duration_since(record.created()),
            idle: record.idle_at(now),
            dest_addr: record.dest_addr(),
            detached: slot.detached,
            parent: slot.parent,
            children: slot
                .children
                .iter()
                .filter_map(|c| Self::capture(registry, c, now))
                .collect(),
        })
    }

    /// The number of entries in this subtree, this one included.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Self::count).sum::<usize>()
    }

    fn write_line(&self, f: &mut fmt::Formatter<'_>, prefix: &str, depth: usize) -> fmt::Result {
        write!(
            f,
            "\n{}{}: id={} {} eof={} parent={} children={} age={}s idle={}s",
            "  ".repeat(depth),
            prefix,
            self.id,
            self.descriptors,
            self.eof,
            u8::from(self.parent.is_some()),
            self.children.len(),
            self.age.as_secs(),
            self.idle.as_secs(),
        )?;
        if self.detached {
            f.write_str(" detached")?;
        }
        match self.dest_addr {
            Some(addr) => write!(f, " addr={addr}")?,
            None => f.write_str(" addr=-")?,
        }
        for (i, child) in self.children.iter().enumerate() {
            child.write_line(f, &format!("{prefix}, child={i}"), depth + 1)?;
        }
        Ok(())
    }
}

/// A snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub index: usize,
    pub load: usize,
    pub running: bool,
    /// Top-level connections, in registry order.
    pub connections: Vec<ConnectionStatus>,
}

impl WorkerStatus {
    pub(crate) fn capture(index: usize, running: bool, state: &WorkerState, now: Instant) -> Self {
        let connections = state
            .registry
            .roots()
            .filter_map(|slot| ConnectionStatus::capture(&state.registry, &slot.record.id(), now))
            .collect();
        Self {
            index,
            load: state.load,
            running,
            connections,
        }
    }

    /// Every registered record, children included.
    pub fn registered(&self) -> usize {
        self.connections.iter().map(ConnectionStatus::count).sum()
    }

    pub fn find(&self, id: &ConnId) -> Option<&ConnectionStatus> {
        fn walk<'a>(list: &'a [ConnectionStatus], id: &ConnId) -> Option<&'a ConnectionStatus> {
            list.iter()
                .find_map(|c| if c.id == *id { Some(c) } else { walk(&c.children, id) })
        }
        walk(&self.connections, id)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thr={}, load={}", self.index, self.load)?;
        if !self.running {
            write!(f, " (stopped)")?;
        }
        for (i, conn) in self.connections.iter().enumerate() {
            conn.write_line(f, &format!("thr={}, cont={}", self.index, i), 0)?;
        }
        Ok(())
    }
}

/// A snapshot of every worker in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PoolStatus {
    pub workers: Vec<WorkerStatus>,
}

impl PoolStatus {
    pub fn total_load(&self) -> usize {
        self.workers.iter().map(|w| w.load).sum()
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, worker) in self.workers.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{worker}")?;
        }
        Ok(())
    }
}
