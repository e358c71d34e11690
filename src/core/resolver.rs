// src/core/resolver.rs

//! Per-worker asynchronous name resolution, bound to the worker's event loop.

use std::io;
use std::net::SocketAddr;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// A resolver context owned by one worker. Lookups spawned through it run as
/// tasks on that worker's event loop, so their completions are observed on
/// the same thread as the connection that asked for them.
#[derive(Debug)]
pub struct DnsResolver {
    worker: usize,
    event_loop: Handle,
}

impl DnsResolver {
    pub(crate) fn new(worker: usize, event_loop: Handle) -> Self {
        Self { worker, event_loop }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Resolves `host:port` on the caller's task.
    pub async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        resolve(self.worker, host, port).await
    }

    /// Starts a lookup on the worker's event loop. Usable from any thread.
    pub fn spawn_lookup(
        &self,
        host: impl Into<String>,
        port: u16,
    ) -> JoinHandle<io::Result<Vec<SocketAddr>>> {
        let host = host.into();
        let worker = self.worker;
        self.event_loop
            .spawn(async move { resolve(worker, &host, port).await })
    }
}

async fn resolve(worker: usize, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    trace!("thr={} resolving {}:{}", worker, host, port);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {host}"),
        ));
    }
    Ok(addrs)
}
