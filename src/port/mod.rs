//! Session-scoped port allocation.
//!
//! Hands out a free TCP port per service, preferring the service's declared
//! port and probing a deterministic fallback range when it is occupied.
//! Availability is confirmed by actually binding; the bound listeners are
//! held until just before the container binds, shrinking the window in which
//! another process could steal the port.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::TcpListener;

use crate::error::{Error, Result};

/// Default number of fallback ports probed above the preferred port.
pub const DEFAULT_FALLBACK_RANGE: u16 = 10;

/// Port allocator for one orchestration session.
///
/// Interior mutability throughout: concurrent `allocate` calls from parallel
/// service workers are serialized on the internal mutex, so two workers can
/// never both observe the same free port as available. Ports committed to a
/// service stay committed for the whole session, even if later freed by the
/// OS.
pub struct PortAllocator {
    inner: Mutex<Inner>,
    /// Listeners held to keep allocated ports reserved until release.
    listeners: Mutex<Vec<TcpListener>>,
    fallback_range: u16,
}

struct Inner {
    /// service name -> committed port
    by_service: HashMap<String, u16>,
    /// all committed ports
    ports: HashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_fallback_range(DEFAULT_FALLBACK_RANGE)
    }

    pub fn with_fallback_range(fallback_range: u16) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_service: HashMap::new(),
                ports: HashSet::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            fallback_range: fallback_range.max(1),
        }
    }

    /// Allocate a port for `service`, preferring `preferred`.
    ///
    /// - The service already holds a port this session (idempotent restart):
    ///   that port is returned unchanged.
    /// - The preferred port is free: it is returned.
    /// - The preferred port is occupied by a foreign process: the fallback
    ///   range `preferred+1 ..= preferred+N` is probed in order.
    /// - Nothing in the range is free: `PortConflict`.
    pub fn allocate(&self, service: &str, preferred: u16) -> Result<u16> {
        let mut inner = self.inner.lock();

        if let Some(&existing) = inner.by_service.get(service) {
            tracing::debug!("Service '{}' reuses session port {}", service, existing);
            return Ok(existing);
        }

        let mut candidates = vec![preferred];
        candidates.extend(
            (1..=self.fallback_range).filter_map(|offset| preferred.checked_add(offset)),
        );

        for port in candidates {
            if inner.ports.contains(&port) {
                continue;
            }
            if let Some(bound) = try_bind(port) {
                if port != preferred {
                    tracing::info!(
                        "Port {} busy, allocated fallback {} for service '{}'",
                        preferred,
                        port,
                        service
                    );
                }
                self.listeners.lock().extend(bound);
                inner.ports.insert(port);
                inner.by_service.insert(service.to_string(), port);
                return Ok(port);
            }
        }

        Err(Error::PortConflict {
            service: service.to_string(),
            port: preferred,
        })
    }

    /// Mark a port as committed without binding a listener.
    ///
    /// Used for ports already held by this session's own running services:
    /// the port is occupied by us, so a bind check would spuriously fail.
    pub fn mark_allocated(&self, service: &str, port: u16) {
        let mut inner = self.inner.lock();
        inner.ports.insert(port);
        inner.by_service.insert(service.to_string(), port);
    }

    /// The port committed to `service`, if any.
    pub fn port_for(&self, service: &str) -> Option<u16> {
        self.inner.lock().by_service.get(service).copied()
    }

    /// All committed ports for the session, sorted.
    pub fn allocated_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.inner.lock().ports.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Snapshot of the full service -> port table.
    pub fn allocations(&self) -> HashMap<String, u16> {
        self.inner.lock().by_service.clone()
    }

    /// Drop the held listeners so services can bind their ports.
    ///
    /// Ports stay committed; only the reservations are released. Callers
    /// release as late as possible, immediately before the container binds.
    pub fn release_listeners(&self) {
        self.listeners.lock().clear();
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind-check a port on both loopback and the wildcard address.
///
/// A process bound on `:::PORT` or `0.0.0.0:PORT` won't conflict with an
/// IPv4-loopback-only check, so both are tried. On Linux the wildcard bind
/// may fail with EADDRINUSE because the loopback bind already covers it;
/// the loopback listener alone still reserves the port there.
fn try_bind(port: u16) -> Option<Vec<TcpListener>> {
    let loopback = TcpListener::bind(("127.0.0.1", port)).ok()?;
    let mut bound = vec![loopback];
    if let Ok(any) = TcpListener::bind(("0.0.0.0", port)) {
        bound.push(any);
    }
    Some(bound)
}
