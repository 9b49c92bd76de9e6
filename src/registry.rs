//! Channel registry / multiplexer.
//!
//! Maps each [`ChannelAddress`] to at most one live [`ChannelConnection`]
//! and reference-counts its consumers. The first [`ChannelRegistry::acquire`]
//! for an address opens the connection; the release that brings the count to
//! zero closes it.
//!
//! # Single-flight
//!
//! `acquire` and `release` run entirely under the map lock. Opening a
//! connection only spawns its background task (the handshake happens there),
//! so nothing awaits while the lock is held and two concurrent acquires for
//! the same address always observe each other.
//!
//! There is no global registry: create one and hand clones to the feeds
//! that need it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::{ChannelAddress, ChannelConnection, ErrorHook, ReconnectPolicy};

/// Outcome of [`ChannelRegistry::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other consumers still hold the connection.
    Released {
        /// References left after this release.
        remaining: usize,
    },
    /// This was the last reference; the connection was closed and removed.
    Closed,
    /// No entry exists for the address. Nothing was closed.
    Unknown,
}

/// One registry entry.
struct Entry {
    connection: ChannelConnection,
    refs: usize,
}

/// Shared, cloneable registry handle.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<HashMap<ChannelAddress, Entry>>,
    hook: Option<ErrorHook>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.lock();
        f.debug_struct("ChannelRegistry")
            .field("connections", &entries.len())
            .field("has_hook", &self.inner.hook.is_some())
            .finish()
    }
}

impl ChannelRegistry {
    /// Empty registry without an error hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry whose connections report faults to `hook`.
    #[must_use]
    pub fn with_hook(hook: ErrorHook) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                hook: Some(hook),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelAddress, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the connection for `address`, opening it if needed, and take a
    /// reference to it.
    ///
    /// `policy` only applies when a connection is opened; an existing live
    /// connection keeps the policy it was opened with. A terminally closed
    /// entry is replaced by a fresh connection and keeps its reference count,
    /// since its holders will still release it.
    pub fn acquire(&self, address: &ChannelAddress, policy: &ReconnectPolicy) -> ChannelConnection {
        let mut entries = self.lock();

        if let Some(entry) = entries.get_mut(address) {
            if entry.connection.is_closed() {
                log::warn!(
                    "[Registry] Replacing terminally closed connection for {} ({} holder(s))",
                    address,
                    entry.refs
                );
                entry.connection = self.open(address, policy);
            }
            entry.refs += 1;
            log::debug!("[Registry] Reusing {} (refs={})", address, entry.refs);
            return entry.connection.clone();
        }

        let connection = self.open(address, policy);
        entries.insert(
            address.clone(),
            Entry {
                connection: connection.clone(),
                refs: 1,
            },
        );
        log::debug!("[Registry] Created {} (refs=1)", address);
        connection
    }

    fn open(&self, address: &ChannelAddress, policy: &ReconnectPolicy) -> ChannelConnection {
        ChannelConnection::open_with_hook(address.clone(), policy.clone(), self.inner.hook.clone())
    }

    /// Drop one reference to `address`; the last one closes the connection.
    pub fn release(&self, address: &ChannelAddress) -> ReleaseOutcome {
        let mut entries = self.lock();

        let Some(entry) = entries.get_mut(address) else {
            log::warn!("[Registry] Release for unknown address {}", address);
            return ReleaseOutcome::Unknown;
        };

        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            log::debug!("[Registry] Released {} (refs={})", address, entry.refs);
            return ReleaseOutcome::Released {
                remaining: entry.refs,
            };
        }

        if let Some(entry) = entries.remove(address) {
            entry.connection.close();
        }
        log::debug!("[Registry] Last reference to {} released", address);
        ReleaseOutcome::Closed
    }

    /// Current reference count for `address` (0 when absent).
    #[must_use]
    pub fn ref_count(&self, address: &ChannelAddress) -> usize {
        self.lock().get(address).map_or(0, |entry| entry.refs)
    }

    /// The live connection for `address`, without taking a reference.
    #[must_use]
    pub fn get(&self, address: &ChannelAddress) -> Option<ChannelConnection> {
        self.lock().get(address).map(|entry| entry.connection.clone())
    }

    /// Number of addresses with a connection.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close every connection regardless of reference counts.
    ///
    /// For process shutdown; later releases return [`ReleaseOutcome::Unknown`].
    pub fn close_all(&self) {
        let drained: Vec<Entry> = self.lock().drain().map(|(_, entry)| entry).collect();
        if !drained.is_empty() {
            log::info!("[Registry] Closing {} connection(s)", drained.len());
        }
        for entry in drained {
            entry.connection.close();
        }
    }
}
