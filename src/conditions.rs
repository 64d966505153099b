//! Admission condition seam
//!
//! The manager checks network type and charging state before admitting a
//! queued download. Hosts inject their platform's signals through
//! [`ConditionProvider`]; the crate ships a permissive default and a
//! toggleable implementation for tests and headless use.

use crate::types::NetworkConstraint;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Snapshot of the host's network connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    /// Any network is reachable
    pub connected: bool,
    /// The active network is unmetered (Wi-Fi / ethernet)
    pub unmetered: bool,
}

impl NetworkState {
    /// Check whether this state satisfies a download's constraint
    pub fn satisfies(&self, constraint: NetworkConstraint) -> bool {
        match constraint {
            NetworkConstraint::Any => self.connected,
            NetworkConstraint::Unmetered => self.connected && self.unmetered,
        }
    }
}

/// Host-supplied admission signals
pub trait ConditionProvider: Send + Sync {
    /// Current network connectivity
    fn network(&self) -> NetworkState;

    /// Whether the device is charging
    fn charging(&self) -> bool;
}

/// Permissive provider: always connected, unmetered, and charging.
///
/// The default for hosts without platform signals.
#[derive(Debug, Default)]
pub struct AlwaysReady;

impl ConditionProvider for AlwaysReady {
    fn network(&self) -> NetworkState {
        NetworkState {
            connected: true,
            unmetered: true,
        }
    }

    fn charging(&self) -> bool {
        true
    }
}

/// Provider whose signals can be flipped at runtime.
///
/// Useful for tests and for hosts that push connectivity callbacks.
#[derive(Debug)]
pub struct ToggleConditions {
    network: RwLock<NetworkState>,
    charging: AtomicBool,
}

impl ToggleConditions {
    pub fn new(network: NetworkState, charging: bool) -> Self {
        Self {
            network: RwLock::new(network),
            charging: AtomicBool::new(charging),
        }
    }

    /// Replace the network snapshot
    pub fn set_network(&self, state: NetworkState) {
        *self.network.write() = state;
    }

    /// Flip the charging signal
    pub fn set_charging(&self, charging: bool) {
        self.charging.store(charging, Ordering::Relaxed);
    }
}

impl Default for ToggleConditions {
    fn default() -> Self {
        Self::new(
            NetworkState {
                connected: true,
                unmetered: true,
            },
            true,
        )
    }
}

impl ConditionProvider for ToggleConditions {
    fn network(&self) -> NetworkState {
        *self.network.read()
    }

    fn charging(&self) -> bool {
        self.charging.load(Ordering::Relaxed)
    }
}
