use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Externally visible connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BridgeState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Failed = 4,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BridgeState::Connecting,
            2 => BridgeState::Connected,
            3 => BridgeState::Reconnecting,
            4 => BridgeState::Failed,
            _ => BridgeState::Idle,
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Idle => "idle",
            BridgeState::Connecting => "connecting",
            BridgeState::Connected => "connected",
            BridgeState::Reconnecting => "reconnecting",
            BridgeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lock-free state holder. Only the controller task writes; readers may be
/// anywhere.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: BridgeState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> BridgeState {
        BridgeState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: BridgeState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Atomically move `from -> to`. Returns false if the current state was
    /// not `from`, in which case nothing changes.
    pub fn transition(&self, from: BridgeState, to: BridgeState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
