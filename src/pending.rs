//! Outstanding command tracking
//!
//! The protocol has no correlation id beyond the command code, so at most one
//! request per code is outstanding. A success or failure response is
//! "solicited" when its command code is found (and removed) here.

use parking_lot::Mutex;
use std::collections::BTreeSet;

use crate::types::{ServerCommand, ServerResponse};

/// Sorted set of command codes awaiting a response.
#[derive(Debug, Default)]
pub struct PendingRequestTracker {
    codes: Mutex<BTreeSet<u8>>,
}

impl PendingRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `command` as outstanding. Returns false if it already was.
    pub fn register(&self, command: ServerCommand) -> bool {
        self.codes.lock().insert(command.code())
    }

    /// Drops a registration whose send failed.
    pub fn cancel(&self, command: ServerCommand) -> bool {
        self.codes.lock().remove(&command.code())
    }

    /// Classifies a response, consuming the matching registration.
    pub fn resolve(&self, response: ServerResponse, command_code: u8) -> bool {
        response.is_solicited_class() && self.codes.lock().remove(&command_code)
    }

    pub fn is_pending(&self, command: ServerCommand) -> bool {
        self.codes.lock().contains(&command.code())
    }

    pub fn outstanding(&self) -> Vec<u8> {
        self.codes.lock().iter().copied().collect()
    }

    pub fn clear(&self) {
        self.codes.lock().clear();
    }
}
