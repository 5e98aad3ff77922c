//! Connection lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a subscriber session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Subscribed,
}

impl ConnectionState {
    /// True once the command channel is up, regardless of auth or subscription.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated | Self::Subscribed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Subscribed => "subscribed",
        };
        f.write_str(name)
    }
}
