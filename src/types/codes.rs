//! Command and response codes of the publisher protocol

use std::fmt;

/// Commands sent from subscriber to publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServerCommand {
    Authenticate,
    MetadataRefresh,
    Subscribe,
    Unsubscribe,
    RotateCipherKeys,
    UpdateProcessingInterval,
    DefineOperationalModes,
    ConfirmNotification,
    ConfirmBufferBlock,
    /// One of the sixteen user-defined commands (`0..=15`).
    User(u8),
}

impl ServerCommand {
    const USER_BASE: u8 = 0xD0;

    pub fn code(self) -> u8 {
        match self {
            Self::Authenticate => 0x00,
            Self::MetadataRefresh => 0x01,
            Self::Subscribe => 0x02,
            Self::Unsubscribe => 0x03,
            Self::RotateCipherKeys => 0x04,
            Self::UpdateProcessingInterval => 0x05,
            Self::DefineOperationalModes => 0x06,
            Self::ConfirmNotification => 0x07,
            Self::ConfirmBufferBlock => 0x08,
            Self::User(index) => Self::USER_BASE + (index & 0x0F),
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let command = match code {
            0x00 => Self::Authenticate,
            0x01 => Self::MetadataRefresh,
            0x02 => Self::Subscribe,
            0x03 => Self::Unsubscribe,
            0x04 => Self::RotateCipherKeys,
            0x05 => Self::UpdateProcessingInterval,
            0x06 => Self::DefineOperationalModes,
            0x07 => Self::ConfirmNotification,
            0x08 => Self::ConfirmBufferBlock,
            0xD0..=0xDF => Self::User(code - Self::USER_BASE),
            _ => return None,
        };
        Some(command)
    }

    /// Commands whose responses are correlated through the pending-request set.
    ///
    /// Acknowledgements and mode negotiation never get a solicited reply.
    pub fn expects_response(self) -> bool {
        !matches!(
            self,
            Self::DefineOperationalModes | Self::ConfirmNotification | Self::ConfirmBufferBlock
        )
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(index) => write!(f, "UserCommand{index:02}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Responses sent from publisher to subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerResponse {
    Succeeded,
    Failed,
    DataPacket,
    UpdateSignalIndexCache,
    UpdateBaseTimes,
    UpdateCipherKeys,
    DataStartTime,
    ProcessingComplete,
    BufferBlock,
    Notify,
    ConfigurationChanged,
    /// One of the sixteen user-defined responses (`0..=15`).
    User(u8),
    NoOp,
}

impl ServerResponse {
    const USER_BASE: u8 = 0xE0;

    pub fn code(self) -> u8 {
        match self {
            Self::Succeeded => 0x80,
            Self::Failed => 0x81,
            Self::DataPacket => 0x82,
            Self::UpdateSignalIndexCache => 0x83,
            Self::UpdateBaseTimes => 0x84,
            Self::UpdateCipherKeys => 0x85,
            Self::DataStartTime => 0x86,
            Self::ProcessingComplete => 0x87,
            Self::BufferBlock => 0x88,
            Self::Notify => 0x89,
            Self::ConfigurationChanged => 0x8A,
            Self::User(index) => Self::USER_BASE + (index & 0x0F),
            Self::NoOp => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let response = match code {
            0x80 => Self::Succeeded,
            0x81 => Self::Failed,
            0x82 => Self::DataPacket,
            0x83 => Self::UpdateSignalIndexCache,
            0x84 => Self::UpdateBaseTimes,
            0x85 => Self::UpdateCipherKeys,
            0x86 => Self::DataStartTime,
            0x87 => Self::ProcessingComplete,
            0x88 => Self::BufferBlock,
            0x89 => Self::Notify,
            0x8A => Self::ConfigurationChanged,
            0xE0..=0xEF => Self::User(code - Self::USER_BASE),
            0xFF => Self::NoOp,
            _ => return None,
        };
        Some(response)
    }

    /// Success and failure codes are the only ones correlated to a sent command.
    pub fn is_solicited_class(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for ServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(index) => write!(f, "UserResponse{index:02}"),
            other => write!(f, "{other:?}"),
        }
    }
}
