/*!
 * Error types for driver operations.
 */
use std::fmt;

use thiserror::Error;

use mapperflow_core::{
    error::Error as CoreError,
    types::{DeviceId, UnsupportedType},
};

/// One of the three configuration blobs a mapper call carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigPart {
    /// Connection-level settings shared by all features of a device
    Common,
    /// Per-feature access descriptor
    Visitor,
    /// Protocol-specific settings
    Protocol,
}

impl fmt::Display for ConfigPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigPart::Common => "common",
            ConfigPart::Visitor => "visitor",
            ConfigPart::Protocol => "protocol",
        })
    }
}

/// Error type for driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    /// A configuration blob could not be decoded; nothing was applied
    #[error("failed to decode {which} config: {message}")]
    Decode {
        /// The blob that failed
        which: ConfigPart,
        /// Decoder message
        message: String,
    },

    /// The written value has no wire representation
    #[error(transparent)]
    UnsupportedType(#[from] UnsupportedType),

    /// A virtual feature rejected the written value
    #[error("invalid value {value:?} for {feature}: {reason}")]
    Validation {
        /// Feature name
        feature: String,
        /// Rejected value (canonical text)
        value: String,
        /// Which values would have been accepted
        reason: String,
    },

    /// Transient device-level failure; the link is still up
    #[error("device {device}: {message}")]
    SoftHardware {
        /// Device the call was made on
        device: DeviceId,
        /// Error message with call context
        message: String,
    },

    /// Link-level failure; reconnection has been scheduled
    #[error("device {device} link down: {message}")]
    HardHardware {
        /// Device the call was made on
        device: DeviceId,
        /// Error message with call context
        message: String,
    },

    /// The device exists but is not connected
    #[error("device {0} is unreachable")]
    NotConnected(DeviceId),

    /// No record exists for the device
    #[error("device {0} is not initialized")]
    UnknownDevice(DeviceId),

    /// The common config does not name a device
    #[error("device serial number can not be empty")]
    MissingDeviceId,

    /// Capture upload failed
    #[error("publish error: {0}")]
    Publish(String),

    /// The vendor library could not be loaded or lacks a symbol
    #[error("library error: {0}")]
    Library(String),

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl DriverError {
    /// Create a validation error listing the accepted values
    pub fn validation<F, V, R>(feature: F, value: V, reason: R) -> Self
    where
        F: Into<String>,
        V: Into<String>,
        R: Into<String>,
    {
        DriverError::Validation {
            feature: feature.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error took the device link down
    pub fn is_link_down(&self) -> bool {
        matches!(self, DriverError::HardHardware { .. })
    }
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;
