//! Device lock / erase PINs

use crate::defaults::DEVICE_LOCK_PIN_LEN;
use rand::Rng;
use std::fmt;
use thiserror::Error;

/// Errors when parsing a PIN received over the wire
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("PIN must be 6 characters, got {0}")]
    InvalidLength(usize),

    #[error("PIN must contain only digits")]
    NonDigit,
}

/// Six-digit PIN generated for each DeviceLock / EraseDevice command
///
/// Kept as a string so leading zeros survive storage and display.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceLockSecret(String);

impl DeviceLockSecret {
    /// Generate a fresh random PIN
    pub fn generate() -> Self {
        let value = rand::thread_rng().gen_range(0..10u32.pow(DEVICE_LOCK_PIN_LEN as u32));
        Self::from_value(value)
    }

    /// Build a PIN from a number, zero-padded; values above 999999 wrap
    pub fn from_value(value: u32) -> Self {
        let value = value % 10u32.pow(DEVICE_LOCK_PIN_LEN as u32);
        Self(format!("{:0width$}", value, width = DEVICE_LOCK_PIN_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for DeviceLockSecret {
    type Error = SecretError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.len() != DEVICE_LOCK_PIN_LEN {
            return Err(SecretError::InvalidLength(value.len()));
        }
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SecretError::NonDigit);
        }
        Ok(Self(value.to_string()))
    }
}

impl fmt::Display for DeviceLockSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// PINs end up in logs through command Debug output otherwise
impl fmt::Debug for DeviceLockSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceLockSecret(******)")
    }
}
