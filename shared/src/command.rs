//! Remote management commands
//!
//! Each request type carries only its own fields. The plist rendering lives
//! in [`crate::codec`].

use crate::DeviceLockSecret;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// The `RequestType` discriminator of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    InstallProfile,
    RemoveProfile,
    DeviceLock,
    EraseDevice,
    InstallEnterpriseApplication,
    AccountConfiguration,
}

impl RequestType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InstallProfile => "InstallProfile",
            Self::RemoveProfile => "RemoveProfile",
            Self::DeviceLock => "DeviceLock",
            Self::EraseDevice => "EraseDevice",
            Self::InstallEnterpriseApplication => "InstallEnterpriseApplication",
            Self::AccountConfiguration => "AccountConfiguration",
        }
    }
}

impl FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InstallProfile" => Ok(Self::InstallProfile),
            "RemoveProfile" => Ok(Self::RemoveProfile),
            "DeviceLock" => Ok(Self::DeviceLock),
            "EraseDevice" => Ok(Self::EraseDevice),
            "InstallEnterpriseApplication" => Ok(Self::InstallEnterpriseApplication),
            "AccountConfiguration" => Ok(Self::AccountConfiguration),
            _ => Err(format!("Unknown request type: {s}")),
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an EraseDevice does when the device cannot erase normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObliterationBehavior {
    #[default]
    Default,
    DoNotObliterate,
    ObliterateWithWarning,
    Always,
}

impl ObliterationBehavior {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::DoNotObliterate => "DoNotObliterate",
            Self::ObliterateWithWarning => "ObliterateWithWarning",
            Self::Always => "Always",
        }
    }
}

impl FromStr for ObliterationBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Default" => Ok(Self::Default),
            "DoNotObliterate" => Ok(Self::DoNotObliterate),
            "ObliterateWithWarning" => Ok(Self::ObliterateWithWarning),
            "Always" => Ok(Self::Always),
            _ => Err(format!("Unknown obliteration behavior: {s}")),
        }
    }
}

/// Variant-specific command fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    /// Install a configuration profile (raw mobileconfig bytes)
    InstallProfile { payload: Bytes },
    /// Remove the profile with the given identifier
    RemoveProfile { identifier: String },
    DeviceLock { pin: DeviceLockSecret },
    EraseDevice {
        pin: DeviceLockSecret,
        obliteration: ObliterationBehavior,
    },
    InstallEnterpriseApplication { manifest_url: String },
    AccountConfiguration {
        full_name: String,
        user_name: String,
        lock_primary_account_info: bool,
    },
}

impl CommandPayload {
    pub fn request_type(&self) -> RequestType {
        match self {
            Self::InstallProfile { .. } => RequestType::InstallProfile,
            Self::RemoveProfile { .. } => RequestType::RemoveProfile,
            Self::DeviceLock { .. } => RequestType::DeviceLock,
            Self::EraseDevice { .. } => RequestType::EraseDevice,
            Self::InstallEnterpriseApplication { .. } => {
                RequestType::InstallEnterpriseApplication
            }
            Self::AccountConfiguration { .. } => RequestType::AccountConfiguration,
        }
    }

    /// The PIN carried by lock and erase commands
    pub fn secret(&self) -> Option<&DeviceLockSecret> {
        match self {
            Self::DeviceLock { pin } | Self::EraseDevice { pin, .. } => Some(pin),
            _ => None,
        }
    }
}

/// A uniquely identified command envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_uuid: String,
    pub payload: CommandPayload,
}

impl Command {
    pub fn new(command_uuid: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            command_uuid: command_uuid.into(),
            payload,
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.payload.request_type()
    }
}

/// Who a command is on behalf of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribution {
    /// Issued by the user with this id
    User(u32),
    /// Issued by the server itself
    System,
}

impl Attribution {
    /// Resolve a profile's stored owner id; zero means nobody owns it
    pub fn from_profile_owner(user_id: u32) -> Self {
        if user_id == 0 {
            Self::System
        } else {
            Self::User(user_id)
        }
    }

    pub fn user_id(&self) -> Option<u32> {
        match self {
            Self::User(id) => Some(*id),
            Self::System => None,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}
