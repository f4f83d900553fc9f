//! Command issuing for the server
//!
//! This module handles:
//! - Rendering typed MDM commands into plist envelopes
//! - Resolving who a command is attributed to
//! - Queuing commands per target device
//! - Waking devices with push notifications and reporting failed pushes

mod commander;
mod notifier;

pub use commander::{Commander, CommanderError};
pub use notifier::{DeliveryError, PushNotifier, BAD_GATEWAY};
