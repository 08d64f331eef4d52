//! `devicekit-core` connects a field recorder to its API server.
//!
//! A [`Device`] owns the on-disk state: the public identity config, the
//! private credential and the advisory lock that guards it. Connecting
//! registers the device on first use and authenticates afterwards, yielding a
//! [`DeviceApi`] for recording uploads, event reports, schedules and file
//! downloads.
//!
//! ```no_run
//! # async fn run() -> Result<(), devicekit_core::DeviceKitError> {
//! use devicekit_core::Device;
//!
//! let device = Device::default();
//! let api = device.connect().await?;
//! let schedule = api.get_schedule().await?;
//! # Ok(())
//! # }
//! ```
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

mod api;
pub use api::*;

mod config;
pub use config::*;

mod credential;
pub use credential::*;

mod device;
pub use device::*;

mod error;
pub use error::*;

mod fs;
pub use fs::*;

mod lock;
pub use lock::*;

mod paths;
pub use paths::*;

mod session;
pub use session::*;

mod transport;
pub use transport::*;

pub mod defaults;
pub mod logger;

// private modules
mod http_request;
