#![cfg_attr(not(test), no_std)]

extern crate alloc;

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod asynch;

mod config;
pub mod error;
mod framer;
mod hex;
mod params;

#[cfg(test)]
mod test_helpers;

pub use asynch::{AtHandle, Client, Exchange, Runner, StopTagGuard, UrcLine};
pub use config::Config;
pub use error::{DeviceError, DeviceErrorKind, Error};
pub use params::Parameter;
