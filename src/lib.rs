//! Block device over a serial NOR flash part attached to a SMIF (serial
//! memory interface) peripheral.
//!
//! The peripheral itself is reached through [`MemoryInterface`]; the flash
//! part's command set comes from a static [`MemSlot`] table. [`SmifBlockDevice`]
//! and [`AsyncSmifBlockDevice`] sequence those commands into the generic
//! [`BlockDevice`] / [`AsyncBlockDevice`] contract.
#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

#[macro_use]
mod fmt;

pub mod async_block_device;
pub mod block_device;
pub mod config;
pub mod error;
pub mod peripheral;
mod poll;
pub mod slot;
pub mod traits;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use async_block_device::AsyncSmifBlockDevice;
pub use block_device::SmifBlockDevice;
pub use config::{BlockDeviceConfig, PollConfig};
pub use error::{status_code, Error, BD_ERROR_DEVICE_ERROR, BD_ERROR_OK};
pub use peripheral::MemoryInterface;
pub use slot::{Geometry, MemSlot};
pub use traits::{AsyncBlockDevice, BdAddr, BdSize, BlockDevice};
