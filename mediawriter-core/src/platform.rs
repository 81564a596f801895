//! Platform-specific device handling.
//!
//! Each OS module implements the [`crate::device::Platform`] and
//! [`crate::device::BlockDevice`] capability traits and exposes device
//! discovery. The implementation for the build target is re-exported here
//! and aliased as [`NativePlatform`], so the rest of the library picks its
//! primitives at compile time.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

/// The platform implementation for the build target.
#[cfg(target_os = "linux")]
pub type NativePlatform = LinuxPlatform;
