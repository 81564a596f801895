//! Block devices: the discovery record shown to users, and the capability
//! interface the writer drives.
//!
//! The writer never touches a file descriptor directly. It goes through
//! [`Platform`] (prepare, open) and [`BlockDevice`] (lock, write, unlock),
//! implemented per OS in [`crate::platform`]. A device is closed when it is
//! dropped, and a [`LockedDevice`] unlocks on drop, so every exit path of a
//! job releases the drive.
use std::fmt;
use std::io::{self, Read, Seek};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// A removable block device discovered on the system.
#[derive(Clone, Debug)]
pub struct Device {
    /// The system path to the device (e.g. `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel-provided name (e.g. "sdb").
    pub name: String,
    /// Vendor and model as reported by the kernel, if any.
    pub model: String,
    pub size_bytes: u64,
    /// Mount points of the device and its partitions.
    pub mount_points: Vec<PathBuf>,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mounts = if self.mount_points.is_empty() {
            "[Not mounted]".to_string()
        } else {
            let list: Vec<String> = self
                .mount_points
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            format!("[Mounted at {}]", list.join(", "))
        };

        write!(
            f,
            "{:<15} {:<24} {:>6.1} GB {}",
            self.path.display(),
            self.model,
            self.size_gb(),
            mounts
        )
    }
}

/// Raw access to one opened device.
pub trait BlockDevice {
    /// Takes the exclusive volume lock without blocking.
    fn try_lock(&mut self) -> io::Result<()>;

    fn unlock(&mut self) -> io::Result<()>;

    /// Writes `data` at byte `offset` and reports how many bytes the device
    /// accepted. One write is in flight at a time.
    fn write_block(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;

    /// Required multiple for the length of every write (1 = no requirement).
    fn alignment(&self) -> usize;

    fn size(&self) -> io::Result<u64>;

    /// Flushes everything written so far to the medium.
    fn sync(&mut self) -> io::Result<()>;

    /// Asks the kernel to re-read the partition table. No-op where meaningless.
    fn reread_partitions(&mut self) -> io::Result<()>;
}

/// OS-specific operations on device paths.
pub trait Platform {
    type Device: BlockDevice;
    type Reader: Read + Seek;

    /// Unmounts everything on `device` and destroys its partition table.
    fn prepare(&self, device: &Path) -> io::Result<()>;

    /// Opens `device` for exclusive read/write.
    fn open(&self, device: &Path) -> io::Result<Self::Device>;

    /// Opens `device` read-only, e.g. for the post-write media check.
    fn open_reader(&self, device: &Path) -> io::Result<Self::Reader>;

    /// Path of partition `index` on `device`, or `None` when `device` is not a
    /// partitionable block device.
    fn partition_path(&self, device: &Path, index: u32) -> Option<PathBuf>;
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Couldn't open the drive for writing ({0})")]
    Open(io::Error),

    #[error("Couldn't lock the drive ({0})")]
    Lock(io::Error),
}

/// A device holding the exclusive lock. Unlocks when dropped.
pub struct LockedDevice<D: BlockDevice> {
    device: D,
}

impl<D: BlockDevice> LockedDevice<D> {
    /// Tries to lock `device` up to `attempts` times, sleeping `delay` between
    /// tries. On failure the device is dropped, i.e. closed.
    pub fn acquire(mut device: D, attempts: u32, delay: Duration) -> Result<Self, LockError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match device.try_lock() {
                Ok(()) => {
                    tracing::debug!(attempt, "device locked");
                    return Ok(Self { device });
                }
                Err(e) if attempt >= attempts => {
                    tracing::error!(attempt, "giving up on device lock: {e}");
                    return Err(LockError::Lock(e));
                }
                Err(e) => {
                    tracing::warn!(attempt, "device lock failed, retrying: {e}");
                    attempt += 1;
                    thread::sleep(delay);
                }
            }
        }
    }
}

impl<D: BlockDevice> Deref for LockedDevice<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.device
    }
}

impl<D: BlockDevice> DerefMut for LockedDevice<D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: BlockDevice> Drop for LockedDevice<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.unlock() {
            tracing::warn!("Couldn't unlock the drive: {e}");
        }
    }
}

/// Opens and locks `path` with the given retry policy.
pub fn open_locked<P: Platform>(
    platform: &P,
    path: &Path,
    attempts: u32,
    delay: Duration,
) -> Result<LockedDevice<P::Device>, LockError> {
    let device = platform.open(path).map_err(LockError::Open)?;
    LockedDevice::acquire(device, attempts, delay)
}
