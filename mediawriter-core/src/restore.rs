//! Returns a written drive to everyday use: one FAT32 partition spanning it.
use crate::device::{BlockDevice, LockError, Platform, open_locked};
use crate::status::{ExitStatus, StatusReporter};
use crate::write::{AlignedBuffer, WriteOptions};
use std::io::{self, Write};
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const SECTOR: u64 = 512;
pub const PARTITION_START_LBA: u32 = 2048;
/// FAT32 with LBA addressing.
const PARTITION_TYPE: u8 = 0x0C;
const PARTITION_ENTRY: usize = 446;
const DISK_SIGNATURE: usize = 440;
/// CHS "beyond 1024 cylinders": tells readers to use the LBA fields.
const CHS_UNUSED: [u8; 3] = [0xFE, 0xFF, 0xFF];
const PARTITION_NODE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("The drive is too small to hold a partition.")]
    TooSmall { size: u64 },

    #[error("Couldn't write the partition table ({0})")]
    Write(io::Error),

    #[error("Couldn't format the new partition ({0})")]
    Format(String),
}

/// A classic MBR with a single FAT32-LBA partition from sector 2048 to the
/// end of the device (capped at what 32-bit LBA can address).
pub fn build_mbr(device_size: u64, disk_signature: u32) -> Result<[u8; 512], RestoreError> {
    let sectors = device_size / SECTOR;
    let start = u64::from(PARTITION_START_LBA);
    if sectors <= start {
        return Err(RestoreError::TooSmall { size: device_size });
    }
    let length = (sectors - start).min(u64::from(u32::MAX)) as u32;

    let mut mbr = [0u8; 512];
    mbr[DISK_SIGNATURE..DISK_SIGNATURE + 4].copy_from_slice(&disk_signature.to_le_bytes());
    let entry = &mut mbr[PARTITION_ENTRY..PARTITION_ENTRY + 16];
    entry[0] = 0x00;
    entry[1..4].copy_from_slice(&CHS_UNUSED);
    entry[4] = PARTITION_TYPE;
    entry[5..8].copy_from_slice(&CHS_UNUSED);
    entry[8..12].copy_from_slice(&PARTITION_START_LBA.to_le_bytes());
    entry[12..16].copy_from_slice(&length.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    Ok(mbr)
}

fn write_partition_table<P: Platform>(
    platform: &P,
    device: &Path,
    opts: &WriteOptions,
) -> Result<(), RestoreError> {
    let mut locked = open_locked(platform, device, opts.lock_attempts, opts.lock_retry_delay)?;
    let size = locked.size().map_err(RestoreError::Write)?;
    let mbr = build_mbr(size, rand::random())?;

    let alignment = locked.alignment();
    let mut buffer = AlignedBuffer::new(mbr.len());
    buffer.block_mut().copy_from_slice(&mbr);
    let data = buffer.padded(mbr.len(), alignment);
    let written = locked.write_block(0, data).map_err(RestoreError::Write)?;
    if written != data.len() {
        return Err(RestoreError::Write(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("wrote {written} of {} bytes", data.len()),
        )));
    }
    locked.sync().map_err(RestoreError::Write)?;
    if let Err(e) = locked.reread_partitions() {
        tracing::warn!("re-reading partitions of {} failed: {e}", device.display());
    }
    Ok(())
}

fn format_partition(partition: &Path) -> Result<(), RestoreError> {
    let mut waited = Duration::ZERO;
    while !partition.exists() && waited < PARTITION_NODE_WAIT {
        thread::sleep(Duration::from_millis(100));
        waited += Duration::from_millis(100);
    }

    tracing::info!("formatting {}", partition.display());
    let output = Command::new("mkfs.vfat")
        .arg("-F")
        .arg("32")
        .arg(partition)
        .output()
        .map_err(|e| RestoreError::Format(e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RestoreError::Format(stderr.trim().to_string()));
    }
    Ok(())
}

fn restore<P: Platform>(platform: &P, device: &Path, opts: &WriteOptions) -> Result<(), RestoreError> {
    if let Err(e) = platform.prepare(device) {
        tracing::warn!("preparing {} failed: {e}", device.display());
    }
    // The lock is released before formatting: mkfs opens the partition itself.
    write_partition_table(platform, device, opts)?;
    match platform.partition_path(device, 1) {
        Some(partition) => format_partition(&partition),
        None => {
            tracing::info!("{} is not a block device, skipping format", device.display());
            Ok(())
        }
    }
}

/// Runs the restore job and returns the helper's exit status.
pub fn run<P: Platform, O: Write, E: Write>(
    device: &Path,
    opts: &WriteOptions,
    platform: &P,
    status: &mut StatusReporter<O, E>,
) -> ExitStatus {
    tracing::info!(device = %device.display(), "restore job started");
    match restore(platform, device, opts) {
        Ok(()) => {
            status.ok();
            ExitStatus::Success
        }
        Err(e) => {
            tracing::error!(?e, "restore failed: {e}");
            status.failure(&e);
            ExitStatus::DriveFailure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{MemoryFaults, MemoryPlatform};

    fn le32(bytes: &[u8]) -> u32 {
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    fn fast() -> WriteOptions {
        WriteOptions {
            lock_retry_delay: Duration::ZERO,
            ..WriteOptions::default()
        }
    }

    #[test]
    fn mbr_has_one_fat32_partition_after_the_gap() {
        let size = 16 * 1024 * 1024 * 1024u64;
        let mbr = build_mbr(size, 0xDEADBEEF).unwrap();
        let entry = &mbr[PARTITION_ENTRY..PARTITION_ENTRY + 16];
        assert_eq!(entry[0], 0);
        assert_eq!(&entry[1..4], &CHS_UNUSED);
        assert_eq!(entry[4], 0x0C);
        assert_eq!(le32(&entry[8..12]), 2048);
        assert_eq!(u64::from(le32(&entry[12..16])), size / 512 - 2048);
        assert_eq!(le32(&mbr[440..444]), 0xDEADBEEF);
        assert_eq!(&mbr[510..], &[0x55, 0xAA]);
        assert!(mbr[PARTITION_ENTRY + 16..510].iter().all(|&b| b == 0));
    }

    #[test]
    fn huge_devices_are_capped_at_32_bit_lba() {
        let mbr = build_mbr(4 * 1024u64.pow(4), 1).unwrap();
        assert_eq!(le32(&mbr[PARTITION_ENTRY + 12..PARTITION_ENTRY + 16]), u32::MAX);
    }

    #[test]
    fn tiny_devices_are_rejected() {
        assert!(matches!(
            build_mbr(2048 * 512, 1),
            Err(RestoreError::TooSmall { .. })
        ));
    }

    #[test]
    fn restore_writes_the_table_and_reports_ok() {
        let platform = MemoryPlatform::default();
        platform.state.borrow_mut().data = vec![0xAB; 8 * 1024 * 1024];
        let mut status = StatusReporter::new(Vec::new(), Vec::new());

        let code = run(Path::new("/dev/mem0"), &fast(), &platform, &mut status);

        assert_eq!(code, ExitStatus::Success);
        let (out, err) = status.into_inner();
        assert!(out.is_empty());
        assert_eq!(err, b"OK\n");
        let state = platform.state.borrow();
        assert_eq!(state.prepared, 1);
        assert_eq!(state.reread, 1);
        assert!(!state.locked);
        assert_eq!(&state.data[510..512], &[0x55, 0xAA]);
        assert_eq!(state.data[PARTITION_ENTRY + 4], 0x0C);
    }

    #[test]
    fn each_restore_picks_a_fresh_disk_signature() {
        let signature = || {
            let platform = MemoryPlatform::default();
            platform.state.borrow_mut().data = vec![0; 4 * 1024 * 1024];
            let mut status = StatusReporter::new(Vec::new(), Vec::new());
            assert_eq!(
                run(Path::new("/dev/mem0"), &fast(), &platform, &mut status),
                ExitStatus::Success
            );
            le32(&platform.data()[440..444])
        };
        assert_ne!(signature(), signature());
    }

    #[test]
    fn restore_fails_with_1_when_the_drive_stays_busy() {
        let platform = MemoryPlatform::with_faults(MemoryFaults {
            lock_failures: u32::MAX,
            ..MemoryFaults::default()
        });
        platform.state.borrow_mut().data = vec![0; 8 * 1024 * 1024];
        let mut status = StatusReporter::new(Vec::new(), Vec::new());

        let code = run(Path::new("/dev/mem0"), &fast(), &platform, &mut status);

        assert_eq!(code, ExitStatus::DriveFailure);
        let (_, err) = status.into_inner();
        assert!(String::from_utf8(err).unwrap().starts_with("Couldn't lock the drive"));
        assert!(!platform.state.borrow().locked);
    }
}
