use crate::device::{BlockDevice, Device, Platform};
use anyhow::{Result, anyhow};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::mount::{MntFlags, umount2};
use nix::{ioctl_none, ioctl_read, ioctl_read_bad, request_code_none};
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_none!(blkrrpart, 0x12, 95);
ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), libc::c_int);

/// Bytes zeroed at both ends of the device: covers MBR, GPT and its backup.
const WIPE_LEN: u64 = 1024 * 1024;

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Whether `candidate` (e.g. `/dev/sdb1`, `/dev/mmcblk0p2`) is `device` itself
/// or one of its partitions.
fn is_partition_of(candidate: &OsStr, device: &Path) -> bool {
    let candidate = candidate.to_string_lossy();
    let device = device.to_string_lossy();
    match candidate.strip_prefix(&*device) {
        Some("") => true,
        Some(rest) => {
            let rest = rest.strip_prefix('p').unwrap_or(rest);
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Parent disk of a partition (e.g. `/dev/sda1` -> `/dev/sda`), used to keep
/// the system drive out of the device list.
fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        let trimmed = path_str.trim_end_matches(|c: char| c.is_ascii_digit());
        return PathBuf::from(trimmed);
    }
    if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            if path_str[index + 1..].chars().all(|c| c.is_ascii_digit())
                && index + 1 < path_str.len()
            {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

/// Mount points of `device` and all of its partitions.
pub fn mount_points_of(device: &Path) -> Vec<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| is_partition_of(disk.name(), device))
        .map(|disk| disk.mount_point().to_path_buf())
        .collect()
}

/// Free bytes on the filesystem holding `path`, if it can be determined.
pub fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Scans `/sys/block` for removable devices, excluding loop devices, empty
/// card readers and the disk holding `/`.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| parent_device_path(Path::new(disk.name())))
        .ok_or_else(|| anyhow!("Could not determine system drive."))?;

    let mut devices = Vec::new();
    for entry in fs::read_dir("/sys/block")?.filter_map(io::Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = PathBuf::from("/dev").join(&name);

        if name.starts_with("loop") || path == system_disk {
            continue;
        }
        if read_sys_file(&name, "removable").map_or(true, |s| s != "1") {
            continue;
        }

        let sectors = read_sys_file(&name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if sectors == 0 {
            continue;
        }

        let vendor = read_sys_file(&name, "device/vendor").unwrap_or_default();
        let model = read_sys_file(&name, "device/model").unwrap_or_default();
        let model = format!("{vendor} {model}").trim().to_string();

        let mount_points = disks
            .iter()
            .filter(|disk| is_partition_of(disk.name(), &path))
            .map(|disk| disk.mount_point().to_path_buf())
            .collect();

        devices.push(Device {
            path,
            name,
            model,
            size_bytes: sectors * 512,
            mount_points,
        });
    }

    Ok(devices)
}

fn is_block_device(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
}

fn device_size(file: &File, block_device: bool) -> io::Result<u64> {
    if block_device {
        let mut size: u64 = 0;
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(io::Error::from)?;
        Ok(size)
    } else {
        Ok(file.metadata()?.len())
    }
}

/// Logical sector size: the unit `O_DIRECT` writes must be a multiple of.
fn logical_sector_size(file: &File) -> io::Result<usize> {
    let mut size: libc::c_int = 0;
    unsafe { blksszget(file.as_raw_fd(), &mut size) }.map_err(io::Error::from)?;
    usize::try_from(size)
        .ok()
        .filter(|&s| s >= 512)
        .ok_or_else(|| io::Error::other(format!("bad logical sector size {size}")))
}

fn unmount(mount_point: &Path) -> io::Result<()> {
    match umount2(mount_point, MntFlags::empty()) {
        Err(Errno::EBUSY) => umount2(mount_point, MntFlags::MNT_DETACH).map_err(io::Error::from),
        other => other.map_err(io::Error::from),
    }
}

fn wipe_partition_table(device: &Path) -> io::Result<()> {
    let block_device = is_block_device(device);
    let file = OpenOptions::new().write(true).open(device)?;
    let size = device_size(&file, block_device)?;

    let head = WIPE_LEN.min(size);
    let zeros = vec![0u8; head as usize];
    file.write_all_at(&zeros, 0)?;
    let tail = WIPE_LEN.min(size);
    file.write_all_at(&zeros[..tail as usize], size - tail)?;
    file.sync_all()?;

    if block_device {
        unsafe { blkrrpart(file.as_raw_fd()) }.map_err(io::Error::from)?;
    }
    Ok(())
}

/// Linux implementation of the device capability interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxPlatform;

impl Platform for LinuxPlatform {
    type Device = RawDevice;
    type Reader = File;

    fn prepare(&self, device: &Path) -> io::Result<()> {
        for mount_point in mount_points_of(device) {
            tracing::info!("unmounting {}", mount_point.display());
            if let Err(e) = unmount(&mount_point) {
                tracing::warn!("Couldn't unmount {}: {e}", mount_point.display());
            }
        }
        wipe_partition_table(device)
    }

    fn open(&self, device: &Path) -> io::Result<RawDevice> {
        RawDevice::open(device)
    }

    fn open_reader(&self, device: &Path) -> io::Result<File> {
        File::open(device)
    }

    fn partition_path(&self, device: &Path, index: u32) -> Option<PathBuf> {
        if !is_block_device(device) {
            return None;
        }
        let base = device.to_string_lossy();
        let separator = if base.ends_with(|c: char| c.is_ascii_digit()) { "p" } else { "" };
        Some(PathBuf::from(format!("{base}{separator}{index}")))
    }
}

/// An opened disk (or, for testing, a regular file standing in for one).
///
/// Block devices are written with `O_DIRECT`, so writes bypass the page
/// cache and must be whole logical sectors. The lock is an `flock` held on a
/// duplicate of the handle plus, for block devices, an `O_EXCL` claim that
/// fails while anything has the device mounted. Dropping either releases it.
#[derive(Debug)]
pub struct RawDevice {
    path: PathBuf,
    file: File,
    block_device: bool,
    sector_size: usize,
    exclusive: Option<File>,
    lock: Option<Flock<File>>,
}

impl RawDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        let block_device = is_block_device(path);
        let flags = if block_device { libc::O_DIRECT } else { 0 };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(path)?;
        let sector_size = if block_device { logical_sector_size(&file)? } else { 1 };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            block_device,
            sector_size,
            exclusive: None,
            lock: None,
        })
    }
}

impl BlockDevice for RawDevice {
    fn try_lock(&mut self) -> io::Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        if self.block_device {
            let claim = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_EXCL)
                .open(&self.path)?;
            self.exclusive = Some(claim);
        }
        // The duplicate shares the open file description, so the lock covers
        // writes through `self.file`.
        let handle = self.file.try_clone()?;
        match Flock::lock(handle, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                self.lock = Some(lock);
                Ok(())
            }
            Err((_, errno)) => {
                self.exclusive = None;
                Err(errno.into())
            }
        }
    }

    fn unlock(&mut self) -> io::Result<()> {
        self.exclusive = None;
        match self.lock.take() {
            Some(lock) => lock.unlock().map(drop).map_err(|(_, errno)| errno.into()),
            None => Ok(()),
        }
    }

    fn write_block(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        loop {
            match self.file.write_at(data, offset) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn alignment(&self) -> usize {
        self.sector_size
    }

    fn size(&self) -> io::Result<u64> {
        device_size(&self.file, self.block_device)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn reread_partitions(&mut self) -> io::Result<()> {
        if self.block_device {
            unsafe { blkrrpart(self.file.as_raw_fd()) }.map_err(io::Error::from)?;
        }
        Ok(())
    }
}
