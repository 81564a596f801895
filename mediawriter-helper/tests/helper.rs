//! Runs the helper binary against regular files standing in for drives.

use mediawriter_core::download::staging_path;
use mediawriter_core::verify;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use xz2::write::XzEncoder;

const SECTOR: usize = 2048;

/// ISO 9660 skeleton with a primary volume descriptor and some payload.
fn iso_image(data_sectors: usize) -> Vec<u8> {
    let sectors = 18 + data_sectors;
    let mut image = vec![0u8; sectors * SECTOR];

    let pvd = 16 * SECTOR;
    image[pvd] = 1;
    image[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
    image[pvd + 6] = 1;
    image[pvd + 80..pvd + 84].copy_from_slice(&(sectors as u32).to_le_bytes());
    image[pvd + 84..pvd + 88].copy_from_slice(&(sectors as u32).to_be_bytes());

    let term = 17 * SECTOR;
    image[term] = 255;
    image[term + 1..term + 6].copy_from_slice(b"CD001");

    for (i, byte) in image[18 * SECTOR..].iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    image
}

struct Sandbox {
    dir: TempDir,
    config: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        fs::write(
            &config,
            "[writer]\n\
             block_size = 65536\n\
             lock_attempts = 2\n\
             lock_retry_delay_ms = 0\n\
             retry_delay_ms = 0\n\
             download_poll_interval_ms = 10\n",
        )
        .unwrap();
        Self { dir, config }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// An empty file playing the drive.
    fn drive(&self) -> PathBuf {
        let path = self.path("drive.img");
        fs::write(&path, b"").unwrap();
        path
    }

    fn helper(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_mediawriter-helper"));
        command
            .env("MEDIAWRITER_CONFIG", &self.config)
            .env("XDG_STATE_HOME", self.dir.path().join("state"))
            .stdin(Stdio::null());
        command
    }

    fn write(&self, image: &Path, drive: &Path) -> Output {
        self.helper()
            .arg("write")
            .arg(image)
            .arg(drive)
            .arg("-")
            .output()
            .unwrap()
    }
}

fn lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn plain_image_is_written_and_checked() {
    let sandbox = Sandbox::new();
    let image = sandbox.path("live.iso");
    fs::write(&image, iso_image(200)).unwrap();
    verify::implant(&image).unwrap();
    let drive = sandbox.drive();

    let output = sandbox.write(&image, &drive);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(lines(&output.stderr), ["OK"]);
    let out = lines(&output.stdout);
    assert_eq!(out.first().map(String::as_str), Some("WRITE"));
    assert_eq!(out.last().map(String::as_str), Some("DONE"));
    assert!(out.iter().any(|l| l == "CHECK"));
    assert_eq!(fs::read(&drive).unwrap(), fs::read(&image).unwrap());
}

#[test]
fn compressed_image_lands_decompressed() {
    let sandbox = Sandbox::new();
    let plain = iso_image(64);
    let image = sandbox.path("live.iso.xz");
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(&plain).unwrap();
    fs::write(&image, encoder.finish().unwrap()).unwrap();
    let drive = sandbox.drive();

    let output = sandbox.write(&image, &drive);

    assert_eq!(output.status.code(), Some(0));
    assert!(!lines(&output.stdout).iter().any(|l| l == "CHECK"));
    assert_eq!(fs::read(&drive).unwrap(), plain);
}

#[test]
fn truncated_xz_is_an_image_failure() {
    let sandbox = Sandbox::new();
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(&iso_image(64)).unwrap();
    let compressed = encoder.finish().unwrap();
    let image = sandbox.path("live.iso.xz");
    fs::write(&image, &compressed[..compressed.len() / 2]).unwrap();
    let drive = sandbox.drive();

    let output = sandbox.write(&image, &drive);

    assert_eq!(output.status.code(), Some(4));
    let err = lines(&output.stderr);
    assert_eq!(err.len(), 1);
    assert!(!err[0].is_empty() && err[0] != "OK");
}

#[test]
fn missing_image_fails_without_touching_the_drive() {
    let sandbox = Sandbox::new();
    let drive = sandbox.path("drive.img");
    fs::write(&drive, b"keep me").unwrap();

    let output = sandbox.write(&sandbox.path("absent.iso"), &drive);

    assert_eq!(output.status.code(), Some(4));
    assert_eq!(fs::read(&drive).unwrap(), b"keep me");
}

#[test]
fn abandoned_download_is_an_image_failure() {
    let sandbox = Sandbox::new();
    let image = sandbox.path("live.iso");
    let staging = staging_path(&image);
    fs::write(&staging, b"partial").unwrap();
    let drive = sandbox.drive();

    let child = sandbox
        .helper()
        .arg("write")
        .arg(&image)
        .arg(&drive)
        .arg("-")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    fs::remove_file(&staging).unwrap();
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(4));
    assert_eq!(
        lines(&output.stderr),
        ["The image download did not finish."]
    );
    assert!(output.stdout.is_empty());
}

#[test]
fn restore_partitions_a_file_backed_drive() {
    let sandbox = Sandbox::new();
    let drive = sandbox.path("drive.img");
    fs::write(&drive, vec![0xA5u8; 4 * 1024 * 1024]).unwrap();

    let output = sandbox
        .helper()
        .arg("restore")
        .arg(&drive)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(lines(&output.stderr), ["OK"]);
    let data = fs::read(&drive).unwrap();
    assert_eq!(&data[510..512], &[0x55, 0xAA]);
    assert_eq!(data[446 + 4], 0x0C);
}

#[test]
fn wrong_arguments_exit_with_1() {
    let sandbox = Sandbox::new();
    let cases: [&[&str]; 3] = [&["write", "only-image"], &["format", "/dev/sdz"], &[]];
    for args in cases {
        let output = sandbox.helper().args(args).output().unwrap();
        assert_eq!(output.status.code(), Some(1));
        assert_eq!(lines(&output.stderr), ["Helper: Wrong arguments entered"]);
    }
}

#[test]
fn rejected_arguments_are_logged() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .helper()
        .env_remove("RUST_LOG")
        .args(["write", "only-image"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let log = sandbox
        .path("state")
        .join("mediawriter")
        .join("mediawriter-helper.log");
    let text = fs::read_to_string(log).unwrap();
    assert!(text.contains("rejected arguments"), "{text}");
}
