//! The core, UI-agnostic library for the `mediawriter` utility.
//!
//! `mediawriter-core` turns a published OS image into a bootable removable
//! drive. It is used by two programs: the interactive front-end, which
//! downloads images and drives the process, and the privileged helper, which
//! is the only part that touches raw block devices.
//!
//! The library is structured into several key modules:
//! - [`download`]: resumable, checksum-verified HTTP download into a `.part`
//!   staging file, promoted by rename once verified.
//! - [`mod@write`]: the helper's write job. Prepares and locks a device,
//!   streams a plain or xz-compressed image onto it block by block, retries
//!   once, then checks the result.
//! - [`restore`]: the helper's restore job (fresh MBR and FAT32 partition).
//! - [`decompress`]: the pull-based xz decoder used by the write job.
//! - [`verify`]: the embedded ISO checksum (`isomd5sum`) scan and implant.
//! - [`status`]: the line protocol between the helper and its parent, both
//!   the emitting and the parsing side, and the helper's exit codes.
//! - [`helper`]: spawning the helper and following its progress.
//! - [`device`] and [`platform`]: the device capability traits and their
//!   Linux implementation, plus removable device discovery.
//! - [`checksum`], [`config`], [`logging`]: shared plumbing.
//!
//! ## Example: downloading an image
//!
//! ```rust,no_run
//! use mediawriter_core::download::{DownloadEvent, DownloadOptions, DownloadTask, Downloader};
//! use std::path::PathBuf;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let task = DownloadTask {
//!     url: "https://example.org/live.iso".to_string(),
//!     destination: PathBuf::from("live.iso"),
//!     expected_checksum: Some("0123456789abcdef0123456789abcdef".parse()?),
//! };
//! let cancel = CancellationToken::new();
//! let outcome = Downloader::new(task, DownloadOptions::default(), cancel, |event| {
//!     if let DownloadEvent::Progress(bytes) = event {
//!         println!("{bytes} bytes");
//!     }
//! })?
//! .run()
//! .await;
//! println!("{outcome}");
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod config;
pub mod decompress;
pub mod device;
pub mod download;
pub mod helper;
pub mod logging;
pub mod platform;
pub mod restore;
pub mod status;
pub mod verify;
pub mod write;
