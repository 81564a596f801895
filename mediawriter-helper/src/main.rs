//! The privileged half of mediawriter.
//!
//! Started by the front-end (usually through `pkexec`), it performs exactly
//! one job on one device and talks back over the status protocol: tokens on
//! stdout, the final verdict on stderr, the outcome in the exit code.
use clap::{Parser, Subcommand};
use mediawriter_core::config::{self, MediaWriterConfig};
use mediawriter_core::helper::NO_CHECKSUM;
use mediawriter_core::platform::NativePlatform;
use mediawriter_core::status::{ExitStatus, StatusReporter};
use mediawriter_core::write::{WriteOptions, WriteTask};
use mediawriter_core::{logging, restore, write};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

const USAGE_ERROR: &str = "Helper: Wrong arguments entered";

#[derive(Parser)]
#[command(name = "mediawriter-helper", version)]
struct Args {
    #[command(subcommand)]
    job: Job,
}

#[derive(Subcommand)]
enum Job {
    /// Write an image to a device
    Write {
        image: PathBuf,
        device: PathBuf,
        /// Expected checksum of the image, or "-"
        checksum: String,
    },
    /// Restore a device to one empty FAT32 partition
    Restore { device: PathBuf },
}

fn expected_checksum(arg: String) -> Option<String> {
    match arg.trim() {
        "" | NO_CHECKSUM => None,
        _ => Some(arg),
    }
}

fn main() -> ExitCode {
    // stderr carries the verdict, so logs only ever go to the file. Without
    // one the helper runs silent.
    logging::init_logging("mediawriter-helper").ok();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            tracing::error!("rejected arguments: {e}");
            if let Err(w) = writeln!(std::io::stderr(), "{USAGE_ERROR}") {
                tracing::error!("error channel unavailable: {w}");
            }
            return ExitCode::from(ExitStatus::DriveFailure);
        }
    };

    let cfg = config::load_for_helper().unwrap_or_else(|e| {
        tracing::warn!("using default config: {e}");
        MediaWriterConfig::default()
    });
    let opts = WriteOptions::from(&cfg.writer);
    let platform = NativePlatform {};
    let mut status = StatusReporter::stdio();

    let exit = match args.job {
        Job::Write {
            image,
            device,
            checksum,
        } => {
            let task = WriteTask {
                image,
                device,
                expected_checksum: expected_checksum(checksum),
            };
            write::run(&task, &opts, &platform, &mut status)
        }
        Job::Restore { device } => restore::run(&device, &opts, &platform, &mut status),
    };
    tracing::info!(code = exit.code(), "helper exiting");
    ExitCode::from(exit)
}
