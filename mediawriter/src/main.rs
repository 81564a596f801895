use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use mediawriter_core::checksum::ExpectedChecksum;
use mediawriter_core::config::{self, MediaWriterConfig};
use mediawriter_core::device::Device;
use mediawriter_core::download::{
    DownloadEvent, DownloadOptions, DownloadOutcome, DownloadTask, Downloader, staging_path,
};
use mediawriter_core::helper::HelperCommand;
use mediawriter_core::status::{HelperOutcome, StatusEvent};
use mediawriter_core::{logging, platform};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::thread;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "mediawriter")]
#[command(about = "Download OS images and write them to removable drives", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an image, resuming an earlier partial download
    Download {
        /// URL of the image
        url: String,
        /// Where to store the image
        dest: PathBuf,
        /// Expected MD5 or SHA-256 of the image (hex)
        #[arg(long)]
        checksum: Option<String>,
    },
    /// Write an image to a removable drive
    Write {
        /// Image file to write (.iso, .img or .xz)
        #[arg(required = true)]
        image: PathBuf,
        /// Target device; asks interactively when absent
        #[arg(short, long)]
        device: Option<PathBuf>,
        /// Expected checksum of the image (hex)
        #[arg(long)]
        checksum: Option<String>,
        /// Download the image from this URL while the drive is prepared
        #[arg(long)]
        url: Option<String>,
        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Restore a drive to a single empty FAT32 partition
    Restore {
        /// Target device; asks interactively when absent
        #[arg(short, long)]
        device: Option<PathBuf>,
        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// List available removable devices
    List,
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Resolves `--device`, or asks. A given path need not be a listed device:
/// image files work as targets too.
fn resolve_device(device: Option<PathBuf>, prompt: &str) -> Result<(PathBuf, String)> {
    match device {
        Some(path) => {
            let label = path.display().to_string();
            Ok((path, label))
        }
        None => {
            let devices = platform::get_removable_devices()?;
            let device = select_device(&devices, prompt)?;
            let label = format!("{} ({:.1} GB)", device.model, device.size_gb());
            Ok((device.path, label))
        }
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn helper_command(cfg: &MediaWriterConfig) -> Result<HelperCommand> {
    let helper = HelperCommand::locate(&cfg.writer)?;
    #[cfg(unix)]
    if nix::unistd::Uid::effective().is_root() {
        return Ok(helper.elevate_with(None));
    }
    Ok(helper)
}

async fn download(
    task: DownloadTask,
    opts: DownloadOptions,
    cancel: CancellationToken,
    pb: ProgressBar,
) -> Result<DownloadOutcome> {
    pb.set_prefix("Downloading");
    pb.set_style(bar_style("cyan")?);
    let verify_style = bar_style("magenta")?;

    let downloader = Downloader::new(task, opts, cancel, |event| match event {
        DownloadEvent::ProgressMax(total) => pb.set_length(total),
        DownloadEvent::Progress(bytes) => pb.set_position(bytes),
        DownloadEvent::Interrupted { reason, attempt } => {
            pb.println(format!(
                "{} connection lost ({reason}), resuming (attempt {attempt})",
                style("!").yellow()
            ));
        }
        DownloadEvent::VerifyStarted { total } => {
            pb.set_prefix("Verifying");
            pb.set_style(verify_style.clone());
            pb.set_length(total);
            pb.set_position(0);
        }
        DownloadEvent::StateChanged(state) => tracing::debug!(?state, "download state"),
    })?;
    Ok(downloader.run().await)
}

fn finish_download(outcome: DownloadOutcome, pb: &ProgressBar, staging: &Path) -> Result<()> {
    match outcome {
        DownloadOutcome::Success(path) => {
            pb.finish_with_message("Download complete.");
            println!("\n✨ Downloaded {}.", style(path.display()).cyan());
            Ok(())
        }
        DownloadOutcome::Cancelled => {
            pb.abandon();
            println!(
                "\nDownload paused. Partial data kept in {}; run the same command to resume.",
                style(staging.display()).cyan()
            );
            Ok(())
        }
        failure => {
            pb.abandon_with_message("❌ Download failed.");
            Err(anyhow!("{failure}"))
        }
    }
}

fn render_helper_event(event: StatusEvent, image: &Path, pb: &ProgressBar) {
    match event {
        StatusEvent::WriteStarted => {
            pb.set_prefix("Writing");
            if let Ok(meta) = image.metadata() {
                pb.set_length(meta.len());
            }
            pb.set_position(0);
        }
        StatusEvent::Progress { bytes, .. } => pb.set_position(bytes),
        StatusEvent::AttemptFailed => {
            pb.println(format!("{} write failed, retrying", style("!").yellow()));
            pb.set_position(0);
        }
        StatusEvent::CheckStarted => {
            pb.set_prefix("Checking");
            pb.set_position(0);
        }
        StatusEvent::Done => pb.finish_with_message("Done."),
        StatusEvent::Other(line) => tracing::debug!("helper: {line}"),
    }
}

fn report(outcome: HelperOutcome, pb: &ProgressBar) -> Result<()> {
    match outcome {
        HelperOutcome::Success => Ok(()),
        HelperOutcome::DriveFailure(message) => {
            pb.abandon_with_message("❌ Operation failed.");
            bail!("the drive could not be written: {message}")
        }
        HelperOutcome::ImageFailure(message) => {
            pb.abandon_with_message("❌ Operation failed.");
            bail!("the image could not be written: {message}")
        }
    }
}

fn main() -> Result<()> {
    if logging::init_logging("mediawriter").is_err() {
        logging::init_logging_stderr();
    }

    let cli = Cli::parse();
    let cfg = config::load_or_init().unwrap_or_else(|e| {
        tracing::warn!("using default config: {e}");
        MediaWriterConfig::default()
    });

    // Ctrl+C cancels downloads cooperatively. The helper shares our process
    // group and receives the signal itself.
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    ctrlc::set_handler(move || c.cancel())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Download {
            url,
            dest,
            checksum,
        } => {
            let expected = checksum
                .map(|c| c.parse::<ExpectedChecksum>())
                .transpose()?;
            let task = DownloadTask {
                url,
                destination: dest.clone(),
                expected_checksum: expected,
            };
            let pb = ProgressBar::new(0);
            let outcome = runtime.block_on(download(
                task,
                DownloadOptions::from(&cfg.download),
                cancel,
                pb.clone(),
            ))?;
            finish_download(outcome, &pb, &staging_path(&dest))?;
        }
        Commands::Write {
            image,
            device,
            checksum,
            url,
            yes,
        } => {
            let expected = checksum
                .as_deref()
                .map(str::parse::<ExpectedChecksum>)
                .transpose()?;
            let (device, label) = resolve_device(device, "Select the target device to WRITE to")?;
            let helper = helper_command(&cfg)?;

            println!(
                "{} This will erase all data on '{}'.",
                style("WARNING:").red().bold(),
                label
            );
            println!("  Device: {}", style(device.display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!();

            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Write operation cancelled.");
                return Ok(());
            }
            println!();

            let multi = MultiProgress::new();
            let download_pb = multi.add(ProgressBar::new(0));
            let write_pb = multi.add(ProgressBar::new(0));
            write_pb.set_style(bar_style("green")?);
            write_pb.set_prefix("Waiting");

            // With a URL, the helper starts right away and waits on the
            // staging file until the download is promoted.
            let pending = match url {
                Some(url) if !image.exists() => {
                    let staging = staging_path(&image);
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&staging)
                        .with_context(|| format!("creating {}", staging.display()))?;
                    Some(DownloadTask {
                        url,
                        destination: image.clone(),
                        expected_checksum: expected.clone(),
                    })
                }
                _ => {
                    download_pb.finish_and_clear();
                    None
                }
            };

            let args = HelperCommand::write_args(
                &image,
                &device,
                expected.as_ref().map(ExpectedChecksum::as_hex),
            );
            let writer = {
                let pb = write_pb.clone();
                let image = image.clone();
                thread::spawn(move || {
                    helper.run(&args, |event| render_helper_event(event, &image, &pb))
                })
            };

            if let Some(task) = pending {
                let outcome = runtime.block_on(download(
                    task,
                    DownloadOptions::from(&cfg.download),
                    cancel,
                    download_pb.clone(),
                ))?;
                if let Err(e) = finish_download(outcome, &download_pb, &staging_path(&image)) {
                    // The helper sees the staging file vanish and gives up on its own.
                    tracing::error!("download for write failed: {e}");
                }
            }

            let outcome = writer
                .join()
                .map_err(|_| anyhow!("helper thread panicked"))??;
            report(outcome, &write_pb)?;
            println!(
                "\n✨ Successfully wrote {} to {}.",
                style(image.display()).cyan(),
                style(device.display()).cyan()
            );
        }
        Commands::Restore { device, yes } => {
            let (device, label) =
                resolve_device(device, "Select the device to RESTORE")?;
            let helper = helper_command(&cfg)?;

            println!(
                "{} This will erase all data on '{}' and leave one empty FAT32 partition.",
                style("WARNING:").red().bold(),
                label
            );
            println!("  Device: {}", style(device.display()).cyan());
            println!();

            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Restore operation cancelled.");
                return Ok(());
            }

            let pb = ProgressBar::new_spinner();
            pb.set_message("Restoring...");
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            let outcome = helper.run(&HelperCommand::restore_args(&device), |event| {
                tracing::debug!(?event, "restore event")
            })?;
            report(outcome, &pb)?;
            pb.finish_with_message("Restore complete.");
            println!(
                "\n✨ {} is ready to use again.",
                style(device.display()).cyan()
            );
        }
        Commands::List => {
            let devices = platform::get_removable_devices()?;
            if devices.is_empty() {
                println!("No removable devices found.");
                return Ok(());
            }

            println!("Found {} removable devices:", devices.len());
            println!(
                "\n  {:<15} {:<24} {:>9} {}",
                "DEVICE", "MODEL", "SIZE", "LOCATION"
            );
            println!("  {:-<15} {:-<24} {:-<9} {:-<20}", "", "", "", "");
            for device in devices {
                println!("  {device}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_write_with_url() {
        let cli = Cli::try_parse_from([
            "mediawriter",
            "write",
            "img.iso",
            "--device",
            "/dev/sdz",
            "--url",
            "https://example.org/img.iso",
            "-y",
        ])
        .unwrap();
        match cli.command {
            Commands::Write {
                image,
                device,
                url,
                yes,
                checksum,
            } => {
                assert_eq!(image, PathBuf::from("img.iso"));
                assert_eq!(device, Some(PathBuf::from("/dev/sdz")));
                assert_eq!(url.as_deref(), Some("https://example.org/img.iso"));
                assert!(yes);
                assert!(checksum.is_none());
            }
            _ => panic!("expected write"),
        }
    }

    #[test]
    fn download_requires_url_and_destination() {
        assert!(Cli::try_parse_from(["mediawriter", "download", "https://x"]).is_err());
        assert!(Cli::try_parse_from(["mediawriter", "download", "https://x", "out.iso"]).is_ok());
    }

    #[test]
    fn bar_styles_are_valid_templates() {
        assert!(bar_style("green").is_ok());
    }
}
