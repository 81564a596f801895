//! Parent side of the helper protocol: spawn, stream events, classify.
use crate::config::WriterConfig;
use crate::status::{HelperOutcome, StatusEvent, StatusParser};
use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use thiserror::Error;

pub const HELPER_NAME: &str = "mediawriter-helper";
/// Install location used by the distribution packages.
const LIBEXEC_HELPER: &str = "/usr/libexec/mediawriter/mediawriter-helper";
/// Placeholder for "no expected checksum" on the helper command line.
pub const NO_CHECKSUM: &str = "-";

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("Couldn't find the helper program ({0})")]
    NotFound(String),

    #[error("Couldn't start the helper ({0})")]
    Spawn(io::Error),

    #[error("Lost contact with the helper ({0})")]
    Io(io::Error),
}

/// How to start the helper: its path and an optional elevation program such
/// as `pkexec`.
#[derive(Debug, Clone)]
pub struct HelperCommand {
    program: PathBuf,
    elevate_with: Option<String>,
}

impl HelperCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            elevate_with: None,
        }
    }

    /// Resolves the helper from the config, next to the running executable,
    /// or at the packaged location, in that order.
    pub fn locate(cfg: &WriterConfig) -> Result<Self, HelperError> {
        let program = match &cfg.helper_path {
            Some(path) => path.clone(),
            None => {
                let sibling = std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(|dir| dir.join(HELPER_NAME)))
                    .filter(|p| p.is_file());
                match sibling {
                    Some(path) => path,
                    None if Path::new(LIBEXEC_HELPER).is_file() => PathBuf::from(LIBEXEC_HELPER),
                    None => return Err(HelperError::NotFound(HELPER_NAME.to_string())),
                }
            }
        };
        if !program.is_file() {
            return Err(HelperError::NotFound(program.display().to_string()));
        }
        Ok(Self::new(program).elevate_with(cfg.elevate_with.clone()))
    }

    pub fn elevate_with(mut self, program: Option<String>) -> Self {
        self.elevate_with = program.filter(|p| !p.is_empty());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn write_args(image: &Path, device: &Path, checksum: Option<&str>) -> Vec<OsString> {
        vec![
            OsString::from("write"),
            image.as_os_str().to_owned(),
            device.as_os_str().to_owned(),
            OsString::from(checksum.unwrap_or(NO_CHECKSUM)),
        ]
    }

    pub fn restore_args(device: &Path) -> Vec<OsString> {
        vec![OsString::from("restore"), device.as_os_str().to_owned()]
    }

    fn command<S: AsRef<OsStr>>(&self, args: &[S]) -> Command {
        let mut command = match &self.elevate_with {
            Some(elevate) => {
                let mut c = Command::new(elevate);
                c.arg(&self.program);
                c
            }
            None => Command::new(&self.program),
        };
        command.args(args);
        command
    }

    /// Runs the helper to completion, passing each stdout line to `on_event`
    /// as it arrives.
    pub fn run<S: AsRef<OsStr>>(
        &self,
        args: &[S],
        mut on_event: impl FnMut(StatusEvent),
    ) -> Result<HelperOutcome, HelperError> {
        let mut command = self.command(args);
        tracing::info!(?command, "starting helper");
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(HelperError::Spawn)?;

        let stderr = child.stderr.take();
        let error_channel = thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                if let Err(e) = stderr.read_to_string(&mut text) {
                    tracing::warn!("reading helper stderr failed: {e}");
                }
            }
            text
        });

        let mut parser = StatusParser::default();
        let mut read_error = None;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        read_error = Some(e);
                        break;
                    }
                };
                let event = parser.feed(&line);
                if let StatusEvent::Other(text) = &event {
                    tracing::debug!("helper said: {text}");
                }
                on_event(event);
            }
        }

        // The helper may still hold the device; it is always reaped.
        let status = child.wait().map_err(HelperError::Io)?;
        let errors = error_channel.join().unwrap_or_default();
        tracing::info!(?status, errors = errors.trim(), "helper finished");
        if let Some(e) = read_error {
            tracing::error!("helper status stream was unreadable: {e}");
            return Err(HelperError::Io(e));
        }
        Ok(HelperOutcome::classify(status.code(), &errors))
    }
}
