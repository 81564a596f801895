//! The line protocol between the helper and its parent.
//!
//! The helper prints phase tokens and cumulative byte counts on stdout and a
//! single verdict (`OK` or a failure sentence) on stderr, then exits with
//! one of the codes in [`ExitStatus`]. The parent side parses stdout with
//! [`StatusParser`] and classifies the exit with [`HelperOutcome`].
use std::fmt;
use std::io::{self, Write};

pub const WRITE: &str = "WRITE";
pub const CHECK: &str = "CHECK";
pub const DONE: &str = "DONE";
pub const OK: &str = "OK";
/// Progress value that marks a failed first attempt before the retry sleep.
pub const ATTEMPT_FAILED: &str = "0";

/// Process exit codes of the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// Drive, lock or verification failure.
    DriveFailure,
    /// Corrupted source or fatal decompression error.
    ImageFailure,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::DriveFailure => 1,
            ExitStatus::ImageFailure => 4,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

/// Emits protocol lines; every line is flushed immediately so the parent can
/// render progress while the device is still being written.
pub struct StatusReporter<O: Write, E: Write> {
    out: O,
    err: E,
}

impl StatusReporter<io::Stdout, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }
}

impl<O: Write, E: Write> StatusReporter<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self { out, err }
    }

    fn line(&mut self, token: &dyn fmt::Display) {
        // A parent that went away is not a reason to abort a device write.
        if writeln!(self.out, "{token}").and_then(|_| self.out.flush()).is_err() {
            tracing::warn!("status channel closed, dropping '{token}'");
        }
    }

    pub fn write_started(&mut self) {
        self.line(&WRITE);
    }

    pub fn progress(&mut self, bytes: u64) {
        self.line(&bytes);
    }

    pub fn attempt_failed(&mut self) {
        self.line(&ATTEMPT_FAILED);
    }

    pub fn check_started(&mut self) {
        self.line(&CHECK);
    }

    pub fn done(&mut self) {
        self.line(&DONE);
    }

    pub fn ok(&mut self) {
        self.verdict(&OK);
    }

    pub fn failure(&mut self, message: &dyn fmt::Display) {
        self.verdict(message);
    }

    fn verdict(&mut self, message: &dyn fmt::Display) {
        if writeln!(self.err, "{message}")
            .and_then(|_| self.err.flush())
            .is_err()
        {
            tracing::warn!("error channel closed, dropping '{message}'");
        }
    }

    pub fn into_inner(self) -> (O, E) {
        (self.out, self.err)
    }
}

/// Phase the helper is in, as far as the parent can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Writing,
    Checking,
    Done,
}

/// One parsed stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    WriteStarted,
    Progress { phase: Phase, bytes: u64 },
    AttemptFailed,
    CheckStarted,
    Done,
    /// Any line the protocol does not define; kept for logging.
    Other(String),
}

/// Stateful stdout parser; numeric lines are attributed to the current phase.
#[derive(Debug)]
pub struct StatusParser {
    phase: Phase,
}

impl Default for StatusParser {
    fn default() -> Self {
        Self {
            phase: Phase::Starting,
        }
    }
}

impl StatusParser {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn feed(&mut self, line: &str) -> StatusEvent {
        let line = line.trim();
        match line {
            WRITE => {
                self.phase = Phase::Writing;
                StatusEvent::WriteStarted
            }
            CHECK => {
                self.phase = Phase::Checking;
                StatusEvent::CheckStarted
            }
            DONE => {
                self.phase = Phase::Done;
                StatusEvent::Done
            }
            ATTEMPT_FAILED if self.phase == Phase::Writing => StatusEvent::AttemptFailed,
            _ => match line.parse::<u64>() {
                Ok(bytes) => StatusEvent::Progress {
                    phase: self.phase,
                    bytes,
                },
                Err(_) => StatusEvent::Other(line.to_string()),
            },
        }
    }
}

/// What the parent makes of a finished helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperOutcome {
    Success,
    /// Bad device: lock, write or verification failure.
    DriveFailure(String),
    /// Bad image: corrupt source or decompression failure.
    ImageFailure(String),
}

impl HelperOutcome {
    /// `code` is `None` when the helper was killed by a signal.
    pub fn classify(code: Option<i32>, error_channel: &str) -> Self {
        let message = error_channel
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or("")
            .to_string();
        match code {
            Some(0) => HelperOutcome::Success,
            Some(4) => HelperOutcome::ImageFailure(message),
            Some(1) => HelperOutcome::DriveFailure(message),
            Some(other) => HelperOutcome::DriveFailure(if message.is_empty() {
                format!("Helper exited with unexpected status {other}")
            } else {
                message
            }),
            None => HelperOutcome::DriveFailure(if message.is_empty() {
                "Helper was terminated".to_string()
            } else {
                message
            }),
        }
    }
}
