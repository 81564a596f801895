//! Resumable, integrity-checked HTTP download into a staging file.
//!
//! Bytes land in `<destination>.part`, opened in append mode. Every (re)issued
//! request asks for `Range: bytes=<staging size>-`, so a transfer interrupted
//! by the network, or by a cancelled earlier run, continues where it stopped.
//! Once the body is complete the whole staging file is hashed from the start
//! and, if it matches, renamed onto the destination.
//!
//! Cancelled and successful transfers keep their bytes (as a resume point or
//! as the promoted file); every other terminal outcome deletes the staging
//! file.
use crate::checksum::ExpectedChecksum;
use crate::platform;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode, redirect};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub const STAGING_SUFFIX: &str = ".part";

/// Path of the staging file for `destination`.
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

pub fn default_user_agent() -> String {
    format!(
        "mediawriter/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub destination: PathBuf,
    pub expected_checksum: Option<ExpectedChecksum>,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Pause before a request is reissued after an interruption.
    pub resume_delay: Duration,
    /// Bound on connecting, on the response head and on each body chunk.
    pub timeout: Duration,
    pub verify_chunk_size: usize,
    /// Free space under which a failed write is reported as out of space.
    pub low_space_threshold: u64,
    /// `None` resumes for as long as it takes.
    pub max_resume_attempts: Option<u32>,
    pub user_agent: String,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            resume_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            verify_chunk_size: 64 * 1024,
            low_space_threshold: 5 * 1024 * 1024,
            max_resume_attempts: None,
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Requesting,
    Receiving,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    StateChanged(TransferState),
    /// Expected size of the finished file.
    ProgressMax(u64),
    /// Bytes in the staging file, or bytes hashed while verifying.
    Progress(u64),
    /// The transfer broke off and will be resumed.
    Interrupted { reason: String, attempt: u32 },
    VerifyStarted { total: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskErrorKind {
    OutOfSpace,
    NotWritable,
    RenameFailed,
}

impl fmt::Display for DiskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiskErrorKind::OutOfSpace => "You ran out of space in your Downloads folder.",
            DiskErrorKind::NotWritable => "The downloaded file is not writable.",
            DiskErrorKind::RenameFailed => "Unable to rename the temporary file.",
        })
    }
}

/// Terminal result of one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Success(PathBuf),
    DiskError(DiskErrorKind),
    ChecksumMismatch { expected: String, computed: String },
    /// The checksum could not be computed: the finished file was unreadable.
    CheckFailed(String),
    /// The server refused the request for good.
    Rejected(StatusCode),
    /// More interruptions than `max_resume_attempts` allows.
    NetworkFailed { attempts: u32, reason: String },
    Cancelled,
}

impl DownloadOutcome {
    fn final_state(&self) -> TransferState {
        match self {
            DownloadOutcome::Success(_) => TransferState::Completed,
            DownloadOutcome::Cancelled => TransferState::Cancelled,
            _ => TransferState::Failed,
        }
    }

    /// Whether the staging file survives this outcome.
    pub fn keeps_staging(&self) -> bool {
        matches!(self, DownloadOutcome::Success(_) | DownloadOutcome::Cancelled)
    }
}

impl fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadOutcome::Success(path) => write!(f, "Downloaded {}", path.display()),
            DownloadOutcome::DiskError(kind) => kind.fmt(f),
            DownloadOutcome::ChecksumMismatch { .. } => {
                f.write_str("The downloaded image is corrupted.")
            }
            DownloadOutcome::CheckFailed(reason) => {
                write!(f, "Failed to read from file while verifying ({reason}).")
            }
            DownloadOutcome::Rejected(status) => write!(f, "The server refused the download ({status})."),
            DownloadOutcome::NetworkFailed { attempts, reason } => {
                write!(f, "The download failed after {attempts} attempts ({reason}).")
            }
            DownloadOutcome::Cancelled => f.write_str("The download was cancelled."),
        }
    }
}

/// Write failures are blamed on free space only when little is left.
pub fn classify_write_failure(available: Option<u64>, threshold: u64) -> DiskErrorKind {
    match available {
        Some(free) if free < threshold => DiskErrorKind::OutOfSpace,
        _ => DiskErrorKind::NotWritable,
    }
}

/// First byte of a `Content-Range: bytes START-END/TOTAL` answer.
fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

fn content_range_start(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_start(value)
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

enum Step {
    Request,
    Receive(Response),
    Resume(String),
    Verify,
    Promote,
    Finish(DownloadOutcome),
}

/// Runs one [`DownloadTask`]. Events are delivered to `on_event` in order.
pub struct Downloader<F: FnMut(DownloadEvent)> {
    task: DownloadTask,
    opts: DownloadOptions,
    client: Client,
    cancel: CancellationToken,
    on_event: F,
    state: TransferState,
    staging: PathBuf,
    file: Option<File>,
    offset: u64,
    resumes: u32,
}

impl<F: FnMut(DownloadEvent)> Downloader<F> {
    pub fn new(
        task: DownloadTask,
        opts: DownloadOptions,
        cancel: CancellationToken,
        on_event: F,
    ) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(opts.user_agent.clone())
            .connect_timeout(opts.timeout)
            .redirect(redirect::Policy::limited(10))
            .build()?;
        let staging = staging_path(&task.destination);
        Ok(Self {
            task,
            opts,
            client,
            cancel,
            on_event,
            state: TransferState::Idle,
            staging,
            file: None,
            offset: 0,
            resumes: 0,
        })
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Drives the transfer to a terminal outcome.
    pub async fn run(mut self) -> DownloadOutcome {
        tracing::info!(url = %self.task.url, dest = %self.task.destination.display(), "download started");
        let mut step = Step::Request;
        loop {
            step = match step {
                Step::Request => self.request().await,
                Step::Receive(response) => self.receive(response).await,
                Step::Resume(reason) => self.resume(reason).await,
                Step::Verify => self.verify().await,
                Step::Promote => self.promote().await,
                Step::Finish(outcome) => return self.finish(outcome).await,
            };
        }
    }

    fn emit(&mut self, event: DownloadEvent) {
        (self.on_event)(event);
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "transfer state");
            self.state = state;
            self.emit(DownloadEvent::StateChanged(state));
        }
    }

    fn disk_error(&self, err: &io::Error) -> Step {
        let dir = self
            .staging
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let kind = classify_write_failure(platform::available_space(dir), self.opts.low_space_threshold);
        tracing::error!("writing {} failed: {err}", self.staging.display());
        Step::Finish(DownloadOutcome::DiskError(kind))
    }

    async fn open_staging(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.staging)
                .await?;
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            // Writes still in flight would be missing from the length.
            file.flush().await?;
            self.offset = file.metadata().await?.len();
        }
        Ok(())
    }

    async fn request(&mut self) -> Step {
        self.set_state(TransferState::Requesting);
        if let Err(e) = self.open_staging().await {
            return self.disk_error(&e);
        }

        let range = format!("bytes={}-", self.offset);
        tracing::debug!(%range, "requesting");
        let send = self.client.get(&self.task.url).header(RANGE, range).send();

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Step::Finish(DownloadOutcome::Cancelled),
            r = tokio::time::timeout(self.opts.timeout, send) => r,
        };

        match response {
            Err(_) => Step::Resume("no response from the server".into()),
            Ok(Err(e)) => Step::Resume(e.to_string()),
            Ok(Ok(response)) => self.accept(response).await,
        }
    }

    async fn accept(&mut self, response: Response) -> Step {
        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => match content_range_start(&response) {
                Some(start) if start != self.offset => {
                    tracing::warn!(start, offset = self.offset, "server sent the wrong range, starting over");
                    if let Some(file) = &self.file {
                        if let Err(e) = file.set_len(0).await {
                            return self.disk_error(&e);
                        }
                    }
                    self.offset = 0;
                    Step::Resume(format!("server sent bytes from {start}"))
                }
                _ => Step::Receive(response),
            },
            StatusCode::OK => {
                if self.offset > 0 {
                    tracing::warn!(offset = self.offset, "server ignored the range, starting over");
                    if let Some(file) = &self.file {
                        if let Err(e) = file.set_len(0).await {
                            return self.disk_error(&e);
                        }
                    }
                    self.offset = 0;
                }
                Step::Receive(response)
            }
            StatusCode::RANGE_NOT_SATISFIABLE if self.offset > 0 => {
                tracing::info!(offset = self.offset, "staging file already complete");
                Step::Verify
            }
            s if is_transient(s) => Step::Resume(format!("server answered {s}")),
            s => {
                tracing::error!(status = %s, "download rejected");
                Step::Finish(DownloadOutcome::Rejected(s))
            }
        }
    }

    async fn receive(&mut self, mut response: Response) -> Step {
        self.set_state(TransferState::Receiving);
        let announced = response.content_length();
        let mut first_chunk = true;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::Finish(DownloadOutcome::Cancelled),
                c = tokio::time::timeout(self.opts.timeout, response.chunk()) => c,
            };

            let bytes = match chunk {
                Err(_) => return Step::Resume("transfer stalled".into()),
                Ok(Err(e)) => return Step::Resume(e.to_string()),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(bytes))) => bytes,
            };

            if first_chunk {
                first_chunk = false;
                if let Some(remaining) = announced {
                    self.emit(DownloadEvent::ProgressMax(self.offset + remaining));
                }
            }

            let Some(file) = self.file.as_mut() else {
                return self.disk_error(&io::Error::from(io::ErrorKind::NotFound));
            };
            if let Err(e) = file.write_all(&bytes).await {
                return self.disk_error(&e);
            }
            self.offset += bytes.len() as u64;
            self.emit(DownloadEvent::Progress(self.offset));
        }

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush().await {
                return self.disk_error(&e);
            }
        }
        tracing::info!(bytes = self.offset, "body complete");
        Step::Verify
    }

    async fn resume(&mut self, reason: String) -> Step {
        self.resumes += 1;
        if let Some(max) = self.opts.max_resume_attempts {
            if self.resumes > max {
                return Step::Finish(DownloadOutcome::NetworkFailed {
                    attempts: self.resumes,
                    reason,
                });
            }
        }

        tracing::warn!(attempt = self.resumes, offset = self.offset, "transfer interrupted: {reason}");
        self.emit(DownloadEvent::Interrupted {
            reason,
            attempt: self.resumes,
        });

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Step::Finish(DownloadOutcome::Cancelled),
            _ = tokio::time::sleep(self.opts.resume_delay) => Step::Request,
        }
    }

    async fn verify(&mut self) -> Step {
        let Some(expected) = self.task.expected_checksum.clone() else {
            return Step::Promote;
        };
        self.set_state(TransferState::Verifying);
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all().await {
                return self.disk_error(&e);
            }
        }

        let mut file = match File::open(&self.staging).await {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("reopening {} failed: {e}", self.staging.display());
                return Step::Finish(DownloadOutcome::CheckFailed(e.to_string()));
            }
        };
        let total = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => return Step::Finish(DownloadOutcome::CheckFailed(e.to_string())),
        };
        self.emit(DownloadEvent::VerifyStarted { total });

        let mut sum = expected.accumulator();
        let mut buf = vec![0u8; self.opts.verify_chunk_size.max(1)];
        loop {
            if self.cancel.is_cancelled() {
                return Step::Finish(DownloadOutcome::Cancelled);
            }
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("reading {} failed: {e}", self.staging.display());
                    return Step::Finish(DownloadOutcome::CheckFailed(e.to_string()));
                }
            };
            sum.update(&buf[..n]);
            self.emit(DownloadEvent::Progress(sum.bytes()));
            tokio::task::yield_now().await;
        }

        let computed = sum.finalize();
        if expected.matches(&computed) {
            tracing::info!(algorithm = %expected.algorithm(), "checksum verified");
            Step::Promote
        } else {
            tracing::error!(expected = expected.as_hex(), %computed, "checksum mismatch");
            Step::Finish(DownloadOutcome::ChecksumMismatch {
                expected: expected.as_hex().to_string(),
                computed,
            })
        }
    }

    async fn promote(&mut self) -> Step {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all().await {
                return self.disk_error(&e);
            }
        }
        match fs::rename(&self.staging, &self.task.destination).await {
            Ok(()) => Step::Finish(DownloadOutcome::Success(self.task.destination.clone())),
            Err(e) => {
                tracing::error!("renaming {} failed: {e}", self.staging.display());
                Step::Finish(DownloadOutcome::DiskError(DiskErrorKind::RenameFailed))
            }
        }
    }

    async fn finish(&mut self, outcome: DownloadOutcome) -> DownloadOutcome {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                tracing::warn!("flushing {} failed: {e}", self.staging.display());
            }
        }
        if !outcome.keeps_staging() {
            match fs::remove_file(&self.staging).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("removing {} failed: {e}", self.staging.display()),
            }
        }
        self.set_state(outcome.final_state());
        tracing::info!(?outcome, "download finished");
        outcome
    }
}
