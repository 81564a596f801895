//! The device writer job run by the privileged helper.
//!
//! One invocation walks `WaitingForDownload? → Preparing → Locking → Writing
//! → Checking → Done`, reporting on the status protocol as it goes. The
//! image is streamed onto the device one block at a time, through the xz
//! decoder when the file name declares it compressed, and the whole write
//! phase is retried once after a device-side failure.
use crate::decompress::{BlockDecoder, Compression, DecompressError};
use crate::device::{BlockDevice, LockError, LockedDevice, Platform, open_locked};
use crate::download::staging_path;
use crate::status::{ExitStatus, StatusReporter};
use crate::verify::{self, MediaCheck};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Memory alignment of the block buffer; satisfies `O_DIRECT` on any
/// logical sector size up to 4 KiB.
const MEMORY_ALIGNMENT: usize = 4096;
/// Number of write attempts: the first one plus a single retry.
const WRITE_ATTEMPTS: u32 = 2;

/// One write request, as received on the helper command line.
#[derive(Debug, Clone)]
pub struct WriteTask {
    pub image: PathBuf,
    pub device: PathBuf,
    /// Checksum the caller expects the image to carry. Only logged: the
    /// parent verified the download already, and the post-write check
    /// compares the device against the record embedded in the image.
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub block_size: usize,
    pub lock_attempts: u32,
    pub lock_retry_delay: Duration,
    /// Sleep between the failed first attempt and the retry.
    pub retry_delay: Duration,
    pub download_poll_interval: Duration,
    pub xz_memlimit: u64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            lock_attempts: 10,
            lock_retry_delay: Duration::from_secs(2),
            retry_delay: Duration::from_secs(5),
            download_poll_interval: Duration::from_secs(1),
            xz_memlimit: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Source image is not readable ({0})")]
    SourceUnreadable(io::Error),

    #[error("Destination drive is not writable")]
    ShortWrite { expected: usize, written: usize },

    #[error("Destination drive is not writable ({0})")]
    Io(io::Error),

    #[error(transparent)]
    Decompression(DecompressError),

    #[error("The image download did not finish.")]
    DownloadAbandoned,

    #[error("Block of {len} bytes at offset {offset} does not follow a full block")]
    Misaligned { offset: u64, len: usize },

    #[error("Your drive is probably damaged.")]
    VerificationMismatch { embedded: String, computed: String },

    #[error("Unexpected error occurred during media check.")]
    MediaCheck(io::Error),
}

impl From<DecompressError> for WriteError {
    fn from(err: DecompressError) -> Self {
        match err {
            DecompressError::Read(e) => WriteError::SourceUnreadable(e),
            other => WriteError::Decompression(other),
        }
    }
}

impl WriteError {
    /// Failures that justify sleeping and running the write phase again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WriteError::SourceUnreadable(_) | WriteError::ShortWrite { .. } | WriteError::Io(_)
        )
    }

    /// Exit status once this error ends the job.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            WriteError::Lock(_)
            | WriteError::Misaligned { .. }
            | WriteError::VerificationMismatch { .. }
            | WriteError::MediaCheck(_) => ExitStatus::DriveFailure,
            WriteError::SourceUnreadable(_)
            | WriteError::ShortWrite { .. }
            | WriteError::Io(_)
            | WriteError::Decompression(_)
            | WriteError::DownloadAbandoned => ExitStatus::ImageFailure,
        }
    }
}

/// Byte offset of the next block on the device.
///
/// Blocks are full-sized except the last one; once a short block has been
/// placed, nothing else may follow it.
#[derive(Debug)]
pub struct BlockCursor {
    block_size: usize,
    offset: u64,
    closed: bool,
}

impl BlockCursor {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            offset: 0,
            closed: false,
        }
    }

    /// Bytes placed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reserves the next `len` bytes and returns the offset they go to.
    pub fn advance(&mut self, len: usize) -> Result<u64, WriteError> {
        if self.closed || len == 0 || len > self.block_size {
            return Err(WriteError::Misaligned {
                offset: self.offset,
                len,
            });
        }
        if len < self.block_size {
            self.closed = true;
        }
        let at = self.offset;
        self.offset += len as u64;
        Ok(at)
    }
}

/// A block buffer aligned for direct I/O.
pub(crate) struct AlignedBuffer {
    storage: Vec<u8>,
    start: usize,
    block_size: usize,
    capacity: usize,
}

impl AlignedBuffer {
    pub(crate) fn new(block_size: usize) -> Self {
        let capacity = block_size.div_ceil(MEMORY_ALIGNMENT) * MEMORY_ALIGNMENT;
        let storage = vec![0u8; capacity + MEMORY_ALIGNMENT];
        let start = storage.as_ptr().align_offset(MEMORY_ALIGNMENT);
        Self {
            storage,
            start,
            block_size,
            capacity,
        }
    }

    pub(crate) fn block_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.block_size]
    }

    /// The first `len` bytes, zero-padded to a multiple of `alignment`.
    pub(crate) fn padded(&mut self, len: usize, alignment: usize) -> &[u8] {
        let alignment = alignment.max(1);
        let padded = (len.div_ceil(alignment) * alignment).min(self.capacity);
        self.storage[self.start + len..self.start + padded].fill(0);
        &self.storage[self.start..self.start + padded]
    }
}

/// `block_size` rounded up to whole device sectors, so every full block
/// satisfies `O_DIRECT` on drives with 4 KiB logical sectors too.
fn device_block_size(block_size: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    block_size.max(1).div_ceil(alignment) * alignment
}

/// Reads until `buf` is full or the source ends.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

enum State<D: BlockDevice> {
    WaitingForDownload,
    Preparing { attempt: u32 },
    Locking { attempt: u32 },
    Writing { attempt: u32, device: LockedDevice<D> },
    /// The lock is held until the check is over.
    Checking { device: LockedDevice<D> },
    Done(ExitStatus),
}

struct WriteJob<'a, P: Platform, O: Write, E: Write> {
    task: &'a WriteTask,
    opts: &'a WriteOptions,
    platform: &'a P,
    status: &'a mut StatusReporter<O, E>,
    compression: Compression,
}

impl<P: Platform, O: Write, E: Write> WriteJob<'_, P, O, E> {
    fn initial_state(&mut self) -> State<P::Device> {
        let image_exists = self.task.image.exists();
        if !image_exists && staging_path(&self.task.image).exists() {
            return State::WaitingForDownload;
        }
        if !image_exists {
            let err = WriteError::SourceUnreadable(io::Error::from(io::ErrorKind::NotFound));
            return self.fail(err);
        }
        self.status.write_started();
        State::Preparing { attempt: 1 }
    }

    fn wait_for_download(&mut self) -> State<P::Device> {
        let staging = staging_path(&self.task.image);
        tracing::info!("waiting for {} to finish downloading", self.task.image.display());
        while staging.exists() {
            thread::sleep(self.opts.download_poll_interval);
        }
        if !self.task.image.exists() {
            return self.fail(WriteError::DownloadAbandoned);
        }
        self.status.write_started();
        State::Preparing { attempt: 1 }
    }

    fn prepare(&mut self, attempt: u32) -> State<P::Device> {
        if let Err(e) = self.platform.prepare(&self.task.device) {
            tracing::warn!(attempt, "preparing {} failed: {e}", self.task.device.display());
        }
        State::Locking { attempt }
    }

    fn lock(&mut self, attempt: u32) -> State<P::Device> {
        match open_locked(
            self.platform,
            &self.task.device,
            self.opts.lock_attempts,
            self.opts.lock_retry_delay,
        ) {
            Ok(device) => State::Writing { attempt, device },
            Err(e) => self.fail(e.into()),
        }
    }

    fn write(&mut self, attempt: u32, mut device: LockedDevice<P::Device>) -> State<P::Device> {
        tracing::info!(attempt, compression = ?self.compression, "writing image");
        let result = match self.compression {
            Compression::None => self.write_plain(&mut device),
            Compression::Xz => self.write_compressed(&mut device),
        }
        .and_then(|()| device.sync().map_err(WriteError::Io));

        match result {
            Ok(()) => State::Checking { device },
            Err(e) if e.is_retryable() && attempt < WRITE_ATTEMPTS => {
                tracing::warn!(attempt, "write attempt failed, retrying: {e}");
                drop(device);
                self.status.attempt_failed();
                thread::sleep(self.opts.retry_delay);
                State::Preparing {
                    attempt: attempt + 1,
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn write_plain(&mut self, device: &mut LockedDevice<P::Device>) -> Result<(), WriteError> {
        let mut source = File::open(&self.task.image).map_err(WriteError::SourceUnreadable)?;
        let alignment = device.alignment();
        let block_size = device_block_size(self.opts.block_size, alignment);
        let mut buffer = AlignedBuffer::new(block_size);
        let mut cursor = BlockCursor::new(block_size);

        loop {
            let len = read_full(&mut source, buffer.block_mut())
                .map_err(WriteError::SourceUnreadable)?;
            if len == 0 {
                break;
            }
            let offset = cursor.advance(len)?;
            write_block(device, offset, buffer.padded(len, alignment))?;
            self.status.progress(cursor.offset());
            if len < block_size {
                break;
            }
        }
        Ok(())
    }

    fn write_compressed(&mut self, device: &mut LockedDevice<P::Device>) -> Result<(), WriteError> {
        let source = File::open(&self.task.image).map_err(WriteError::SourceUnreadable)?;
        let alignment = device.alignment();
        let block_size = device_block_size(self.opts.block_size, alignment);
        let mut decoder = BlockDecoder::new(source, block_size, self.opts.xz_memlimit)?;
        let mut buffer = AlignedBuffer::new(block_size);
        let mut cursor = BlockCursor::new(block_size);

        while let Some(len) = decoder.next_block(buffer.block_mut())? {
            let offset = cursor.advance(len)?;
            write_block(device, offset, buffer.padded(len, alignment))?;
            self.status.progress(decoder.consumed());
        }
        tracing::debug!(
            compressed = decoder.consumed(),
            decompressed = cursor.offset(),
            "image decompressed"
        );
        Ok(())
    }

    fn check(&mut self, device: LockedDevice<P::Device>) -> State<P::Device> {
        if self.compression == Compression::Xz {
            tracing::info!("not checking, image is compressed");
            return self.succeed();
        }

        self.status.check_started();
        let result = self.platform.open_reader(&self.task.device).and_then(|mut reader| {
            verify::check_media(&mut reader, |offset| self.status.progress(offset))
        });
        drop(device);

        match result {
            Ok(MediaCheck::Passed) | Ok(MediaCheck::NotFound) => self.succeed(),
            Ok(MediaCheck::Failed { embedded, computed }) => {
                self.fail(WriteError::VerificationMismatch { embedded, computed })
            }
            Err(e) => self.fail(WriteError::MediaCheck(e)),
        }
    }

    fn succeed(&mut self) -> State<P::Device> {
        self.status.done();
        self.status.ok();
        State::Done(ExitStatus::Success)
    }

    fn fail(&mut self, err: WriteError) -> State<P::Device> {
        tracing::error!(?err, "write job failed: {err}");
        self.status.failure(&err);
        State::Done(err.exit_status())
    }
}

fn write_block<D: BlockDevice>(
    device: &mut LockedDevice<D>,
    offset: u64,
    data: &[u8],
) -> Result<(), WriteError> {
    let written = device.write_block(offset, data).map_err(WriteError::Io)?;
    if written != data.len() {
        return Err(WriteError::ShortWrite {
            expected: data.len(),
            written,
        });
    }
    Ok(())
}

/// Runs one write job to completion and returns the helper's exit status.
///
/// Every path out of here drops the locked device, which unlocks and
/// closes it.
pub fn run<P: Platform, O: Write, E: Write>(
    task: &WriteTask,
    opts: &WriteOptions,
    platform: &P,
    status: &mut StatusReporter<O, E>,
) -> ExitStatus {
    tracing::info!(
        image = %task.image.display(),
        device = %task.device.display(),
        expected = task.expected_checksum.as_deref().unwrap_or("-"),
        "write job started"
    );
    let mut job = WriteJob {
        task,
        opts,
        platform,
        status,
        compression: Compression::from_path(&task.image),
    };

    let mut state = job.initial_state();
    loop {
        state = match state {
            State::WaitingForDownload => job.wait_for_download(),
            State::Preparing { attempt } => job.prepare(attempt),
            State::Locking { attempt } => job.lock(attempt),
            State::Writing { attempt, device } => job.write(attempt, device),
            State::Checking { device } => job.check(device),
            State::Done(code) => {
                tracing::info!(code = code.code(), "write job finished");
                return code;
            }
        };
    }
}
