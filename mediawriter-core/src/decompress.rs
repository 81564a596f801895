//! Streaming xz decoder that hands out fixed-size output blocks.
//!
//! The device writer pulls one block at a time and writes it before asking
//! for the next, so only one input chunk and one output block are ever held
//! in memory.
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;
use xz2::stream::{Action, CONCATENATED, Error as LzmaError, Status, Stream};

/// Declared compression of a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
}

impl Compression {
    /// Compression is declared by the file name, as published by the catalog.
    pub fn from_path(path: &Path) -> Self {
        let is_xz = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("xz"));
        if is_xz { Compression::Xz } else { Compression::None }
    }
}

#[derive(Debug, Error)]
pub enum DecompressError {
    #[error("There is not enough memory to decompress the file.")]
    Memory,

    #[error("The downloaded compressed file is corrupted.")]
    Format,

    #[error("Unsupported compression options.")]
    Options,

    #[error("Unknown decompression error.")]
    Unknown,

    #[error("Source image is not readable ({0})")]
    Read(#[from] io::Error),
}

impl DecompressError {
    fn from_lzma(err: LzmaError) -> Self {
        match err {
            LzmaError::Mem | LzmaError::MemLimit => DecompressError::Memory,
            LzmaError::Format | LzmaError::Data => DecompressError::Format,
            LzmaError::Options | LzmaError::UnsupportedCheck | LzmaError::NoCheck => {
                DecompressError::Options
            }
            _ => DecompressError::Unknown,
        }
    }

    /// Whether the error is a property of the image (fatal, never retried)
    /// rather than a transient failure reading it.
    pub fn is_corrupt_source(&self) -> bool {
        !matches!(self, DecompressError::Read(_))
    }
}

/// Pull-based xz decoder over any reader.
pub struct BlockDecoder<R> {
    reader: R,
    stream: Stream,
    input: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    eof: bool,
    finished: bool,
    consumed: u64,
}

impl<R: Read> BlockDecoder<R> {
    /// `chunk_size` is the size of each read from `reader`.
    pub fn new(reader: R, chunk_size: usize, memlimit: u64) -> Result<Self, DecompressError> {
        let stream =
            Stream::new_stream_decoder(memlimit, CONCATENATED).map_err(DecompressError::from_lzma)?;
        Ok(Self {
            reader,
            stream,
            input: vec![0u8; chunk_size.max(1)],
            in_pos: 0,
            in_len: 0,
            eof: false,
            finished: false,
            consumed: 0,
        })
    }

    /// Compressed bytes read from the source so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Decoded bytes produced so far.
    pub fn produced(&self) -> u64 {
        self.stream.total_out()
    }

    fn refill(&mut self) -> io::Result<()> {
        loop {
            match self.reader.read(&mut self.input) {
                Ok(n) => {
                    self.in_pos = 0;
                    self.in_len = n;
                    self.consumed += n as u64;
                    self.eof = n == 0;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Fills `out` with decoded bytes.
    ///
    /// Returns the number of bytes placed in `out`: a full block, or a short
    /// final block at the end of the stream. Returns `Ok(None)` once the
    /// stream is exhausted. On error nothing of the partially decoded block is
    /// handed out.
    pub fn next_block(&mut self, out: &mut [u8]) -> Result<Option<usize>, DecompressError> {
        if self.finished {
            return Ok(None);
        }

        let mut filled = 0;
        while filled < out.len() {
            if self.in_pos == self.in_len && !self.eof {
                self.refill()?;
            }

            let action = if self.eof { Action::Finish } else { Action::Run };
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();

            let status = self
                .stream
                .process(&self.input[self.in_pos..self.in_len], &mut out[filled..], action)
                .map_err(DecompressError::from_lzma)?;

            let read = (self.stream.total_in() - before_in) as usize;
            let written = (self.stream.total_out() - before_out) as usize;
            self.in_pos += read;
            filled += written;

            match status {
                Status::StreamEnd => {
                    self.finished = true;
                    return Ok(if filled > 0 { Some(filled) } else { None });
                }
                // liblzma reports LZMA_BUF_ERROR this way: no progress is
                // possible, i.e. the input ended in the middle of the stream.
                Status::MemNeeded => return Err(DecompressError::Format),
                Status::Ok | Status::GetCheck => {
                    if self.eof && read == 0 && written == 0 {
                        return Err(DecompressError::Format);
                    }
                }
            }
        }

        Ok(Some(filled))
    }
}
