//! Incremental delimited reading from a byte stream.
//!
//! Network protocols are mostly line-oriented, but a stream gives no
//! guarantee that one read yields one line: a record may arrive split across
//! several reads, or several records may arrive in one. [`LineReader`] owns a
//! fixed buffer and the cursor state needed to hand back one complete record
//! per call, carrying any bytes read past the delimiter over to the next
//! call.
//!
//! Four modes share the one state object:
//!
//! - [`read_line`](LineReader::read_line): next delimiter-terminated record.
//! - [`read_n_copy`](LineReader::read_n_copy): exactly `n` bytes forwarded
//!   verbatim to a writer, for binary payloads of known length.
//! - [`read_until_boundary`](LineReader::read_until_boundary): accumulate
//!   until a configured multi-byte boundary string, for multi-part bodies.
//! - [`append`](LineReader::append): non-blocking append for bytes obtained
//!   by some other path (pushed from a different reactor).
//!
//! Reads go through the [`ByteSource`] seam. [`FdSource`] implements it over
//! a raw file descriptor with `poll(2)`, which is what connections use after
//! the transformation stack has redirected their endpoints; tests and
//! push-style callers substitute their own source.
//!
//! # Invariant
//!
//! Leftover bytes are always the suffix of the buffer immediately following
//! the last delimiter found, and are moved to the front of the buffer before
//! the next read. The buffer never loses bytes across calls, in any mode.

use std::io::{self, Write};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::warn;

use crate::error::ReadError;

/// A readable stream endpoint with explicit readiness timeouts.
///
/// Every blocking wait in the reader goes through
/// [`wait_readable`](ByteSource::wait_readable) with a caller-supplied
/// timeout, so no reader call can block indefinitely. Connection shutdown is
/// expected to close the underlying endpoint, which an in-flight wait
/// observes as readiness followed by a zero-byte read.
pub trait ByteSource {
    /// Waits until the source is readable or the timeout elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    ///
    /// # Errors
    ///
    /// Transport-level failure.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Reads available bytes into `buf`, returning zero at end of stream.
    ///
    /// # Errors
    ///
    /// Transport-level failure.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// [`ByteSource`] over a raw file descriptor, using `poll(2)` for readiness.
///
/// Holds the descriptor non-owning: the connection owns its endpoints (and
/// the transformation stack may swap them), so the caller must ensure the
/// descriptor stays open for the life of the source.
#[derive(Debug, Clone, Copy)]
pub struct FdSource {
    fd: RawFd,
}

impl FdSource {
    /// Wraps a borrowed descriptor.
    #[must_use]
    pub const fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl ByteSource for FdSource {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        // SAFETY: the caller of `FdSource::new` guarantees the descriptor
        // remains open for the life of this source.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.fd, buf) {
                Ok(count) => return Ok(count),
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Outcome of a non-blocking [`append`](LineReader::append).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Bytes actually accepted; less than the input length if the buffer ran
    /// out of space.
    pub accepted: usize,
    /// Whether a complete record is now buffered.
    pub ready: bool,
}

/// Stateful incremental reader over a fixed buffer.
///
/// One instance per connection, owned by the protocol handler. The buffer
/// capacity must cover the largest single record the protocol allows; a
/// record that does not fit fails with [`ReadError::BufferFull`] rather than
/// being truncated.
pub struct LineReader {
    buf: Box<[u8]>,
    /// Valid bytes in `buf`.
    filled: usize,
    /// Bytes already returned to the caller (record plus delimiter), shifted
    /// out at the start of the next call.
    consumed: usize,
    boundary: Option<Vec<u8>>,
    waiting: bool,
}

impl LineReader {
    /// Creates a reader with a fixed buffer of `capacity` bytes.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "reader buffer capacity must be non-zero");
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            filled: 0,
            consumed: 0,
            boundary: None,
            waiting: false,
        }
    }

    /// The fixed buffer capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes buffered but not yet returned (the leftover carry).
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.filled - self.consumed
    }

    /// Whether a delimiter or boundary search is mid-flight.
    #[must_use]
    pub const fn waiting(&self) -> bool {
        self.waiting
    }

    /// Configures the boundary for [`read_until_boundary`].
    ///
    /// Only needs to be called once, or when the boundary changes.
    ///
    /// # Panics
    ///
    /// If `boundary` is empty.
    ///
    /// [`read_until_boundary`]: LineReader::read_until_boundary
    pub fn set_boundary(&mut self, boundary: impl Into<Vec<u8>>) {
        let boundary = boundary.into();
        assert!(!boundary.is_empty(), "boundary must be non-empty");
        self.boundary = Some(boundary);
    }

    /// Reads the next `delim`-terminated record.
    ///
    /// If leftover bytes from a previous call already contain the delimiter,
    /// the record is returned immediately without touching the source. The
    /// delimiter itself may arrive split across reads. The returned slice
    /// excludes the delimiter; an empty slice means only the delimiter was
    /// read. Bytes past the delimiter stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// - [`ReadError::TimedOut`]: no data within `timeout` for one poll.
    /// - [`ReadError::Closed`]: the peer closed the stream.
    /// - [`ReadError::BufferFull`]: the record exceeds the buffer; hard
    ///   failure, never truncated.
    /// - [`ReadError::Io`]: transport failure.
    ///
    /// # Panics
    ///
    /// If `delim` is empty.
    pub fn read_line<S: ByteSource + ?Sized>(
        &mut self,
        src: &mut S,
        delim: &[u8],
        timeout: Duration,
    ) -> Result<&[u8], ReadError> {
        assert!(!delim.is_empty(), "delimiter must be non-empty");
        self.compact();
        let mut scanned: usize = 0;
        loop {
            // Back up by delim.len()-1 so a delimiter split across reads is
            // still found.
            let window = scanned.saturating_sub(delim.len() - 1);
            if let Some(found) = find(&self.buf[window..self.filled], delim) {
                let at = window + found;
                self.consumed = at + delim.len();
                self.waiting = false;
                return Ok(&self.buf[..at]);
            }
            scanned = self.filled;
            self.waiting = true;
            if self.filled == self.buf.len() {
                return Err(ReadError::BufferFull {
                    capacity: self.buf.len(),
                });
            }
            if !src.wait_readable(timeout)? {
                return Err(ReadError::TimedOut { timeout });
            }
            let count = src.read(&mut self.buf[self.filled..])?;
            if count == 0 {
                return Err(ReadError::Closed);
            }
            self.filled += count;
        }
    }

    /// Reads exactly `n` bytes and forwards them verbatim to `dest`.
    ///
    /// Buffered leftover bytes are consumed first. Never reads past `n`
    /// bytes from the source even if more are immediately available; excess
    /// leftover stays buffered. No delimiter interpretation is applied; this
    /// is a binary operation for payloads whose length is declared up front.
    ///
    /// Returns the number of bytes forwarded, which on success is `n`.
    ///
    /// # Errors
    ///
    /// [`ReadError::TimedOut`] (per poll, not overall), [`ReadError::Closed`],
    /// or [`ReadError::Io`] (including destination write failure).
    pub fn read_n_copy<S: ByteSource + ?Sized>(
        &mut self,
        src: &mut S,
        dest: &mut dyn Write,
        n: usize,
        timeout: Duration,
    ) -> Result<usize, ReadError> {
        self.compact();
        let mut remaining = n;
        if self.filled > 0 && remaining > 0 {
            let take = self.filled.min(remaining);
            dest.write_all(&self.buf[..take])?;
            self.consumed = take;
            self.compact();
            remaining -= take;
        }
        // The pending region is empty from here on, so the buffer doubles as
        // scratch space.
        while remaining > 0 {
            if !src.wait_readable(timeout)? {
                return Err(ReadError::TimedOut { timeout });
            }
            let want = remaining.min(self.buf.len());
            let count = src.read(&mut self.buf[..want])?;
            if count == 0 {
                return Err(ReadError::Closed);
            }
            dest.write_all(&self.buf[..count])?;
            remaining -= count;
        }
        Ok(n - remaining)
    }

    /// Accumulates into `out` until the configured boundary is matched.
    ///
    /// The boundary (set with [`set_boundary`](LineReader::set_boundary)) may
    /// arrive split across any number of reads. On success `out` holds the
    /// accumulated bytes excluding the boundary, and bytes read past the
    /// boundary stay buffered exactly as in delimiter mode.
    ///
    /// # Errors
    ///
    /// - [`ReadError::MissingBoundary`]: no boundary configured.
    /// - [`ReadError::TooLarge`]: accumulated data exceeds `maxlen`; hard
    ///   failure.
    /// - [`ReadError::TimedOut`] / [`ReadError::Closed`] / [`ReadError::Io`]
    ///   as in delimiter mode.
    pub fn read_until_boundary<S: ByteSource + ?Sized>(
        &mut self,
        src: &mut S,
        out: &mut Vec<u8>,
        timeout: Duration,
        maxlen: usize,
    ) -> Result<(), ReadError> {
        let Some(boundary) = self.boundary.clone() else {
            return Err(ReadError::MissingBoundary);
        };
        self.compact();
        loop {
            if self.filled > 0 {
                // Resume the match window boundary.len()-1 bytes back so a
                // boundary straddling the previous chunk is still found.
                let window = out.len().saturating_sub(boundary.len() - 1);
                out.extend_from_slice(&self.buf[..self.filled]);
                self.filled = 0;
                if let Some(found) = find(&out[window..], &boundary) {
                    let at = window + found;
                    let after = at + boundary.len();
                    let leftover = out.len() - after;
                    // A match always ends inside the newest chunk, so the
                    // tail fits back into the fixed buffer.
                    self.buf[..leftover].copy_from_slice(&out[after..]);
                    self.filled = leftover;
                    out.truncate(at);
                    self.waiting = false;
                    return Ok(());
                }
                if out.len() > maxlen {
                    return Err(ReadError::TooLarge { limit: maxlen });
                }
            }
            self.waiting = true;
            if !src.wait_readable(timeout)? {
                return Err(ReadError::TimedOut { timeout });
            }
            let count = src.read(&mut self.buf[..])?;
            if count == 0 {
                return Err(ReadError::Closed);
            }
            self.filled = count;
        }
    }

    /// Appends externally obtained bytes without reading or waiting.
    ///
    /// For callers that receive bytes by some other path (pushed from a
    /// different reactor) and drain records with
    /// [`read_line`](LineReader::read_line) against an always-ready source,
    /// or inspect [`AppendOutcome::ready`] directly. Input that does not fit
    /// in the remaining free space is truncated, reported through
    /// [`AppendOutcome::accepted`].
    ///
    /// # Panics
    ///
    /// If `delim` is empty.
    pub fn append(&mut self, delim: &[u8], data: &[u8]) -> AppendOutcome {
        assert!(!delim.is_empty(), "delimiter must be non-empty");
        self.compact();
        let space = self.buf.len() - self.filled;
        let accepted = data.len().min(space);
        self.buf[self.filled..self.filled + accepted].copy_from_slice(&data[..accepted]);
        self.filled += accepted;
        if accepted < data.len() {
            warn!(
                dropped = data.len() - accepted,
                "append truncated: insufficient buffer space"
            );
        }
        let ready = find(&self.buf[..self.filled], delim).is_some();
        if ready {
            self.waiting = false;
        }
        AppendOutcome { accepted, ready }
    }

    /// Moves the leftover carry to the front of the buffer.
    fn compact(&mut self) {
        if self.consumed > 0 {
            self.buf.copy_within(self.consumed..self.filled, 0);
            self.filled -= self.consumed;
            self.consumed = 0;
        }
    }
}

impl std::fmt::Debug for LineReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineReader")
            .field("capacity", &self.buf.len())
            .field("buffered", &self.buffered())
            .field("waiting", &self.waiting)
            .finish()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
