//! Outbound buffers of a client, with the write budget they consume.

use crate::error::os_code;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::ptr::NonNull;
use std::slice;
use std::time::{Duration, Instant};

/// Flags accepted by [`Client::add`](crate::Client::add) and friends.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiFlags(u8);

impl ApiFlags {
    /// No flag: borrowing APIs keep a view into caller memory.
    pub const NONE: Self = Self(0);
    /// Copy the data into an internal buffer.
    pub const COPY: Self = Self(0x01);
    /// More data follows; forwarded to the transport where supported.
    pub const MORE: Self = Self(0x02);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for ApiFlags {
    fn default() -> Self {
        Self::COPY
    }
}

impl BitOr for ApiFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ApiFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ApiFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::COPY) {
            names.push("COPY");
        }
        if self.contains(Self::MORE) {
            names.push("MORE");
        }
        if names.is_empty() {
            names.push("NONE");
        }

        write!(f, "ApiFlags({})", names.join(" | "))
    }
}

/// View into caller memory that the caller keeps valid until released.
pub(crate) struct BorrowedSlice {
    ptr: NonNull<u8>,
    len: usize,
}

// The creator of a `BorrowedSlice` guarantees the memory outlives it and is not
// mutated, so moving the view to the reactor thread is sound.
unsafe impl Send for BorrowedSlice {}

impl BorrowedSlice {
    /// # Safety
    ///
    /// `data` must stay valid and unmodified until the slice is dropped.
    pub(crate) unsafe fn new(data: &[u8]) -> Self {
        Self {
            ptr: NonNull::from(data).cast(),
            len: data.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

pub(crate) enum Payload {
    Owned(Box<[u8]>),
    Static(&'static [u8]),
    Borrowed(BorrowedSlice),
    Released,
}

impl Payload {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(data) => &data[..],
            Self::Static(data) => *data,
            Self::Borrowed(view) => view.as_slice(),
            Self::Released => &[],
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// One queued chunk and its transmission progress.
pub(crate) struct WriteQueueBuffer {
    payload: Payload,
    len: usize,
    written: usize,
    more: bool,
    queued_at: Instant,
    written_at: Option<Instant>,
    error: i32,
}

impl WriteQueueBuffer {
    fn new(payload: Payload, more: bool, now: Instant) -> Self {
        Self {
            len: payload.len(),
            payload,
            written: 0,
            more,
            queued_at: now,
            written_at: None,
            error: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.written >= self.len
    }

    fn is_errored(&self) -> bool {
        self.error != 0
    }

    fn delay(&self) -> Duration {
        self.written_at
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(self.queued_at))
    }
}

enum WriteStep {
    Done,
    Stalled,
    Failed,
}

impl WriteQueueBuffer {
    /// Hands the unwritten tail to `send` until it is complete, would block, or fails.
    fn write_with<F>(&mut self, now: Instant, send: &mut F, written: &mut usize) -> WriteStep
    where
        F: FnMut(&[u8], bool) -> io::Result<usize>,
    {
        while !self.is_complete() {
            let remaining = &self.payload.as_slice()[self.written..];

            match send(remaining, self.more) {
                Ok(0) => return WriteStep::Stalled,
                Ok(count) => {
                    let count = count.min(remaining.len());
                    self.written += count;
                    *written += count;
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return WriteStep::Stalled;
                }
                Err(error) => {
                    self.error = os_code(&error);
                    return WriteStep::Failed;
                }
            }
        }

        self.written_at = Some(now);
        self.payload = Payload::Released;

        WriteStep::Done
    }
}

/// Buffers whose transmission finished, removed in queue order.
#[derive(Debug, Default)]
pub(crate) struct Finished {
    /// `(length, milliseconds between queueing and completion)` per buffer.
    pub(crate) acked: Vec<(usize, u32)>,
    /// Error recorded on the buffer the scan stopped at.
    pub(crate) error: Option<i32>,
    /// Completion time of the last removed buffer.
    pub(crate) last_written: Option<Instant>,
}

/// FIFO of outbound buffers and the remaining write budget.
///
/// `space` always equals the initial budget minus the unwritten bytes of every
/// queued buffer.
pub(crate) struct WriteQueue {
    buffers: VecDeque<WriteQueueBuffer>,
    initial_space: usize,
    space: usize,
    ack_timeout_signaled: bool,
}

impl WriteQueue {
    pub(crate) fn new(initial_space: usize) -> Self {
        Self {
            buffers: VecDeque::new(),
            initial_space,
            space: initial_space,
            ack_timeout_signaled: false,
        }
    }

    pub(crate) fn space(&self) -> usize {
        self.space
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Appends `payload`, which the caller has already truncated to [`space`](Self::space).
    pub(crate) fn push(&mut self, payload: Payload, more: bool, now: Instant) -> usize {
        let len = payload.len();
        debug_assert!(len <= self.space);

        self.space -= len.min(self.space);
        self.buffers.push_back(WriteQueueBuffer::new(payload, more, now));
        self.ack_timeout_signaled = false;

        len
    }

    /// Writes queued data in order through `send`.
    ///
    /// Stops at the first buffer that would block or fails, so bytes reach the
    /// wire in queue order. Returns the number of bytes written.
    pub(crate) fn drain<F>(&mut self, now: Instant, mut send: F) -> usize
    where
        F: FnMut(&[u8], bool) -> io::Result<usize>,
    {
        let mut written = 0;

        for buffer in self.buffers.iter_mut() {
            if buffer.is_errored() {
                break;
            }
            if buffer.is_complete() {
                continue;
            }

            match buffer.write_with(now, &mut send, &mut written) {
                WriteStep::Done => {}
                WriteStep::Stalled | WriteStep::Failed => break,
            }
        }

        if written > 0 {
            self.space = (self.space + written).min(self.initial_space);
        }

        written
    }

    /// Removes fully written buffers from the front.
    ///
    /// Stops at the first incomplete or errored buffer; an errored buffer is left
    /// in place and reported through [`Finished::error`].
    pub(crate) fn collect_finished(&mut self) -> Finished {
        let mut finished = Finished::default();

        while let Some(front) = self.buffers.front() {
            if front.is_errored() {
                finished.error = Some(front.error);
                break;
            }
            if !front.is_complete() {
                break;
            }

            let delay = u32::try_from(front.delay().as_millis()).unwrap_or(u32::MAX);
            finished.acked.push((front.len, delay));
            finished.last_written = front.written_at;
            self.buffers.pop_front();
        }

        finished
    }

    /// Discards every buffer and restores the full budget.
    pub(crate) fn clear(&mut self) {
        self.buffers.clear();
        self.space = self.initial_space;
    }

    /// How long the head buffer has been queued without being fully written.
    ///
    /// Partial progress does not restart the measurement.
    pub(crate) fn head_stall(&self, now: Instant) -> Option<Duration> {
        let head = self.buffers.front()?;
        if head.written_at.is_some() || head.is_errored() {
            return None;
        }

        Some(now.saturating_duration_since(head.queued_at))
    }

    pub(crate) fn ack_timeout_signaled(&self) -> bool {
        self.ack_timeout_signaled
    }

    pub(crate) fn signal_ack_timeout(&mut self) {
        self.ack_timeout_signaled = true;
    }

    pub(crate) fn reset_ack_timeout(&mut self) {
        self.ack_timeout_signaled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiFlags, Payload, WriteQueue};

    use std::io;
    use std::time::{Duration, Instant};

    fn owned(data: &[u8]) -> Payload {
        Payload::Owned(data.to_vec().into_boxed_slice())
    }

    #[test]
    fn flags_combine() {
        let flags = ApiFlags::COPY | ApiFlags::MORE;
        assert!(flags.contains(ApiFlags::COPY));
        assert!(flags.contains(ApiFlags::MORE));
        assert!(!ApiFlags::NONE.contains(ApiFlags::COPY));
        assert_eq!(ApiFlags::default(), ApiFlags::COPY);
    }

    #[test]
    fn budget_tracks_unwritten_bytes() {
        let now = Instant::now();
        let mut queue = WriteQueue::new(10);

        queue.push(owned(b"abcdef"), false, now);
        assert_eq!(queue.space(), 4);

        let written = queue.drain(now, |data, _| Ok(data.len().min(4)));
        assert_eq!(written, 6);
        assert_eq!(queue.space(), 10);

        let finished = queue.collect_finished();
        assert_eq!(finished.acked, vec![(6, 0)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn stall_stops_the_pass() {
        let now = Instant::now();
        let mut queue = WriteQueue::new(100);
        queue.push(owned(b"first"), false, now);
        queue.push(owned(b"second"), false, now);

        let mut wire = Vec::new();
        let mut budget = 3;
        queue.drain(now, |data, _| {
            if budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = data.len().min(budget);
            budget -= count;
            wire.extend_from_slice(&data[..count]);
            Ok(count)
        });

        assert_eq!(wire, b"fir");
        assert_eq!(queue.space(), 100 - 8);
        assert!(queue.collect_finished().acked.is_empty());
        assert_eq!(queue.len(), 2);

        queue.drain(now, |data, _| {
            wire.extend_from_slice(data);
            Ok(data.len())
        });
        assert_eq!(wire, b"firstsecond");
        assert_eq!(queue.collect_finished().acked, vec![(5, 0), (6, 0)]);
    }

    #[test]
    fn hard_error_is_reported_after_completed_buffers() {
        let now = Instant::now();
        let mut queue = WriteQueue::new(100);
        queue.push(owned(b"ok"), false, now);
        queue.push(owned(b"broken"), true, now);

        let mut calls = 0;
        queue.drain(now, |data, more| {
            calls += 1;
            if more {
                return Err(io::Error::from_raw_os_error(libc::EPIPE));
            }
            Ok(data.len())
        });
        assert_eq!(calls, 2);

        let finished = queue.collect_finished();
        assert_eq!(finished.acked, vec![(2, 0)]);
        assert_eq!(finished.error, Some(libc::EPIPE));
        assert_eq!(queue.len(), 1);

        queue.clear();
        assert_eq!(queue.space(), 100);
        assert!(queue.is_empty());
    }

    #[test]
    fn head_stall_counts_from_queueing_through_partial_progress() {
        let start = Instant::now();
        let mut queue = WriteQueue::new(100);
        queue.push(owned(b"payload"), false, start);

        let later = start + Duration::from_millis(200);
        assert_eq!(queue.head_stall(later), Some(Duration::from_millis(200)));

        queue.signal_ack_timeout();
        let mut accepted = false;
        queue.drain(later, |_, _| {
            if accepted {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            accepted = true;
            Ok(1)
        });
        assert!(queue.ack_timeout_signaled());
        assert_eq!(queue.space(), 100 - 6);

        let much_later = later + Duration::from_millis(200);
        assert_eq!(queue.head_stall(much_later), Some(Duration::from_millis(400)));

        queue.drain(much_later, |data, _| Ok(data.len()));
        assert_eq!(queue.head_stall(much_later), None);
        assert!(queue.ack_timeout_signaled());
    }

    #[test]
    fn push_resets_ack_latch() {
        let now = Instant::now();
        let mut queue = WriteQueue::new(8);
        queue.signal_ack_timeout();
        queue.push(owned(b"x"), false, now);
        assert!(!queue.ack_timeout_signaled());
    }
}
