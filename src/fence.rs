//! Cross-process completion fences.
//!
//! A [`Fence`] signals that some producer has finished with a buffer. Fences
//! are backed by an eventfd that is never read: once the counter is non-zero
//! the descriptor stays readable, so every waiter in every process that holds
//! a duplicate observes the signal. Any other pollable descriptor (a kernel
//! sync_file from a GPU driver, for instance) can be adopted with
//! [`Fence::from_fd`].
//!
//! A fence with no descriptor is the "already satisfied" fence. An adopted
//! descriptor whose producer hangs up without making it readable fails every
//! wait with [`FenceError::Abandoned`].
//!
//! # Example
//!
//! ```rust,ignore
//! use hwbuffer::Fence;
//!
//! let fence = Fence::new()?;
//! let consumer_copy = fence.try_clone()?;
//!
//! std::thread::spawn(move || consumer_copy.wait());
//! fence.signal()?;
//! ```

use crate::error::FenceError;
use rustix::event::{EventfdFlags, PollFd, PollFlags, Timespec, eventfd};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::io::Errno;
use std::time::{Duration, Instant};

/// A completion fence that may be shared across processes.
#[derive(Debug)]
#[must_use = "dropping a fence closes it"]
pub struct Fence {
    fd: Option<OwnedFd>,
}

impl Fence {
    /// The already-satisfied fence. Waiting on it never blocks.
    pub const fn signaled() -> Self {
        Self { fd: None }
    }

    /// Create a new, not yet signaled fence.
    pub fn new() -> Result<Self, FenceError> {
        let fd = eventfd(0, EventfdFlags::NONBLOCK | EventfdFlags::CLOEXEC)?;
        Ok(Self { fd: Some(fd) })
    }

    /// Adopt a pollable descriptor as a fence.
    ///
    /// The fence counts as signaled once the descriptor becomes readable.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    /// Signal the fence.
    ///
    /// Signaling is idempotent. Signaling the already-satisfied fence does
    /// nothing.
    pub fn signal(&self) -> Result<(), FenceError> {
        let Some(fd) = &self.fd else {
            return Ok(());
        };
        match rustix::io::write(fd, &1u64.to_ne_bytes()) {
            Ok(_) => Ok(()),
            // Counter saturated: already signaled many times over.
            Err(Errno::AGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Query the fence without blocking.
    pub fn is_signaled(&self) -> Result<bool, FenceError> {
        self.poll_readable(Some(Duration::ZERO))
    }

    /// Block the calling thread until the fence signals.
    pub fn wait(&self) -> Result<(), FenceError> {
        self.poll_readable(None).map(|_| ())
    }

    /// Block until the fence signals or `timeout` elapses.
    ///
    /// Returns `true` if the fence signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, FenceError> {
        self.poll_readable(Some(timeout))
    }

    /// Wait asynchronously for the fence to signal.
    #[cfg(feature = "async")]
    pub async fn wait_async(&self) -> Result<(), FenceError> {
        use tokio::io::Interest;
        use tokio::io::unix::AsyncFd;

        let Some(fd) = &self.fd else {
            return Ok(());
        };
        let async_fd = AsyncFd::with_interest(fd.as_fd(), Interest::READABLE)?;

        loop {
            let mut guard = async_fd.readable().await?;
            if self.is_signaled()? {
                return Ok(());
            }
            guard.clear_ready();
        }
    }

    /// Duplicate the fence. Both copies observe the same signal.
    pub fn try_clone(&self) -> Result<Self, FenceError> {
        match &self.fd {
            Some(fd) => Ok(Self {
                fd: Some(rustix::io::fcntl_dupfd_cloexec(fd, 0)?),
            }),
            None => Ok(Self::signaled()),
        }
    }

    /// Close the fence.
    pub fn close(self) {}

    /// True if this is the descriptor-less, already-satisfied fence.
    #[inline]
    pub fn is_trivially_signaled(&self) -> bool {
        self.fd.is_none()
    }

    /// Borrow the underlying descriptor, if any.
    #[inline]
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Take the underlying descriptor, if any.
    #[inline]
    pub fn into_fd(self) -> Option<OwnedFd> {
        self.fd
    }

    fn poll_readable(&self, timeout: Option<Duration>) -> Result<bool, FenceError> {
        let Some(fd) = &self.fd else {
            return Ok(true);
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let ts = remaining.map(|r| Timespec {
                tv_sec: r.as_secs() as _,
                tv_nsec: r.subsec_nanos() as _,
            });

            let mut fds = [PollFd::new(fd, PollFlags::IN)];
            match rustix::event::poll(&mut fds, ts.as_ref()) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = fds[0].revents();
                    if revents.contains(PollFlags::IN) {
                        return Ok(true);
                    }
                    if revents.intersects(PollFlags::ERR | PollFlags::NVAL) {
                        return Err(FenceError::System(Errno::BADF));
                    }
                    // HUP without data never turns readable.
                    if revents.contains(PollFlags::HUP) {
                        return Err(FenceError::Abandoned);
                    }
                    if remaining.is_some_and(|r| r.is_zero()) {
                        return Ok(false);
                    }
                }
                Err(Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::signaled()
    }
}
