//! Background prefetching of read-only buffers.
//!
//! A [`Prefetcher`] pages a buffer in on a helper thread, so that a later
//! linear read (for example, deserializing a heap snapshot) does not stall
//! on page faults. The thread reads one byte per page and checks its
//! [`CancellationToken`] every [`PREFETCH_CHECK_INTERVAL`] pages.

use std::hint::black_box;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;

/// Pages touched between two cancellation checks.
pub const PREFETCH_CHECK_INTERVAL: usize = 32;

#[cfg(loom)]
use loom::sync::{
    atomic::{AtomicBool, Ordering},
    Arc as TokenArc,
};
#[cfg(not(loom))]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc as TokenArc,
};

/// Shared flag asking a background task to stop.
#[derive(Clone)]
pub struct CancellationToken(TokenArc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self(TokenArc::new(AtomicBool::new(false)))
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken").finish_non_exhaustive()
    }
}

/// How a prefetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    /// Every page was touched.
    Completed {
        /// Pages touched.
        pages: usize,
    },
    /// The token was cancelled first.
    Cancelled {
        /// Pages touched before the cancellation was seen.
        pages: usize,
    },
}

impl PrefetchOutcome {
    #[must_use]
    pub const fn pages(self) -> usize {
        match self {
            Self::Completed { pages } | Self::Cancelled { pages } => pages,
        }
    }
}

/// Handle to a running prefetch thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct Prefetcher {
    token: CancellationToken,
    done: Receiver<PrefetchOutcome>,
    handle: Mutex<Option<JoinHandle<PrefetchOutcome>>>,
}

impl Prefetcher {
    /// Start paging in `buffer` on a new thread.
    ///
    /// # Errors
    ///
    /// Returns the error from [`thread::Builder::spawn`].
    pub fn spawn(buffer: Arc<[u8]>, token: CancellationToken) -> io::Result<Self> {
        let (tx, done) = channel::bounded(1);
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name("segheap-prefetch".into())
            .spawn(move || {
                let outcome = touch_pages(&buffer, &thread_token, sys_alloc::page_size());
                // The handle may already be gone.
                let _ = tx.send(outcome);
                outcome
            })?;

        Ok(Self {
            token,
            done,
            handle: Mutex::new(Some(handle)),
        })
    }

    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait up to `timeout` for the thread to finish. Returns `true` if it
    /// has finished, whether by completing or by cancellation.
    #[must_use]
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        if self.handle.lock().as_ref().is_none_or(JoinHandle::is_finished) {
            return true;
        }
        match self.done.recv_timeout(timeout) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Cancel the thread and join it. Returns `None` if it was already
    /// stopped.
    pub fn stop(&self) -> Option<PrefetchOutcome> {
        self.token.cancel();
        let handle = self.handle.lock().take()?;
        handle.join().ok()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read one byte of every `page_size` page of `buffer` on the calling
/// thread, checking `token` every [`PREFETCH_CHECK_INTERVAL`] pages and
/// before the first one.
///
/// This is the loop [`Prefetcher`] runs on its helper thread.
#[must_use]
pub fn touch_pages(buffer: &[u8], token: &CancellationToken, page_size: usize) -> PrefetchOutcome {
    if !buffer.is_empty() {
        // SAFETY: the range is exactly the borrowed buffer. The advice only
        // affects residency and is ignored on failure.
        let _ = unsafe { sys_alloc::advise_will_need(buffer.as_ptr(), buffer.len()) };
    }

    let mut pages = 0;
    for (i, offset) in (0..buffer.len()).step_by(page_size).enumerate() {
        if i % PREFETCH_CHECK_INTERVAL == 0 && token.is_cancelled() {
            return PrefetchOutcome::Cancelled { pages };
        }
        black_box(buffer[offset]);
        pages += 1;
    }
    PrefetchOutcome::Completed { pages }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(pages: usize) -> Arc<[u8]> {
        vec![7u8; pages * sys_alloc::page_size()].into()
    }

    #[test]
    fn test_touches_every_page() {
        let prefetcher = Prefetcher::spawn(buffer(10), CancellationToken::new()).unwrap();
        assert!(prefetcher.wait_for_completion(Duration::from_secs(10)));
        assert!(!prefetcher.token().is_cancelled());
        let outcome = prefetcher.stop();
        assert!(matches!(
            outcome,
            Some(PrefetchOutcome::Completed { pages: 10 } | PrefetchOutcome::Cancelled { .. })
        ));
        assert_eq!(prefetcher.stop(), None);
    }

    #[test]
    fn test_empty_buffer_completes() {
        let token = CancellationToken::new();
        assert_eq!(
            touch_pages(&[], &token, 4096),
            PrefetchOutcome::Completed { pages: 0 }
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let data = vec![0u8; 8 * 4096];
        assert_eq!(
            touch_pages(&data, &token, 4096),
            PrefetchOutcome::Cancelled { pages: 0 }
        );
    }

    #[test]
    fn test_partial_last_page_counts() {
        let token = CancellationToken::new();
        let data = vec![0u8; 4096 * 2 + 1];
        assert_eq!(touch_pages(&data, &token, 4096).pages(), 3);
    }

    #[test]
    fn test_drop_stops_thread() {
        let token = CancellationToken::new();
        let prefetcher = Prefetcher::spawn(buffer(64), token.clone()).unwrap();
        drop(prefetcher);
        assert!(token.is_cancelled());
    }
}
