//! Deferred close of a lease descriptor after a transfer.
//!
//! When a lease moves to a new client the previous client's descriptor is kept
//! open until the CRTC scans out a different framebuffer, so the last frame of
//! the old client stays on screen until the new client has posted its own.
//! Closing the descriptor then frees the old framebuffer if nothing else holds
//! it.
//!
//! The wait runs on its own thread and blocks in `poll(2)` on the lease
//! descriptor, together with an eventfd used to cancel it. Whether the thread
//! finishes, fails or is cancelled, the previous descriptor is dropped exactly
//! once on that thread, and [`TransitionWorker::cancel`] does not return before
//! that has happened.

use std::{
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
    thread::{self, JoinHandle},
};

use rustix::{
    event::{eventfd, poll, EventfdFlags, PollFd, PollFlags},
    io::Errno,
};
use tracing::{debug, warn};

use crate::device::{KmsDevice, ObjectId};

#[derive(Debug)]
pub struct TransitionWorker {
    cancel: OwnedFd,
    thread: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Changed,
    Cancelled,
    Failed,
}

impl TransitionWorker {
    /// Starts watching `crtc` through `watch` and closes `previous` once the
    /// displayed framebuffer changes.
    ///
    /// On error `previous` has already been closed.
    pub fn spawn<D: KmsDevice>(
        device: Arc<D>,
        lease: &str,
        crtc: ObjectId,
        watch: OwnedFd,
        previous: OwnedFd,
    ) -> io::Result<Self> {
        let old_fb = device.crtc_framebuffer(watch.as_fd(), crtc)?;
        let cancel = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        let cancel_rx = cancel.try_clone()?;

        let lease = lease.to_string();
        let thread = thread::Builder::new()
            .name(format!("dlm-transition-{lease}"))
            .spawn(move || {
                let outcome = wait_for_fb_update(
                    device.as_ref(),
                    watch.as_fd(),
                    cancel_rx.as_fd(),
                    crtc,
                    old_fb,
                );
                debug!(lease, ?outcome, "Closing previous lease descriptor");
                drop(previous);
            })?;

        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Interrupts the wait and joins the thread. The previous descriptor is
    /// closed when this returns.
    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        if let Err(err) = rustix::io::write(&self.cancel, &1u64.to_ne_bytes()) {
            // EAGAIN means the counter is already non-zero.
            if err != Errno::AGAIN {
                warn!(?err, "Failed to signal lease transition cancel");
            }
        }
        if thread.join().is_err() {
            warn!("Lease transition thread panicked");
        }
    }
}

impl Drop for TransitionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wait_for_fb_update<D: KmsDevice + ?Sized>(
    device: &D,
    watch: BorrowedFd<'_>,
    cancel: BorrowedFd<'_>,
    crtc: ObjectId,
    old_fb: u32,
) -> WaitOutcome {
    loop {
        let mut fds = [
            PollFd::from_borrowed_fd(watch, PollFlags::IN),
            PollFd::from_borrowed_fd(cancel, PollFlags::IN),
        ];
        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(Errno::INTR) => continue,
            Err(err) => {
                debug!(?err, "poll on lease descriptor failed");
                return WaitOutcome::Failed;
            }
        }

        if !fds[1].revents().is_empty() {
            return WaitOutcome::Cancelled;
        }
        if fds[0]
            .revents()
            .intersects(PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL)
        {
            return WaitOutcome::Failed;
        }

        match device.crtc_framebuffer(watch, crtc) {
            Ok(fb) if fb == old_fb => continue,
            Ok(_) => return WaitOutcome::Changed,
            Err(err) => {
                debug!(?err, crtc, "Failed to read CRTC framebuffer");
                return WaitOutcome::Failed;
            }
        }
    }
}
