//! Edge-triggered interrupt delivery.
//!
//! Each GPIO context with a registered ISR owns one background thread
//! blocking on the line's event source: a `POLLPRI` wait on a sysfs
//! `value` file, or a readable-record wait on a gpiochip line-event
//! descriptor (or any platform-supplied descriptor with the same
//! semantics, such as a bridge's notification pipe). Every qualifying
//! edge invokes the callback exactly once, on the background thread.
//!
//! Cancellation is a self-pipe: the thread's poll set always includes
//! the read end of a control pipe, and a stop request writes one byte to
//! the other end. This wakes a blocked poll unconditionally on every
//! platform, so no pthread-cancellation support is assumed anywhere.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{Error, Result};
use crate::gpio::Edge;
use crate::tracing::prelude::*;

/// Callback invoked on the interrupt thread for each qualifying edge.
pub type IsrCallback = Box<dyn FnMut() + Send + 'static>;

/// One line event, as delivered by a gpiochip line-event read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub edge: Edge,
    /// Kernel timestamp of the edge, in nanoseconds.
    pub timestamp_ns: u64,
}

enum WaitKind {
    /// Sysfs value file: wait for `POLLPRI | POLLERR`, then rewind and
    /// re-read to consume the notification.
    Priority,
    /// Record stream (gpiochip event fd, control pipe of a bridge):
    /// wait for `POLLIN`, then read one fixed-size record.
    Records { size: usize },
}

/// A descriptor an interrupt thread can block on.
pub struct EventSource {
    file: File,
    kind: WaitKind,
}

impl EventSource {
    /// Sysfs-style source: edge notifications surface as priority data
    /// on `file`.
    pub fn priority(file: File) -> Self {
        EventSource {
            file,
            kind: WaitKind::Priority,
        }
    }

    /// Record-stream source: each edge is one `record_size`-byte read.
    pub fn records(file: File, record_size: usize) -> Self {
        EventSource {
            file,
            kind: WaitKind::Records { size: record_size },
        }
    }

    // A freshly opened sysfs value file reports priority data
    // immediately; consume it so registration does not deliver a stale
    // edge.
    fn drain_initial(&mut self) -> std::io::Result<()> {
        if let WaitKind::Priority = self.kind {
            self.consume_value()?;
        }
        Ok(())
    }

    fn consume_value(&mut self) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        self.file.seek(SeekFrom::Start(0))?;
        let _ = self.file.read(&mut buf)?;
        Ok(())
    }
}

/// Handle to a running interrupt thread.
pub(crate) struct IsrThread {
    join: Option<JoinHandle<()>>,
    cancel: File,
    dead: Arc<AtomicBool>,
}

impl IsrThread {
    /// Spawn the interrupt thread for `source`.
    pub(crate) fn spawn(source: EventSource, callback: IsrCallback) -> Result<IsrThread> {
        let (pipe_r, pipe_w) = nix::unistd::pipe()
            .map_err(|e| Error::NoResources(format!("isr control pipe: {e}")))?;
        let cancel_r = File::from(pipe_r);
        let cancel_w = File::from(pipe_w);

        let dead = Arc::new(AtomicBool::new(false));
        let thread_dead = Arc::clone(&dead);
        let join = std::thread::Builder::new()
            .name("gpio-isr".into())
            .spawn(move || isr_loop(source, cancel_r, callback, thread_dead))
            .map_err(|e| Error::NoResources(format!("isr thread: {e}")))?;

        Ok(IsrThread {
            join: Some(join),
            cancel: cancel_w,
            dead,
        })
    }

    /// Whether the thread exited on its own (event source failure). The
    /// handle should then be reaped so a new registration can retry.
    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Request cancellation and block until the thread has exited.
    pub(crate) fn stop(mut self) -> Result<()> {
        // The write fails with EPIPE if the thread already exited and
        // dropped the read end; joining is all that is left to do then.
        let _ = self.cancel.write_all(&[1]);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| Error::Unspecified("isr thread panicked".into()))?;
        }
        Ok(())
    }
}

fn isr_loop(mut source: EventSource, cancel: File, mut callback: IsrCallback, dead: Arc<AtomicBool>) {
    if let Err(e) = source.drain_initial() {
        warn!(error = %e, "isr: could not prime event source, exiting");
        dead.store(true, Ordering::Release);
        return;
    }

    loop {
        let source_flags = match source.kind {
            WaitKind::Priority => PollFlags::POLLPRI | PollFlags::POLLERR,
            WaitKind::Records { .. } => PollFlags::POLLIN,
        };

        let (source_revents, cancelled) = {
            let mut fds = [
                PollFd::new(source.file.as_fd(), source_flags),
                PollFd::new(cancel.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "isr: poll failed, exiting");
                    dead.store(true, Ordering::Release);
                    return;
                }
            }
            let cancelled = fds[1]
                .revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                .unwrap_or(false);
            (fds[0].revents().unwrap_or(PollFlags::empty()), cancelled)
        };

        if cancelled {
            trace!("isr: cancellation requested");
            return;
        }

        match source.kind {
            WaitKind::Priority => {
                if source_revents.intersects(PollFlags::POLLPRI | PollFlags::POLLERR) {
                    if source.consume_value().is_err() {
                        dead.store(true, Ordering::Release);
                        return;
                    }
                    callback();
                }
            }
            WaitKind::Records { size } => {
                if source_revents.contains(PollFlags::POLLIN) {
                    let mut record = vec![0u8; size];
                    match source.file.read(&mut record) {
                        Ok(0) => {
                            // Source closed underneath us.
                            dead.store(true, Ordering::Release);
                            return;
                        }
                        Ok(_) => callback(),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(error = %e, "isr: event read failed, exiting");
                            dead.store(true, Ordering::Release);
                            return;
                        }
                    }
                } else if source_revents
                    .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
                {
                    dead.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }
}
