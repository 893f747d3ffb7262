//! Close and deadline interruption for poll-based connections

use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use tokio::time::{Instant, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct Timer {
    deadline: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
    waker: Option<Waker>,
}

/// Per-direction deadline plus a shared closed flag
///
/// I/O paths poll [`IoGate::poll_interrupted`] before touching the socket;
/// `close` and deadline changes wake whatever task is parked there.
#[derive(Debug, Default)]
pub(crate) struct IoGate {
    closed: AtomicBool,
    read: Mutex<Timer>,
    write: Mutex<Timer>,
}

impl IoGate {
    fn timer(&self, dir: Direction) -> MutexGuard<'_, Timer> {
        let timer = match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        };
        timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ready with an error once the connection is closed or the deadline passed
    pub(crate) fn poll_interrupted(&self, cx: &mut Context<'_>, dir: Direction) -> Poll<io::Error> {
        let mut timer = self.timer(dir);
        match &timer.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => timer.waker = Some(cx.waker().clone()),
        }

        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(closed_error());
        }

        let Some(deadline) = timer.deadline else {
            return Poll::Pending;
        };
        if Instant::now() >= deadline {
            return Poll::Ready(timeout_error());
        }
        let sleep = timer
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(timeout_error()),
            Poll::Pending => Poll::Pending,
        }
    }

    pub(crate) async fn interrupted(&self, dir: Direction) -> io::Error {
        poll_fn(|cx| self.poll_interrupted(cx, dir)).await
    }

    pub(crate) fn set_deadline(&self, dir: Direction, deadline: Option<Instant>) {
        let mut timer = self.timer(dir);
        timer.deadline = deadline;
        timer.sleep = None;
        if let Some(waker) = timer.waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for dir in [Direction::Read, Direction::Write] {
            if let Some(waker) = self.timer(dir).waker.take() {
                waker.wake();
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed connection")
}

fn timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
}
