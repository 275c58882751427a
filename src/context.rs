//! Cancellation and deadline propagation for a run.
//!
//! A single root context drives the whole run; each phase derives a child with
//! its own timeout. Children observe their ancestors, so cancelling the root or
//! hitting its deadline stops every phase and every subprocess bound to it.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug)]
struct Inner {
    parent: Option<Arc<Inner>>,
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl Inner {
    fn err(&self) -> Option<ContextError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Some(ContextError::Canceled);
        }
        if let Some(parent) = &self.parent {
            if let Some(err) = parent.err() {
                return Some(err);
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }
}

/// Cloneable handle to a cancellation scope.
#[derive(Debug, Clone)]
pub struct RunContext {
    inner: Arc<Inner>,
}

impl RunContext {
    /// A root context that never expires on its own.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: None,
                cancelled: AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    /// Derive a child that expires after `timeout` or when `self` is done.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match self.inner.deadline {
            Some(parent) if parent < own => parent,
            _ => own,
        };
        Self {
            inner: Arc::new(Inner {
                parent: Some(self.inner.clone()),
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
            }),
        }
    }

    /// Derive a child without its own deadline; cancelling it leaves `self` alone.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: Some(self.inner.clone()),
                cancelled: AtomicBool::new(false),
                deadline: self.inner.deadline,
            }),
        }
    }

    /// Cancel this context and everything derived from it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// `Some` once the context is cancelled or past its deadline.
    pub fn err(&self) -> Option<ContextError> {
        self.inner.err()
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Fail with the context error, for use with `?` at checkpoints.
    pub fn check(&self) -> anyhow::Result<()> {
        match self.err() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Sleep for up to `duration`, waking early when the context is done.
    pub fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep((until - now).min(Duration::from_millis(25)));
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_done() {
        let ctx = RunContext::background();
        assert!(!ctx.is_done());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn cancel_propagates_to_children_only() {
        let root = RunContext::background();
        let child = root.with_timeout(Duration::from_secs(60));
        let grandchild = child.child();
        child.cancel();
        assert_eq!(grandchild.err(), Some(ContextError::Canceled));
        assert!(!root.is_done());
    }

    #[test]
    fn child_deadline_never_outlives_parent() {
        let root = RunContext::background().with_timeout(Duration::from_millis(5));
        let child = root.with_timeout(Duration::from_secs(600));
        assert!(child.remaining().expect("bounded") <= Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(child.err(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let ctx = RunContext::background();
        ctx.cancel();
        let err = ctx.sleep(Duration::from_secs(5)).expect_err("cancelled");
        assert_eq!(
            err.downcast_ref::<ContextError>(),
            Some(&ContextError::Canceled)
        );
    }
}
