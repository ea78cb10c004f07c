//! Per-scan time and cancellation budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reason a scan was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Timeout,
    Cancelled,
}

/// Checked at bounded intervals by the scanner, the regex engine and the
/// condition evaluator.
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Deadline {
    pub fn new(limit: Option<Duration>, cancel: Option<Arc<AtomicBool>>) -> Self {
        Self {
            started: Instant::now(),
            limit,
            cancel,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    pub fn check(&self) -> Result<(), Interrupt> {
        if let Some(cancel) = &self.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(Interrupt::Cancelled);
            }
        }
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => Err(Interrupt::Timeout),
            _ => Ok(()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_expires() {
        assert_eq!(Deadline::unlimited().check(), Ok(()));
    }

    #[test]
    fn test_zero_timeout_expires_immediately() {
        let deadline = Deadline::new(Some(Duration::ZERO), None);
        assert_eq!(deadline.check(), Err(Interrupt::Timeout));
    }

    #[test]
    fn test_cancellation_wins_over_timeout() {
        let flag = Arc::new(AtomicBool::new(false));
        let deadline = Deadline::new(Some(Duration::from_secs(60)), Some(flag.clone()));
        assert_eq!(deadline.check(), Ok(()));
        flag.store(true, Ordering::Relaxed);
        assert_eq!(deadline.check(), Err(Interrupt::Cancelled));
    }
}
