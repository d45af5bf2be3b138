use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use tokio_util::sync::CancellationToken;

use crate::engine::sandbox::bounded::QuotaExceeded;

/// The first event that ended a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The child exited on its own.
    Exited,
    /// The wall-clock deadline elapsed.
    Deadline,
    Quota(QuotaExceeded),
    /// Unexpected I/O trouble outside the quota and deadline paths.
    Failure(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited => f.write_str("process exited"),
            Self::Deadline => f.write_str("deadline elapsed"),
            Self::Quota(quota) => write!(f, "{quota}"),
            Self::Failure(msg) => write!(f, "supervisor failure: {msg}"),
        }
    }
}

/// One-shot, first-writer-wins termination flag shared by the tasks of a run.
///
/// Observers call [`TerminationSignal::trip`]; only the first call records its
/// reason and wakes anyone waiting in [`TerminationSignal::tripped`].
#[derive(Clone, Default)]
pub struct TerminationSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    reason: OnceLock<TerminationReason>,
    token: CancellationToken,
}

impl TerminationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call was the one that set the reason.
    pub fn trip(&self, reason: TerminationReason) -> bool {
        let won = self.inner.reason.set(reason).is_ok();
        if won {
            self.inner.token.cancel();
        }
        won
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        self.inner.reason.get().cloned()
    }

    pub async fn tripped(&self) -> TerminationReason {
        self.inner.token.cancelled().await;
        // The reason is stored before the token is cancelled.
        self.reason().unwrap_or_else(|| {
            TerminationReason::Failure("termination signalled without a reason".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::sandbox::bounded::StreamRole;

    #[test]
    fn first_writer_wins() {
        let signal = TerminationSignal::new();
        assert!(!signal.reason().is_some());
        assert!(signal.trip(TerminationReason::Deadline));
        assert!(!signal.trip(TerminationReason::Exited));
        assert_eq!(signal.reason(), Some(TerminationReason::Deadline));
    }

    #[tokio::test]
    async fn waiters_see_the_winning_reason() {
        let signal = TerminationSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.tripped().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let quota = QuotaExceeded {
            role: StreamRole::Stdout,
            ceiling: 10,
            observed: 11,
        };
        signal.trip(TerminationReason::Quota(quota));
        signal.trip(TerminationReason::Deadline);
        assert_eq!(waiter.await.unwrap(), TerminationReason::Quota(quota));
    }

    #[tokio::test]
    async fn concurrent_trips_have_exactly_one_winner() {
        let signal = TerminationSignal::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let signal = signal.clone();
            handles.push(tokio::spawn(async move {
                signal.trip(TerminationReason::Failure(format!("observer-{i}")))
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
