//! Beat re-entrancy guard.
//!
//! At most one beat body runs at any instant. A beat that starts while
//! another is in progress waits in a FIFO list and is handed the permit
//! directly when the running beat's [`BeatPermit`] drops.
//!
//! This is a mutual exclusion guard, not a scheduler: waiters are resumed in
//! arrival order and nothing else.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::lock_unpoisoned;

#[derive(Debug, Default)]
struct GateState {
    in_progress: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Single "beat in progress" flag plus a FIFO wait list.
#[derive(Debug, Default)]
pub struct BeatGate {
    state: Mutex<GateState>,
}

impl BeatGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other beat is running, then hold the gate.
    pub async fn acquire(&self) -> BeatPermit<'_> {
        loop {
            let rx = {
                let mut state = lock_unpoisoned(&self.state);
                if !state.in_progress {
                    state.in_progress = true;
                    return BeatPermit { gate: self };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            let mut pending = PendingPermit {
                gate: self,
                rx: Some(rx),
            };
            let handed_off = match pending.rx.as_mut() {
                Some(rx) => rx.await.is_ok(),
                None => false,
            };
            // The hand-off has been consumed either way; disarm the guard.
            pending.rx = None;

            if handed_off {
                return BeatPermit { gate: self };
            }
        }
    }

    /// Whether a beat currently holds the gate.
    pub fn is_busy(&self) -> bool {
        lock_unpoisoned(&self.state).in_progress
    }

    /// Number of beats waiting for the gate.
    pub fn waiting(&self) -> usize {
        lock_unpoisoned(&self.state).waiters.len()
    }

    /// Pass the gate to the next live waiter, or clear the flag.
    fn release(&self) {
        let mut state = lock_unpoisoned(&self.state);
        while let Some(next) = state.waiters.pop_front() {
            if next.send(()).is_ok() {
                return;
            }
        }
        state.in_progress = false;
    }
}

/// Proof that the holder is the only running beat. Releases on drop.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the permit is dropped"]
pub struct BeatPermit<'a> {
    gate: &'a BeatGate,
}

impl Drop for BeatPermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Releases a hand-off that arrived after the waiting future was dropped.
struct PendingPermit<'a> {
    gate: &'a BeatGate,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for PendingPermit<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.gate.release();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_uncontended_acquire() {
        let gate = BeatGate::new();
        {
            let _permit = gate.acquire().await;
            assert!(gate.is_busy());
        }
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_waiters_resume_in_fifo_order() {
        let gate = Arc::new(BeatGate::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = gate.acquire().await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let task_gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = task_gate.acquire().await;
                order.lock().unwrap().push(i);
                tokio::task::yield_now().await;
            }));
            // Let each waiter enqueue before spawning the next.
            while gate.waiting() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(!gate.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_strand_the_gate() {
        let gate = Arc::new(BeatGate::new());
        let first = gate.acquire().await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire().await;
            })
        };
        while gate.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        drop(first);
        let acquired = tokio::time::timeout(Duration::from_secs(1), gate.acquire()).await;
        assert!(acquired.is_ok());
    }
}
