//! Mining Manager: holds the active challenge, dispatches PoW workers against
//! it, and fans solutions out to subscribed Submitters.

use crate::model::{Challenge, Solution};
use crate::worker;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct MiningManager {
    inner: Arc<Mutex<Inner>>,
    public_address: Address,
    num_processors: usize,
    gpu_workers: usize,
    cancel: CancellationToken,
}

struct Inner {
    current: Option<Challenge>,
    worker_cancel: Option<CancellationToken>,
    subscribers: Vec<watch::Sender<Option<Solution>>>,
}

impl MiningManager {
    pub fn new(
        public_address: Address,
        num_processors: usize,
        gpu_workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: None,
                worker_cancel: None,
                subscribers: Vec::new(),
            })),
            public_address,
            num_processors,
            gpu_workers,
            cancel,
        }
    }

    /// Registers a new Submitter, returning a watch receiver it should poll for
    /// solutions. A watch channel gives the Submitter latest-wins delivery for free:
    /// if it's still busy submitting one solution when a newer one lands, it simply
    /// observes the newer value on its next `changed().await` and the older one is
    /// never separately queued.
    pub async fn subscribe(&self) -> watch::Receiver<Option<Solution>> {
        let (tx, rx) = watch::channel(None);
        self.inner.lock().await.subscribers.push(tx);
        rx
    }

    /// Sets `challenge` as current, cancels any workers tied to the previous challenge,
    /// and schedules fresh workers against the new one.
    pub async fn on_challenge(&self, challenge: Challenge, solutions_tx: mpsc::Sender<Solution>) {
        let mut inner = self.inner.lock().await;

        if inner.current.as_ref() == Some(&challenge) {
            return;
        }

        if let Some(prev_cancel) = inner.worker_cancel.take() {
            prev_cancel.cancel();
        }

        let worker_cancel = self.cancel.child_token();
        inner.current = Some(challenge.clone());
        inner.worker_cancel = Some(worker_cancel.clone());
        drop(inner);

        for cpu_id in 0..self.num_processors {
            worker::spawn_cpu_worker(
                cpu_id,
                challenge.clone(),
                self.public_address,
                worker_cancel.clone(),
                solutions_tx.clone(),
            );
        }

        // GPU entries use the same nonce-search routine, batched differently; see
        // the PoW worker module for the batch-size derivation.
        for gpu_id in 0..self.gpu_workers {
            worker::spawn_gpu_worker(
                gpu_id,
                challenge.clone(),
                self.public_address,
                worker_cancel.clone(),
                solutions_tx.clone(),
            );
        }

        tracing::info!(
            challenge_hash = ?challenge.challenge_hash,
            difficulty = %challenge.difficulty,
            cpu_workers = self.num_processors,
            gpu_workers = self.gpu_workers,
            "dispatched workers for new challenge"
        );
    }

    /// Forwards `solution` to every subscriber if its challenge is still current;
    /// otherwise discards it. A stale solution is never forwarded, even if it
    /// arrives before the manager has dispatched workers for the next challenge.
    pub async fn on_solution(&self, solution: Solution) {
        let (is_current, subscribers) = {
            let inner = self.inner.lock().await;
            let is_current = inner
                .current
                .as_ref()
                .is_some_and(|c| c.challenge_hash == solution.challenge_hash);
            (is_current, inner.subscribers.clone())
        };

        if !is_current {
            tracing::debug!(challenge_hash = ?solution.challenge_hash, "dropping solution for stale challenge");
            return;
        }

        for sub in &subscribers {
            // watch::send overwrites any unconsumed previous value; a Submitter still
            // busy with an older solution for this challenge will see the latest one
            // next time it checks, never a backlog.
            let _ = sub.send(Some(solution.clone()));
        }
    }

    /// Cancels all workers and marks the manager stopped. Subscriber channels are
    /// simply dropped by the caller; closing the fan-out here would require owning
    /// channel closing semantics the Submitters already handle on their own exit.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(c) = inner.worker_cancel.take() {
            c.cancel();
        }
        inner.current = None;
    }

    pub async fn current_challenge(&self) -> Option<Challenge> {
        self.inner.lock().await.current.clone()
    }
}

/// Drives the watch-channel -> MiningManager.on_challenge plumbing: whenever the
/// Tasker (or the currentVariables tracker repair path) publishes a new challenge,
/// forward it into the manager.
pub async fn run_challenge_feed(
    manager: MiningManager,
    mut rx: watch::Receiver<Option<Challenge>>,
    solutions_tx: mpsc::Sender<Solution>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
                if let Some(challenge) = rx.borrow_and_update().clone() {
                    manager.on_challenge(challenge, solutions_tx.clone()).await;
                }
            }
            _ = cancel.cancelled() => {
                manager.stop().await;
                return;
            }
        }
    }
}

/// Drains mined solutions off `rx` and feeds them into `manager.on_solution`. Workers
/// send every solution they find; staleness filtering happens inside `on_solution`,
/// not here, so this loop never needs to know the current challenge itself.
pub async fn run_solution_collector(
    manager: MiningManager,
    mut rx: mpsc::Receiver<Solution>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            solution = rx.recv() => {
                match solution {
                    Some(s) => manager.on_solution(s).await,
                    None => return,
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{H256, U256};

    fn sample_challenge(hash: u8) -> Challenge {
        Challenge {
            challenge_hash: H256::repeat_byte(hash),
            difficulty: U256::from(1),
            request_ids: [U256::from(1); 5],
            slot: 1,
            expiration: u64::MAX,
        }
    }

    #[tokio::test]
    async fn stale_solution_is_never_forwarded() {
        let cancel = CancellationToken::new();
        let manager = MiningManager::new(Address::zero(), 0, 0, cancel.clone());
        let mut sub_rx = manager.subscribe().await;

        let (work_tx, _work_rx) = mpsc::channel::<Solution>(4);
        manager.on_challenge(sample_challenge(1), work_tx.clone()).await;
        manager.on_challenge(sample_challenge(2), work_tx).await;
        sub_rx.borrow_and_update();

        let stale_solution = Solution {
            challenge_hash: sample_challenge(1).challenge_hash,
            nonce: "123".to_string(),
            difficulty: U256::from(1),
            request_ids: [U256::from(1); 5],
        };
        manager.on_solution(stale_solution).await;

        assert!(!sub_rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn current_solution_is_forwarded_to_subscribers() {
        let cancel = CancellationToken::new();
        let manager = MiningManager::new(Address::zero(), 0, 0, cancel.clone());
        let mut sub_rx = manager.subscribe().await;

        let (work_tx, _work_rx) = mpsc::channel::<Solution>(4);
        let challenge = sample_challenge(9);
        manager.on_challenge(challenge.clone(), work_tx).await;

        let solution = Solution {
            challenge_hash: challenge.challenge_hash,
            nonce: "42".to_string(),
            difficulty: U256::from(1),
            request_ids: [U256::from(1); 5],
        };
        manager.on_solution(solution.clone()).await;

        sub_rx.changed().await.unwrap();
        let received = sub_rx.borrow_and_update().clone().unwrap();
        assert_eq!(received.nonce, "42");
    }

    #[tokio::test]
    async fn at_most_one_current_challenge_after_several_emissions() {
        let cancel = CancellationToken::new();
        let manager = MiningManager::new(Address::zero(), 0, 0, cancel.clone());
        let (work_tx, _work_rx) = mpsc::channel::<Solution>(4);

        for i in 0..5u8 {
            manager.on_challenge(sample_challenge(i), work_tx.clone()).await;
        }

        let current = manager.current_challenge().await.unwrap();
        assert_eq!(current.challenge_hash, sample_challenge(4).challenge_hash);
    }
}
