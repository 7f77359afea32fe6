//! PoW workers: each worker is an OS thread that searches nonces against a
//! fixed `Challenge` until it finds one passing the difficulty target or is cancelled.
//!
//! Nonce search runs on blocking OS threads, not async tasks — hashing is CPU-bound
//! and must not starve the tokio runtime's I/O workers. Cancellation is observed once
//! per batch, the same granularity the difficulty-target check happens at, so a worker
//! never runs more than one batch past a cancel signal.

use crate::model::{Challenge, Solution};
use ethers::types::{Address, U256};
use ethers::utils::keccak256;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Nonces tried per difficulty check. Large enough to amortize the cancellation check,
/// small enough that a stale challenge doesn't burn more than a fraction of a second
/// of extra work past its cancellation.
const BATCH_SIZE: u64 = 4096;

pub fn spawn_cpu_worker(
    worker_id: usize,
    challenge: Challenge,
    public_address: Address,
    cancel: CancellationToken,
    solutions_tx: mpsc::Sender<Solution>,
) {
    std::thread::spawn(move || {
        search(worker_id, "cpu", &challenge, public_address, &cancel, &solutions_tx, BATCH_SIZE);
    });
}

/// GPU entries are modeled as wider CPU batches rather than actual device dispatch —
/// an OpenCL/CUDA backend is out of scope (Non-goals); this keeps the worker-count and
/// cancellation contract identical for both entry kinds.
pub fn spawn_gpu_worker(
    worker_id: usize,
    challenge: Challenge,
    public_address: Address,
    cancel: CancellationToken,
    solutions_tx: mpsc::Sender<Solution>,
) {
    std::thread::spawn(move || {
        search(worker_id, "gpu", &challenge, public_address, &cancel, &solutions_tx, BATCH_SIZE * 16);
    });
}

fn search(
    worker_id: usize,
    kind: &'static str,
    challenge: &Challenge,
    public_address: Address,
    cancel: &CancellationToken,
    solutions_tx: &mpsc::Sender<Solution>,
    batch_size: u64,
) {
    let target = match difficulty_target(challenge.difficulty) {
        Some(t) => t,
        None => {
            tracing::warn!(worker_id, kind, "zero difficulty; worker exiting without searching");
            return;
        }
    };

    let mut nonce: u64 = rand::thread_rng().gen();
    let mut hashes_this_report = 0u64;
    let mut last_report = std::time::Instant::now();

    loop {
        if cancel.is_cancelled() {
            return;
        }

        for _ in 0..batch_size {
            let nonce_str = nonce.to_string();
            let digest = hash_nonce(&challenge.challenge_hash.0, &public_address, nonce_str.as_bytes());
            hashes_this_report += 1;

            if U256::from_big_endian(&digest) < target {
                let solution = Solution {
                    challenge_hash: challenge.challenge_hash,
                    nonce: nonce_str,
                    difficulty: challenge.difficulty,
                    request_ids: challenge.request_ids,
                };
                tracing::info!(worker_id, kind, nonce = %solution.nonce, "found a passing nonce");
                crate::metrics::SOLUTIONS_FOUND.inc();
                let _ = solutions_tx.blocking_send(solution);
                return;
            }

            nonce = nonce.wrapping_add(1);
        }

        if last_report.elapsed() > std::time::Duration::from_secs(10) {
            tracing::debug!(
                worker_id,
                kind,
                hashes = hashes_this_report,
                per_sec = hashes_this_report / 10,
                "worker hashrate"
            );
            hashes_this_report = 0;
            last_report = std::time::Instant::now();
        }
    }
}

/// `H(challenge_hash ‖ public_address ‖ nonce)`, keccak256 over the concatenated bytes.
fn hash_nonce(challenge_hash: &[u8; 32], public_address: &Address, nonce_ascii: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(32 + 20 + nonce_ascii.len());
    buf.extend_from_slice(challenge_hash);
    buf.extend_from_slice(public_address.as_bytes());
    buf.extend_from_slice(nonce_ascii);
    keccak256(buf)
}

/// `2^256 / difficulty`, clamped to `U256::MAX` for difficulty 0 callers (who should
/// never reach here — checked in `search`) and saturating rather than panicking for
/// difficulty 1, where the quotient would otherwise overflow the U256 representation
/// of 2^256.
fn difficulty_target(difficulty: U256) -> Option<U256> {
    if difficulty.is_zero() {
        return None;
    }
    if difficulty == U256::one() {
        return Some(U256::MAX);
    }
    // 2^256 isn't representable in U256; (2^256 - 1) / difficulty is the off-by-one-ulp
    // equivalent everywhere it matters for a PoW threshold comparison.
    Some(U256::MAX / difficulty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    #[test]
    fn difficulty_one_targets_max_u256() {
        assert_eq!(difficulty_target(U256::one()), Some(U256::MAX));
    }

    #[test]
    fn zero_difficulty_has_no_target() {
        assert_eq!(difficulty_target(U256::zero()), None);
    }

    #[test]
    fn higher_difficulty_yields_a_tighter_target() {
        let easy = difficulty_target(U256::from(10)).unwrap();
        let hard = difficulty_target(U256::from(10_000)).unwrap();
        assert!(hard < easy);
    }

    #[test]
    fn hash_nonce_is_deterministic_for_the_same_inputs() {
        let challenge_hash = H256::repeat_byte(1).0;
        let addr = Address::repeat_byte(2);
        let a = hash_nonce(&challenge_hash, &addr, b"7");
        let b = hash_nonce(&challenge_hash, &addr, b"7");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_nonce_changes_with_the_nonce() {
        let challenge_hash = H256::repeat_byte(1).0;
        let addr = Address::repeat_byte(2);
        let a = hash_nonce(&challenge_hash, &addr, b"7");
        let b = hash_nonce(&challenge_hash, &addr, b"8");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn search_emits_exactly_one_solution_then_stops() {
        let challenge = Challenge {
            challenge_hash: H256::repeat_byte(3),
            difficulty: U256::one(), // every nonce passes; any target yields a hit on the first try
            request_ids: [U256::from(1); 5],
            slot: 1,
            expiration: u64::MAX,
        };
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let address = Address::repeat_byte(9);

        tokio::task::spawn_blocking(move || {
            search(0, "cpu", &challenge, address, &cancel, &tx, 1);
        })
        .await
        .unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none(), "worker must exit after its first solution");
    }
}
