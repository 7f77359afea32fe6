//! Tasker: subscribes to the contract's challenge-announced event and emits
//! normalized `Challenge`s to the Mining Manager over a lossy, latest-wins channel.
//!
//! A `tokio::sync::watch` channel gives exactly the ordered, lossy delivery this
//! needs: a slow consumer only ever observes the most recent challenge, never a
//! backlog of stale ones.

use crate::contract::OracleContract;
use crate::error::CoreError;
use crate::kv::IndexStore;
use crate::model::{now_unix, Challenge};
use ethers::providers::{Middleware, PubsubClient};
use ethers::types::{H256, U256};
use eyre::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How long a freshly emitted challenge is considered current for, absent any other
/// signal. The real expiration comes from the contract round timing; this is a
/// conservative upper bound used only if a round never resolves.
const CHALLENGE_TTL_SECS: u64 = 10 * 60;

pub fn channel() -> (watch::Sender<Option<Challenge>>, watch::Receiver<Option<Challenge>>) {
    watch::channel(None)
}

/// Runs the subscribe/resubscribe loop until `cancel` fires. On subscription error,
/// waits `backoff` then retries in an unbounded loop with a one-second tick so the
/// cancellation token is observed promptly even mid-backoff.
pub async fn run<M>(
    contract: OracleContract<M>,
    tx: watch::Sender<Option<Challenge>>,
    backoff: Duration,
    cancel: CancellationToken,
) where
    M: Middleware + 'static,
    M::Provider: PubsubClient,
{
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match subscribe_once(&contract, &tx, &cancel).await {
            Ok(()) => {
                // Subscription ended cleanly (stream closed); resubscribe immediately.
                tracing::warn!("challenge subscription stream ended; resubscribing");
            }
            Err(err) => {
                tracing::warn!(error = %err, backoff_s = backoff.as_secs(), "challenge subscription failed; backing off");
                if !sleep_cancellable(backoff, &cancel).await {
                    return;
                }
            }
        }
    }
}

async fn subscribe_once<M>(
    contract: &OracleContract<M>,
    tx: &watch::Sender<Option<Challenge>>,
    cancel: &CancellationToken,
) -> Result<()>
where
    M: Middleware + 'static,
    M::Provider: PubsubClient,
{
    let event = contract.event::<NewChallengeEvent>();
    let mut stream = event.subscribe().await?;

    loop {
        tokio::select! {
            next = futures::StreamExt::next(&mut stream) => {
                match next {
                    Some(Ok(log)) => {
                        let challenge = build_challenge(&log);
                        crate::metrics::CHALLENGES_SEEN.inc();
                        // watch::send never blocks; an un-consumed previous value is
                        // simply overwritten, i.e. latest-unemitted-value-wins.
                        let _ = tx.send(Some(challenge));
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "error decoding challenge event; skipping");
                    }
                    None => return Ok(()),
                }
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

fn build_challenge(event: &NewChallengeEvent) -> Challenge {
    Challenge {
        challenge_hash: H256::from(event.current_challenge),
        difficulty: event.difficulty,
        request_ids: event.current_request_id,
        slot: 1,
        expiration: now_unix() + CHALLENGE_TTL_SECS,
    }
}

/// Builds a `Challenge` from a fresh `getNewCurrentVariables()` read, the same shape
/// the `currentVariables` tracker writes to the KV store. Used by the Mining Manager
/// to repair gaps across Tasker resubscribe boundaries.
pub fn synthesize_from_current_variables(
    challenge_hash: H256,
    request_ids: [U256; 5],
    difficulty: U256,
    slot: U256,
) -> Challenge {
    Challenge {
        challenge_hash,
        difficulty,
        request_ids,
        slot: slot.low_u32() as u8,
        expiration: now_unix() + CHALLENGE_TTL_SECS,
    }
}

/// Polls the `current_challenge`/`current_requestIds`/`current_difficulty`/`current_slot`
/// snapshot the `currentVariables` tracker maintains and republishes it on `tx` whenever
/// it names a different challenge than last seen. This is the polling safety net that
/// repairs gaps left by a flapping event subscription: `MiningManager::on_challenge`
/// already no-ops on a repeated hash, so republishing the same snapshot every cycle is
/// harmless, and a hash the Tasker missed gets picked up within one `tracker_sleep_cycle`.
pub async fn run_kv_repair(
    store: IndexStore,
    tx: watch::Sender<Option<Challenge>>,
    sleep_cycle: Duration,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match read_current_variables(&store) {
            Ok(Some(challenge)) => {
                let _ = tx.send(Some(challenge));
            }
            Ok(None) => {}
            Err(CoreError::DataStale(reason)) => {
                tracing::warn!(%reason, "currentVariables snapshot is stale; not republishing");
            }
            Err(err) => {
                tracing::debug!(error = %err, "currentVariables snapshot not ready yet");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(sleep_cycle) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

fn read_current_variables(store: &IndexStore) -> Result<Option<Challenge>, CoreError> {
    let to_stale = |e: eyre::Report| CoreError::DataStale(e.to_string());

    let challenge_bytes = match store.get_bytes("current_challenge").map_err(to_stale)? {
        Some(b) if b.len() == 32 => b,
        Some(_) => return Err(CoreError::DataStale("current_challenge has the wrong length".into())),
        None => return Ok(None),
    };
    let request_ids: Option<[String; 5]> = store.get_json("current_requestIds").map_err(to_stale)?;
    let request_ids = match request_ids {
        Some(ids) => ids,
        None => return Ok(None),
    };
    let difficulty = match store.get_u256("current_difficulty").map_err(to_stale)? {
        Some(d) => d,
        None => return Ok(None),
    };
    let slot = match store.get_u256("current_slot").map_err(to_stale)? {
        Some(s) => s,
        None => return Ok(None),
    };

    if difficulty.is_zero() {
        // The tracker has written a snapshot from before the first round started, or
        // from a round the contract has since torn down; there is no live challenge
        // to mine against until the next write replaces it.
        return Err(CoreError::DataStale("current_difficulty is zero".into()));
    }

    let mut parsed_ids = [U256::zero(); 5];
    for (dst, src) in parsed_ids.iter_mut().zip(request_ids.iter()) {
        *dst = U256::from_dec_str(src)
            .map_err(|e| CoreError::DataStale(format!("bad request id '{src}': {e}")))?;
    }

    Ok(Some(synthesize_from_current_variables(
        H256::from_slice(&challenge_bytes),
        parsed_ids,
        difficulty,
        slot,
    )))
}

async fn sleep_cancellable(dur: Duration, cancel: &CancellationToken) -> bool {
    // One-second tick so cancellation is observed promptly even mid-backoff,
    // matching the "unbounded loop with a one-second tick" resubscribe policy.
    let mut remaining = dur;
    let tick = Duration::from_secs(1);
    while remaining > Duration::ZERO {
        let step = remaining.min(tick);
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = cancel.cancelled() => return false,
        }
        remaining = remaining.saturating_sub(step);
    }
    true
}

// Re-exported from the abigen! macro in `contract`; aliased here for readability.
use crate::contract::NewChallengeFilter as NewChallengeEvent;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_challenge_carries_the_given_hash_and_slot() {
        let hash = H256::repeat_byte(0xAB);
        let c = synthesize_from_current_variables(hash, [U256::from(1); 5], U256::from(7), U256::from(3));
        assert_eq!(c.challenge_hash, hash);
        assert_eq!(c.slot, 3);
        assert_eq!(c.difficulty, U256::from(7));
    }

    fn tmp_store() -> IndexStore {
        let mut p = std::env::temp_dir();
        p.push(format!("oracle_miner_tasker_test_{}_{}", std::process::id(), rand::random::<u64>()));
        IndexStore::open(p).unwrap()
    }

    #[test]
    fn missing_snapshot_reads_as_no_challenge_not_an_error() {
        let store = tmp_store();
        assert!(read_current_variables(&store).unwrap().is_none());
    }

    #[test]
    fn zero_difficulty_snapshot_is_reported_as_stale() {
        let store = tmp_store();
        store.put_bytes("current_challenge", H256::repeat_byte(1).as_bytes()).unwrap();
        store.put_json("current_requestIds", &["1", "2", "3", "4", "5"]).unwrap();
        store.put_u256("current_difficulty", U256::zero()).unwrap();
        store.put_u256("current_slot", U256::from(1)).unwrap();

        let err = read_current_variables(&store).unwrap_err();
        assert!(matches!(err, CoreError::DataStale(_)));
    }

    #[test]
    fn complete_nonzero_snapshot_synthesizes_a_challenge() {
        let store = tmp_store();
        store.put_bytes("current_challenge", H256::repeat_byte(2).as_bytes()).unwrap();
        store.put_json("current_requestIds", &["1", "2", "3", "4", "5"]).unwrap();
        store.put_u256("current_difficulty", U256::from(42)).unwrap();
        store.put_u256("current_slot", U256::from(2)).unwrap();

        let challenge = read_current_variables(&store).unwrap().unwrap();
        assert_eq!(challenge.difficulty, U256::from(42));
        assert_eq!(challenge.slot, 2);
    }
}
