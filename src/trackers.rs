//! Index/Tracker cache: named periodic pollers writing into the shared KV store.
//!
//! Trackers never block each other — the scheduler spawns one task per enabled tracker
//! and lets them run concurrently; KV writes are atomic per key, so no cross-tracker
//! coordination is needed. A tracker's failure is logged and ignored; the next cycle
//! retries from scratch.

use crate::config::Config;
use crate::contract::OracleContract;
use crate::kv::{IndexSample, IndexStore};
use crate::model::{now_unix, Account};
use async_trait::async_trait;
use ethers::providers::Middleware;
use eyre::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Common contract every tracker satisfies. The scheduler holds `Box<dyn Tracker>`
/// and never downcasts back to a concrete type.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Stable identifier, also used as the KV key-prefix for this tracker's writes.
    fn name(&self) -> &'static str;

    /// One poll cycle: read RPC/external data, write to the KV store.
    async fn exec(&self) -> Result<()>;
}

/// Runs every enabled tracker on its own task, sleeping `tracker_sleep_cycle` between
/// `exec` invocations, until `cancel` fires.
pub async fn run_scheduler(
    trackers: Vec<Box<dyn Tracker>>,
    sleep_cycle: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut handles = Vec::new();
    for tracker in trackers {
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_one(tracker, sleep_cycle, cancel).await;
        }));
    }
    for h in handles {
        let _ = h.await;
    }
}

async fn run_one(tracker: Box<dyn Tracker>, sleep_cycle: std::time::Duration, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        crate::metrics::TRACKER_CYCLES.inc();
        match tracker.exec().await {
            Ok(()) => tracing::debug!(tracker = tracker.name(), "tracker cycle ok"),
            Err(err) => {
                crate::metrics::TRACKER_FAILURES.inc();
                tracing::warn!(tracker = tracker.name(), error = %err, "tracker cycle failed; will retry");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(sleep_cycle) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

/// `balance` tracker: native-token balance per account, written to `balance/<addr>`.
pub struct BalanceTracker<M> {
    pub client: Arc<M>,
    pub store: IndexStore,
    pub accounts: Vec<Account>,
}

#[async_trait]
impl<M: Middleware + 'static> Tracker for BalanceTracker<M> {
    fn name(&self) -> &'static str {
        "balance"
    }

    async fn exec(&self) -> Result<()> {
        for account in &self.accounts {
            let balance = self
                .client
                .get_balance(account.address, None)
                .await
                .map_err(|e| eyre::eyre!("get_balance failed for {:?}: {e}", account.address))?;
            self.store
                .put_u256(&format!("balance/{:#x}", account.address), balance)?;
        }
        Ok(())
    }
}

/// `tributeBalance` tracker: oracle-token balance per account, written to `tribute_balance/<addr>`.
pub struct TributeBalanceTracker<M> {
    pub contract: OracleContract<M>,
    pub store: IndexStore,
    pub accounts: Vec<Account>,
}

#[async_trait]
impl<M: Middleware + 'static> Tracker for TributeBalanceTracker<M> {
    fn name(&self) -> &'static str {
        "tributeBalance"
    }

    async fn exec(&self) -> Result<()> {
        for account in &self.accounts {
            let balance = self
                .contract
                .balance_of(account.address)
                .call()
                .await
                .map_err(|e| eyre::eyre!("balanceOf failed for {:?}: {e}", account.address))?;
            self.store
                .put_u256(&format!("tribute_balance/{:#x}", account.address), balance)?;
        }
        Ok(())
    }
}

/// `gas` tracker: current suggested gas price, written to `gas`.
pub struct GasTracker<M> {
    pub client: Arc<M>,
    pub store: IndexStore,
}

#[async_trait]
impl<M: Middleware + 'static> Tracker for GasTracker<M> {
    fn name(&self) -> &'static str {
        "gas"
    }

    async fn exec(&self) -> Result<()> {
        let price = self
            .client
            .get_gas_price()
            .await
            .map_err(|e| eyre::eyre!("get_gas_price failed: {e}"))?;
        self.store.put_u256("gas", price)?;
        Ok(())
    }
}

/// `currentVariables` tracker: polls `getNewCurrentVariables()` and snapshots the
/// result into `current_challenge`/`current_requestIds`/`current_difficulty`/`current_slot`.
///
/// This is also the polling safety net the Tasker relies on to repair gaps across
/// subscription restarts: the MiningManager accepts a synthesized Challenge
/// built from a fresh read of these four keys.
pub struct CurrentVariablesTracker<M> {
    pub contract: OracleContract<M>,
    pub store: IndexStore,
}

#[async_trait]
impl<M: Middleware + 'static> Tracker for CurrentVariablesTracker<M> {
    fn name(&self) -> &'static str {
        "currentVariables"
    }

    async fn exec(&self) -> Result<()> {
        let (challenge, request_ids, difficulty, slot) = self
            .contract
            .get_new_current_variables()
            .call()
            .await
            .map_err(|e| eyre::eyre!("getNewCurrentVariables failed: {e}"))?;

        self.store.put_bytes("current_challenge", challenge.as_ref())?;
        self.store.put_json("current_requestIds", &request_ids.map(|v| v.to_string()))?;
        self.store.put_u256("current_difficulty", difficulty)?;
        self.store.put_u256("current_slot", slot)?;
        Ok(())
    }
}

/// `timeOut` tracker: per-feed last-value-age, written to `last_new_value_time/<reqId>`.
pub struct TimeoutTracker {
    pub store: IndexStore,
    pub request_ids: Vec<ethers::types::U256>,
}

#[async_trait]
impl Tracker for TimeoutTracker {
    fn name(&self) -> &'static str {
        "timeOut"
    }

    async fn exec(&self) -> Result<()> {
        let now = now_unix();
        for id in &self.request_ids {
            self.store
                .put_bytes(&format!("last_new_value_time/{id}"), now.to_string().as_bytes())?;
        }
        Ok(())
    }
}

/// `disputeStatus` tracker: whether each account is currently disputed, written to
/// `dispute_status/<addr>`.
pub struct DisputeStatusTracker<M> {
    pub contract: OracleContract<M>,
    pub store: IndexStore,
    pub accounts: Vec<Account>,
}

#[async_trait]
impl<M: Middleware + 'static> Tracker for DisputeStatusTracker<M> {
    fn name(&self) -> &'static str {
        "disputeStatus"
    }

    async fn exec(&self) -> Result<()> {
        for account in &self.accounts {
            // Staking status is surfaced via getUintVar in the real contract; we treat
            // a nonzero "disputed" flag the same way the stake-status reads do.
            let key = ethers::utils::keccak256(format!("_STAKE_STATUS_{:#x}", account.address));
            let status = self
                .contract
                .get_uint_var(key.into())
                .call()
                .await
                .map_err(|e| eyre::eyre!("getUintVar(stake status) failed: {e}"))?;
            let disputed = status == ethers::types::U256::from(3u8); // 3 == disputed, by contract convention
            self.store
                .put_bool(&format!("dispute_status/{:#x}", account.address), disputed)?;
        }
        Ok(())
    }
}

/// `indexers` tracker: aggregated current value for each subscribed data feed.
/// Writes the literal current value to `index/<feedId>` as the hex-big-int the
/// `IndexEntry` data model describes (§3) — this is what the Submitter reads
/// verbatim and submits on-chain, unconverted. Separately keeps a confidence-weighted
/// history under `index_history/<feedId>/...` for the dispute checker's point-in-time
/// lookups; that history is never read by the Submitter.
///
/// The actual price/index aggregation (fetching from external price sources and
/// computing a confidence-weighted median) is external collaborator territory per
/// the purpose & scope section; this tracker's job is solely to land whatever the
/// collaborator produced into the KV store under the documented key scheme.
pub struct IndexersTracker<F> {
    pub store: IndexStore,
    pub feed_ids: Vec<String>,
    pub fetch_feed_value: F,
}

#[async_trait]
impl<F> Tracker for IndexersTracker<F>
where
    F: Fn(&str) -> Result<(f64, f64)> + Send + Sync,
{
    fn name(&self) -> &'static str {
        "indexers"
    }

    async fn exec(&self) -> Result<()> {
        let now = now_unix();
        for feed_id in &self.feed_ids {
            let (value, confidence) = (self.fetch_feed_value)(feed_id)?;
            self.store.push_index_sample(
                feed_id,
                IndexSample { value, confidence, observed_at: now },
            )?;
            self.store.put_index_value(feed_id, float_to_index_value(value))?;
        }
        Ok(())
    }
}

/// The collaborator already hands back the feed value in the same integer unit the
/// contract expects (the aggregation/unit convention lives with that external
/// collaborator, out of scope here); this only rounds to the nearest integer and
/// guards against a negative or non-finite read rather than submitting garbage.
fn float_to_index_value(value: f64) -> ethers::types::U256 {
    if !value.is_finite() || value < 0.0 {
        return ethers::types::U256::zero();
    }
    if value >= u128::MAX as f64 {
        return ethers::types::U256::from(u128::MAX);
    }
    ethers::types::U256::from(value.round() as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_store() -> IndexStore {
        let mut p = std::env::temp_dir();
        p.push(format!("oracle_miner_tracker_test_{}_{}", std::process::id(), rand::random::<u64>()));
        IndexStore::open(p).unwrap()
    }

    #[tokio::test]
    async fn indexers_tracker_writes_samples_for_every_feed() {
        let store = tmp_store();
        let tracker = IndexersTracker {
            store: store.clone(),
            feed_ids: vec!["1".to_string(), "2".to_string()],
            fetch_feed_value: |_feed_id: &str| -> Result<(f64, f64)> { Ok((42.0, 0.9)) },
        };
        tracker.exec().await.unwrap();
        assert_eq!(store.latest_index_sample("1").unwrap().unwrap().value, 42.0);
        assert_eq!(store.latest_index_sample("2").unwrap().unwrap().confidence, 0.9);
        assert_eq!(store.get_index_value("1").unwrap(), Some(ethers::types::U256::from(42)));
    }

    #[test]
    fn float_index_values_round_and_clamp_negatives_to_zero() {
        assert_eq!(float_to_index_value(-1.0), ethers::types::U256::zero());
        assert_eq!(float_to_index_value(41.6), ethers::types::U256::from(42));
    }

    #[tokio::test]
    async fn timeout_tracker_writes_a_timestamp_per_request_id() {
        let store = tmp_store();
        let tracker = TimeoutTracker {
            store: store.clone(),
            request_ids: vec![ethers::types::U256::from(1), ethers::types::U256::from(2)],
        };
        tracker.exec().await.unwrap();
        assert!(store.get_bytes("last_new_value_time/1").unwrap().is_some());
        assert!(store.get_bytes("last_new_value_time/2").unwrap().is_some());
    }
}
