//! Dispute Checker: an offline verifier that scans mined submissions after
//! the fact and flags ones whose submitted value looks implausible against the
//! index's own history.
//!
//! Disabled by default (`enabled_trackers.dispute_checker`) because it writes report
//! files to the working directory as a side effect.

use crate::contract::{nonce_submitted_topic0, NonceSubmittedFilter};
use crate::kv::IndexStore;
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber, Filter, H256, U256};
use eyre::{eyre, Result};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Blocks held back from the scan window to stay clear of reorg risk.
const BLOCK_DELAY: u64 = 100;

pub struct DisputeChecker<M> {
    pub client: std::sync::Arc<M>,
    pub contract_address: Address,
    pub store: IndexStore,
    pub dispute_time_delta: Duration,
    pub dispute_threshold: f64,
    pub report_dir: std::path::PathBuf,
    pub last_checked_block: u64,
}

impl<M: Middleware + 'static> DisputeChecker<M> {
    /// Runs one cycle: may be a no-op if we're still inside the reorg-risk window.
    pub async fn run_once(&mut self) -> Result<()> {
        let head = self
            .client
            .get_block_number()
            .await
            .map_err(|e| eyre!("get_block_number failed: {e}"))?
            .as_u64();

        // Gated on the raw chain head, not `head - BLOCK_DELAY`: a cycle only runs once
        // at least `BLOCK_DELAY` blocks have passed since the last one, independent of
        // the reorg-safety margin subtracted below.
        if not_enough_new_blocks(head, self.last_checked_block, BLOCK_DELAY) {
            tracing::debug!(head, last_checked = self.last_checked_block, "not enough new blocks yet; skipping cycle");
            return Ok(());
        }

        let check_until = head.saturating_sub(BLOCK_DELAY);

        let filter = Filter::new()
            .address(self.contract_address)
            .topic0(nonce_submitted_topic0())
            .from_block(BlockNumber::Number(self.last_checked_block.into()))
            .to_block(BlockNumber::Number(check_until.into()));

        let logs = self
            .client
            .get_logs(&filter)
            .await
            .map_err(|e| eyre!("get_logs failed scanning for NonceSubmitted: {e}"))?;

        for log in &logs {
            let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(check_until);
            let block_time = self.block_time(block_number).await?;
            let decoded: NonceSubmittedFilter = ethers::contract::EthLogDecode::decode_log(&log.clone().into())
                .map_err(|e| eyre!("failed to decode NonceSubmitted log: {e}"))?;

            for (request_id, submitted_value) in decoded.request_id.iter().zip(decoded.value.iter()) {
                self.check_submission(*request_id, *submitted_value, decoded.miner, block_time)?;
            }
        }

        self.last_checked_block = check_until;
        Ok(())
    }

    async fn block_time(&self, block_number: u64) -> Result<u64> {
        let block = self
            .client
            .get_block(block_number)
            .await
            .map_err(|e| eyre!("get_block failed: {e}"))?
            .ok_or_else(|| eyre!("block {block_number} not found"))?;
        Ok(block.timestamp.as_u64())
    }

    /// Checks one `(request_id, value)` pair from a submission against the index's
    /// historical samples around the block time; writes a report file if suspect.
    fn check_submission(
        &self,
        request_id: U256,
        submitted_value: U256,
        miner: Address,
        block_time: u64,
    ) -> Result<()> {
        let half_window = self.dispute_time_delta.as_secs() / 5;
        let feed_id = request_id.to_string();

        let mut samples = Vec::new();
        for k in 0..5i64 {
            let offset = (k - 2) * half_window as i64;
            let t_k = (block_time as i64 + offset).max(0) as u64;
            if let Some(sample) = self.store.index_sample_near(&feed_id, t_k)? {
                if sample.confidence > 0.8 {
                    samples.push((t_k, sample));
                }
            }
        }

        if samples.is_empty() {
            tracing::debug!(request_id = %request_id, "no confident samples near submission time; no data to compare");
            return Ok(());
        }

        let min = samples.iter().map(|(_, s)| s.value).fold(f64::INFINITY, f64::min)
            * (1.0 - self.dispute_threshold);
        let max = samples.iter().map(|(_, s)| s.value).fold(f64::NEG_INFINITY, f64::max)
            * (1.0 + self.dispute_threshold);

        let submitted_as_float = fixed_point_to_float(submitted_value);
        let floored = submitted_as_float.floor();

        if floored <= min || floored >= max {
            self.write_report(request_id, miner, block_time, submitted_as_float, min, max, &samples)?;
        }

        Ok(())
    }

    fn write_report(
        &self,
        request_id: U256,
        miner: Address,
        block_time: u64,
        submitted_value: f64,
        min: f64,
        max: f64,
        samples: &[(u64, crate::kv::IndexSample)],
    ) -> Result<()> {
        std::fs::create_dir_all(&self.report_dir)
            .map_err(|e| eyre!("failed to create dispute report directory: {e}"))?;

        let mut body = String::new();
        body.push_str(&format!("possible dispute at block_time={block_time}\n"));
        body.push_str(&format!("request_id={request_id}\n"));
        body.push_str(&format!("miner={:#x}\n", miner));
        body.push_str(&format!("submitted_value={submitted_value}\n"));
        body.push_str(&format!("expected_range=({min}, {max})\n"));
        body.push_str("nearest samples:\n");
        for (t_k, sample) in samples {
            let offset = *t_k as i64 - block_time as i64;
            body.push_str(&format!(
                "  t={} (offset={}s) value={} confidence={}\n",
                sample.observed_at, offset, sample.value, sample.confidence
            ));
        }

        let path: std::path::PathBuf = Path::new(&self.report_dir).join(format!("possible-dispute-{block_time}.txt"));
        std::fs::write(&path, body).map_err(|e| eyre!("failed to write dispute report {}: {e}", path.display()))?;
        tracing::warn!(request_id = %request_id, miner = ?miner, path = %path.display(), "wrote possible-dispute report");
        Ok(())
    }
}

/// True once fewer than `block_delay` blocks have passed since the last cycle,
/// measured off the raw chain head — not off `head - block_delay`, which would
/// silently double the required gap.
fn not_enough_new_blocks(head: u64, last_checked_block: u64, block_delay: u64) -> bool {
    head.saturating_sub(last_checked_block) < block_delay
}

/// Converts the on-chain submitted integer to a float for comparison against the
/// index's float-valued samples.
fn fixed_point_to_float(value: U256) -> f64 {
    let as_u128: u128 = value.try_into().unwrap_or(u128::MAX);
    as_u128 as f64 / 1e18
}

/// Runs the checker on a `tracker_sleep_cycle` cadence until `cancel` fires.
pub async fn run<M: Middleware + 'static>(
    mut checker: DisputeChecker<M>,
    sleep_cycle: Duration,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(err) = checker.run_once().await {
            tracing::warn!(error = %err, "dispute checker cycle failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(sleep_cycle) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{Http, Provider};

    #[test]
    fn fixed_point_round_trips_through_the_1e18_scale() {
        let value = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(fixed_point_to_float(value), 1.5);
    }

    /// Gate is measured off the raw head, not `head - BLOCK_DELAY`: exactly 100 blocks
    /// since the last check is enough to run, 99 is not.
    #[test]
    fn gate_measures_off_the_raw_head_not_check_until() {
        assert!(not_enough_new_blocks(1_099, 1_000, BLOCK_DELAY));
        assert!(!not_enough_new_blocks(1_100, 1_000, BLOCK_DELAY));
        assert!(!not_enough_new_blocks(1_200, 1_000, BLOCK_DELAY));
    }

    fn tmp_store() -> IndexStore {
        let mut p = std::env::temp_dir();
        p.push(format!("oracle_miner_dispute_test_{}_{}", std::process::id(), rand::random::<u64>()));
        IndexStore::open(p).unwrap()
    }

    fn checker_with_constant_index(value: f64, threshold: f64) -> (DisputeChecker<Provider<Http>>, std::path::PathBuf) {
        let store = tmp_store();
        store
            .push_index_sample(
                "1",
                crate::kv::IndexSample { value, confidence: 1.0, observed_at: 1_000 },
            )
            .unwrap();
        let mut report_dir = std::env::temp_dir();
        report_dir.push(format!("oracle_miner_dispute_reports_{}_{}", std::process::id(), rand::random::<u64>()));
        let client = std::sync::Arc::new(Provider::<Http>::try_from("http://localhost:8545").unwrap());
        (
            DisputeChecker {
                client,
                contract_address: Address::zero(),
                store,
                dispute_time_delta: Duration::from_secs(300),
                dispute_threshold: threshold,
                report_dir: report_dir.clone(),
                last_checked_block: 0,
            },
            report_dir,
        )
    }

    #[test]
    fn value_within_threshold_is_not_flagged() {
        let (checker, report_dir) = checker_with_constant_index(100.0, 0.01);
        checker
            .check_submission(U256::from(1), U256::from(100_500_000_000_000_000_000u128), Address::zero(), 1_000)
            .unwrap();
        assert!(!report_dir.exists() || std::fs::read_dir(&report_dir).unwrap().next().is_none());
    }

    #[test]
    fn value_outside_threshold_is_flagged_with_a_report_file() {
        let (checker, report_dir) = checker_with_constant_index(100.0, 0.01);
        checker
            .check_submission(U256::from(1), U256::from(102_000_000_000_000_000_000u128), Address::zero(), 1_000)
            .unwrap();
        let entries: Vec<_> = std::fs::read_dir(&report_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let body = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert!(body.contains("submitted_value=102"));
        assert!(body.contains("request_id=1"));
    }

    #[test]
    fn no_confident_samples_means_no_report() {
        let store = tmp_store();
        store
            .push_index_sample("1", crate::kv::IndexSample { value: 100.0, confidence: 0.1, observed_at: 1_000 })
            .unwrap();
        let mut report_dir = std::env::temp_dir();
        report_dir.push(format!("oracle_miner_dispute_reports_{}_{}", std::process::id(), rand::random::<u64>()));
        let client = std::sync::Arc::new(Provider::<Http>::try_from("http://localhost:8545").unwrap());
        let checker = DisputeChecker {
            client,
            contract_address: Address::zero(),
            store,
            dispute_time_delta: Duration::from_secs(300),
            dispute_threshold: 0.01,
            report_dir: report_dir.clone(),
            last_checked_block: 0,
        };
        checker.check_submission(U256::from(1), U256::from(102), Address::zero(), 1_000).unwrap();
        assert!(!report_dir.exists());
    }
}
