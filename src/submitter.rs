//! Submitter: one per account. Consumes mined solutions for that account's
//! challenge subscription, reads the freshest indexed values and dispute status out
//! of the KV store, and hands a fully-formed `SubmitJob` to the Transactor.
//!
//! A Submitter never retries on its own — retry/backoff is entirely the Transactor's
//! job. This keeps the Submitter a pure translation step: solution + KV state in,
//! one `transact` call out.

use crate::error::CoreError;
use crate::kv::IndexStore;
use crate::model::{Account, Solution, SubmitJob};
use ethers::types::U256;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Drives one account's solution -> submit-job pipeline until `cancel` fires or the
/// upstream MiningManager channel closes.
pub async fn run<F, Fut>(
    account: Account,
    store: IndexStore,
    mut solutions: watch::Receiver<Option<Solution>>,
    cancel: CancellationToken,
    mut submit: F,
) where
    F: FnMut(Account, SubmitJob) -> Fut,
    Fut: std::future::Future<Output = eyre::Result<()>>,
{
    loop {
        tokio::select! {
            changed = solutions.changed() => {
                if changed.is_err() {
                    return;
                }
                let solution = match solutions.borrow_and_update().clone() {
                    Some(s) => s,
                    None => continue,
                };
                if is_disputed(&store, &account) {
                    tracing::warn!(account = ?account.address, "account is disputed; skipping submission");
                    continue;
                }
                match build_submit_job(&store, solution) {
                    Ok(job) => {
                        if let Err(err) = submit(account.clone(), job).await {
                            tracing::warn!(account = ?account.address, error = %err, "submit failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(account = ?account.address, error = %err, "could not assemble submit job; dropping solution");
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Reads `index/<reqId>` for each of the solution's five request ids and pairs them
/// with the solution into a `SubmitJob`. A missing index entry is fatal for this job
/// (per-feed values must all be fresh enough to submit); the caller drops the job
/// rather than submitting partial/zeroed values.
///
/// `index/<reqId>` is read verbatim as the hex-big-int the `IndexEntry` data model
/// describes (§3) — no unit conversion happens here; whatever integer a tracker last
/// wrote for a feed is exactly what gets submitted on-chain.
fn build_submit_job(store: &IndexStore, solution: Solution) -> Result<SubmitJob, CoreError> {
    let mut request_values = [U256::zero(); 5];
    for (i, request_id) in solution.request_ids.iter().enumerate() {
        let value = store
            .get_index_value(&request_id.to_string())
            .map_err(|e| CoreError::RpcTransient(e.to_string()))?
            .ok_or_else(|| CoreError::IndexMissing {
                request_id: request_id.to_string(),
            })?;
        request_values[i] = value;
    }
    Ok(SubmitJob { solution, request_values })
}

/// Whether `status` reflects this account as currently disputed, read from
/// `dispute_status/<addr>`. A missing entry is treated as "not disputed" — the
/// tracker that populates it hasn't run yet, which is not itself a submit blocker.
pub fn is_disputed(store: &IndexStore, account: &Account) -> bool {
    store
        .get_bool(&format!("dispute_status/{:#x}", account.address))
        .ok()
        .flatten()
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    fn tmp_store() -> IndexStore {
        let mut p = std::env::temp_dir();
        p.push(format!("oracle_miner_submitter_test_{}_{}", std::process::id(), rand::random::<u64>()));
        IndexStore::open(p).unwrap()
    }

    fn solution() -> Solution {
        Solution {
            challenge_hash: H256::repeat_byte(1),
            nonce: "5".to_string(),
            difficulty: U256::from(1),
            request_ids: [
                U256::from(1),
                U256::from(2),
                U256::from(3),
                U256::from(4),
                U256::from(5),
            ],
        }
    }

    #[test]
    fn missing_index_entry_is_a_hard_error() {
        let store = tmp_store();
        let err = build_submit_job(&store, solution()).unwrap_err();
        assert!(matches!(err, CoreError::IndexMissing { .. }));
    }

    #[test]
    fn fully_populated_index_yields_a_submit_job() {
        let store = tmp_store();
        for id in 1..=5u64 {
            store.put_index_value(&id.to_string(), U256::from(1)).unwrap();
        }
        let job = build_submit_job(&store, solution()).unwrap();
        assert_eq!(job.request_values, [U256::from(1); 5]);
    }

    /// Happy-path mining scenario: `index/1..5 = "0x1"`, `gas = "0x1"` must yield
    /// `vals=[1,1,1,1,1]` verbatim, with no unit conversion applied anywhere in between.
    #[test]
    fn literal_hex_bigint_values_pass_through_unscaled() {
        let store = tmp_store();
        for id in 1..=5u64 {
            store.put_bytes(&format!("index/{id}"), b"0x1").unwrap();
        }
        let job = build_submit_job(&store, solution()).unwrap();
        assert_eq!(job.request_values, [U256::one(); 5]);
    }

    #[test]
    fn disputed_account_reads_true_once_flagged() {
        let store = tmp_store();
        let account = Account::new(
            "0000000000000000000000000000000000000000000000000000000000000001"
                .parse()
                .unwrap(),
            0,
        );
        assert!(!is_disputed(&store, &account));
        store
            .put_bool(&format!("dispute_status/{:#x}", account.address), true)
            .unwrap();
        assert!(is_disputed(&store, &account));
    }
}
