//! Transactor: the only component that calls `eth_sendRawTransaction`.
//!
//! Owns the full gas-pricing/nonce-retry state machine so every other component can
//! treat "submit this call" as a single fallible async call. State progression:
//! `Preparing -> Signing -> Broadcasting -> {Retriable -> Preparing} | {Confirming ->
//! {Succeeded | ReceiptBad}} | {Fatal -> return}`.

use crate::config::Config;
use crate::error::CoreError;
use crate::kv::IndexStore;
use ethers::middleware::SignerMiddleware;
use ethers::providers::Middleware;
use ethers::types::{Address, TransactionReceipt, TransactionRequest, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed gas limit for every `submitMiningSolution` call; the contract call itself
/// never varies enough to warrant per-call estimation on the hot submission path
/// (estimation is still available separately for operational tooling, see
/// `estimate_gas`).
const GAS_LIMIT: u64 = 3_000_000;

/// Total attempts before giving up: one initial try plus five retries.
const MAX_ATTEMPTS: u32 = 6;

/// Delay between retries for generic transient errors (not nonce/underpriced, which
/// retry immediately with adjusted parameters).
const RETRY_DELAY: Duration = Duration::from_secs(15);

/// Minimum native-token balance required to attempt a send, expressed as
/// `gas_price * 200_000` — a conservative fraction of the real gas limit used only as
/// a pre-flight affordability gate, not the limit itself.
const AFFORDABILITY_GAS_UNITS: u64 = 200_000;

pub struct Transactor<M> {
    pub client: Arc<SignerMiddleware<Arc<M>, ethers::signers::LocalWallet>>,
    pub store: IndexStore,
    pub config: Config,
}

impl<M: Middleware + 'static> Transactor<M> {
    /// Submits `calldata` to `to`, retrying according to the state machine above.
    /// Returns `Ok(receipt)` only for a receipt with `status == 1`.
    pub async fn transact(
        &self,
        to: Address,
        calldata: ethers::types::Bytes,
        cancel: &CancellationToken,
    ) -> Result<TransactionReceipt, CoreError> {
        let mut attempt: u32 = 0;
        let original_base_gas_price = self.starting_gas_price().await?;
        // Counts only the retries that should raise the price (replacement-underpriced,
        // generic transient broadcast/confirmation errors) — a nonce-too-low retry is a
        // sequencing fix, not a price fix, so it must not advance this counter.
        let mut gas_bump_count: u32 = 0;
        let mut nonce: Option<U256> = None;
        let mut last_err: Option<CoreError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            attempt += 1;

            let gas_price = bump_for_attempt(original_base_gas_price, gas_bump_count, self.config.gas_max_wei());

            let resolved_nonce = match nonce {
                Some(n) => n,
                None => self
                    .client
                    .get_transaction_count(self.client.address(), None)
                    .await
                    .map_err(|e| CoreError::RpcTransient(e.to_string()))?,
            };
            nonce = Some(resolved_nonce);

            if let Err(err) = self.check_affordable(gas_price).await {
                tracing::warn!(attempt, error = %err, "insufficient funds; retrying after delay");
                last_err = Some(err);
                if attempt >= MAX_ATTEMPTS {
                    break;
                }
                if !sleep_cancellable(RETRY_DELAY, cancel).await {
                    return Err(CoreError::Cancelled);
                }
                continue;
            }

            let tx = TransactionRequest::new()
                .to(to)
                .data(calldata.clone())
                .gas(GAS_LIMIT)
                .gas_price(gas_price)
                .nonce(resolved_nonce)
                .value(U256::zero());

            match self.client.send_transaction(tx, None).await {
                Ok(pending) => match pending.await {
                    Ok(Some(receipt)) => {
                        if receipt.status == Some(1u64.into()) {
                            return Ok(receipt);
                        }
                        return Err(CoreError::ReceiptBad { tx_hash: receipt.transaction_hash });
                    }
                    Ok(None) => {
                        tracing::warn!(attempt, "transaction dropped before confirmation; retrying");
                        last_err = Some(CoreError::RpcTransient("transaction dropped before confirmation".into()));
                        gas_bump_count += 1;
                    }
                    Err(err) => {
                        tracing::warn!(attempt, error = %err, "error awaiting confirmation; retrying");
                        last_err = Some(CoreError::RpcTransient(err.to_string()));
                        gas_bump_count += 1;
                    }
                },
                Err(err) => {
                    let classified = CoreError::from_broadcast_error(&err.to_string());
                    match classified {
                        CoreError::NonceTooLow { .. } => {
                            tracing::info!(attempt, "nonce too low; refreshing nonce and retrying");
                            nonce = None;
                            last_err = Some(classified);
                        }
                        CoreError::ReplacementUnderpriced { .. } => {
                            gas_bump_count += 1;
                            tracing::info!(
                                attempt,
                                gas_price = %bump_for_attempt(original_base_gas_price, gas_bump_count, self.config.gas_max_wei()),
                                "replacement underpriced; bumping gas and retrying"
                            );
                            last_err = Some(classified);
                        }
                        CoreError::RpcTransient(_) => {
                            tracing::warn!(attempt, error = %err, "transient broadcast error; backing off");
                            last_err = Some(classified);
                            gas_bump_count += 1;
                            if !sleep_cancellable(RETRY_DELAY, cancel).await {
                                return Err(CoreError::Cancelled);
                            }
                        }
                        other => return Err(other),
                    }
                }
            }

            if attempt >= MAX_ATTEMPTS {
                break;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CoreError::RpcTransient(format!("giving up after {attempt} attempts"))
        }))
    }

    /// `gas` from the KV store, falling back to a fresh `SuggestGasPrice`-equivalent
    /// RPC call when absent or zero, scaled by `gas_multiplier`.
    async fn starting_gas_price(&self) -> Result<U256, CoreError> {
        let stored = self.store.get_u256("gas").map_err(|e| CoreError::RpcTransient(e.to_string()))?;
        let base = match stored {
            Some(price) if !price.is_zero() => price,
            _ => self
                .client
                .get_gas_price()
                .await
                .map_err(|e| CoreError::RpcTransient(e.to_string()))?,
        };
        Ok(scale_by_multiplier(base, self.config.gas_multiplier))
    }

    async fn check_affordable(&self, gas_price: U256) -> Result<(), CoreError> {
        let balance = self
            .client
            .get_balance(self.client.address(), None)
            .await
            .map_err(|e| CoreError::RpcTransient(e.to_string()))?;
        let required = gas_price * U256::from(AFFORDABILITY_GAS_UNITS);
        if balance < required {
            return Err(CoreError::InsufficientFunds {
                balance_wei: balance.to_string(),
                required_wei: required.to_string(),
            });
        }
        Ok(())
    }

    /// Side-effect-free gas estimation for operational tooling; never used on the
    /// hot submission path, which always uses the fixed `GAS_LIMIT`.
    pub async fn estimate_gas(&self, to: Address, calldata: ethers::types::Bytes) -> Result<U256, CoreError> {
        let tx = TransactionRequest::new().to(to).data(calldata).value(U256::zero());
        self.client
            .estimate_gas(&tx.into(), None)
            .await
            .map_err(|e| CoreError::RpcTransient(e.to_string()))
    }
}

/// `base + base * (bump_count * 11 / 100)`, always measured off the one fixed `base`
/// price the call started with — `bump_count` never compounds onto a previously bumped
/// price. `bump_count` is the number of price-raising retries seen so far (0 for the
/// initial attempt and for any retry that didn't need a price change, e.g. nonce-too-low),
/// clamped at `gas_max`.
fn bump_for_attempt(base: U256, bump_count: u32, gas_max: U256) -> U256 {
    if bump_count == 0 {
        return base.min(gas_max);
    }
    let bump_pct = U256::from(bump_count) * U256::from(11);
    let bumped = base + (base * bump_pct) / U256::from(100);
    bumped.min(gas_max)
}

fn scale_by_multiplier(base: U256, multiplier: f64) -> U256 {
    if multiplier <= 0.0 {
        return base;
    }
    // U256 has no native float multiply; scale through a fixed-point integer
    // multiplier to stay entirely in integer arithmetic.
    let scaled_multiplier = (multiplier * 1_000.0).round() as u128;
    (base * U256::from(scaled_multiplier)) / U256::from(1_000u64)
}

async fn sleep_cancellable(dur: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bumps_is_priced_at_base() {
        let base = U256::from(1_000);
        assert_eq!(bump_for_attempt(base, 0, U256::MAX), base);
    }

    #[test]
    fn first_bump_is_roughly_eleven_percent() {
        let base = U256::from(1_000);
        let bumped = bump_for_attempt(base, 1, U256::MAX);
        assert_eq!(bumped, U256::from(1_110)); // 1000 + 1000*11/100
    }

    #[test]
    fn second_bump_is_roughly_twenty_two_percent_off_the_original_base() {
        let base = U256::from(1_000);
        let bumped = bump_for_attempt(base, 2, U256::MAX);
        assert_eq!(bumped, U256::from(1_220)); // 1000 + 1000*22/100, not compounded off 1_110
    }

    #[test]
    fn bump_is_clamped_at_gas_max() {
        let base = U256::from(1_000);
        let cap = U256::from(1_050);
        assert_eq!(bump_for_attempt(base, 4, cap), cap);
    }

    /// A nonce-too-low retry must not advance the bump count — §8 scenario 3's
    /// "second broadcast uses nonce+1; gas price unchanged".
    #[test]
    fn nonce_too_low_retries_keep_the_same_bump_count() {
        let base = U256::from(1_000);
        let bump_count_before_retry = 0;
        assert_eq!(bump_for_attempt(base, bump_count_before_retry, U256::MAX), base);
        // NonceTooLow handling never increments gas_bump_count, so a second attempt
        // caused solely by it is still priced at bump_count 0.
        assert_eq!(bump_for_attempt(base, bump_count_before_retry, U256::MAX), base);
    }

    #[test]
    fn multiplier_of_one_is_a_no_op() {
        assert_eq!(scale_by_multiplier(U256::from(500), 1.0), U256::from(500));
    }

    #[test]
    fn multiplier_of_two_doubles_the_price() {
        assert_eq!(scale_by_multiplier(U256::from(500), 2.0), U256::from(1_000));
    }

    #[test]
    fn zero_multiplier_leaves_base_unchanged() {
        assert_eq!(scale_by_multiplier(U256::from(500), 0.0), U256::from(500));
    }
}
