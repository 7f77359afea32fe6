use ethers::contract::abigen;

// Minimal ABI for the oracle contract. Only `submitMiningSolution` and
// `getNewCurrentVariables` are on the hot path (see consumed contract surface);
// the staking/migration calls are included because operational tooling built on
// top of this core (transfer/deposit/status sub-commands) needs them, even
// though that tooling itself is out of scope here.
abigen!(
    OracleContract,
    r#"[
        function submitMiningSolution(string nonce, uint256[5] requestIds, uint256[5] values)
        function getNewCurrentVariables() view returns (bytes32 challenge, uint256[5] requestIds, uint256 difficulty, uint256 slot)
        function getUintVar(bytes32 key) view returns (uint256)
        function migrate()
        function requestStakingWithdraw()
        function withdrawStake()
        function balanceOf(address who) view returns (uint256)

        event NonceSubmitted(address indexed miner, string nonce, uint256[5] requestId, uint256[5] value)
        event NewChallenge(bytes32 indexed currentChallenge, uint256[5] currentRequestId, uint256 difficulty, uint256 totalTips)
    ]"#
);

/// keccak256("_SLOT_PROGRESS"), the storage key read via `getUintVar` to find which
/// slot (1..5) is next to submit in the current round.
pub fn slot_progress_key() -> ethers::types::H256 {
    ethers::utils::keccak256(b"_SLOT_PROGRESS").into()
}

/// Topic0 for `NonceSubmitted(address,string,uint256[5],uint256[5])`, used by the
/// dispute checker to filter historical logs without decoding event data up front.
pub fn nonce_submitted_topic0() -> ethers::types::H256 {
    ethers::utils::id("NonceSubmitted(address,string,uint256[5],uint256[5])")
}

/// Topic0 for `NewChallenge(bytes32,uint256[5],uint256,uint256)`, used by the Tasker
/// to subscribe without decoding event data.
pub fn new_challenge_topic0() -> ethers::types::H256 {
    ethers::utils::id("NewChallenge(bytes32,uint256[5],uint256,uint256)")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `slot_progress_key`/`migrate`/`requestStakingWithdraw`/`withdrawStake` back the
    /// out-of-scope CLI sub-commands (`status`, `transfer`, `deposit`), not the core
    /// pipeline; this test exists only to pin the storage key the `status` sub-command
    /// would read, since nothing in the core itself calls it.
    #[test]
    fn slot_progress_key_is_stable() {
        assert_eq!(slot_progress_key(), ethers::utils::keccak256(b"_SLOT_PROGRESS").into());
    }

    /// The Tasker subscribes via the typed `OracleContract::event` filter rather than a
    /// raw topic0 match, so this helper is currently unused on the hot path; kept for
    /// callers (e.g. a historical backfill) that filter logs directly the way
    /// `nonce_submitted_topic0` does for the dispute checker.
    #[test]
    fn new_challenge_topic0_is_stable() {
        assert_eq!(
            new_challenge_topic0(),
            ethers::utils::id("NewChallenge(bytes32,uint256[5],uint256,uint256)")
        );
    }
}
