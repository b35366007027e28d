//! Chiliz chain agent
//!
//! Holds the on-chain agent wallet and RPC provider used by the tool
//! layer. All fan-token contracts live in a fixed club → address table so
//! tools can resolve a club code without the model knowing addresses.

use crate::error::ChatError;
use crate::Result;
use alloy::network::EthereumWallet;
use alloy::primitives::utils::{format_units, parse_units};
use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use lazy_static::lazy_static;
use std::collections::HashMap;
use tracing::{debug, info};

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// One fan-token contract entry.
#[derive(Debug, Clone, Copy)]
pub struct TokenInfo {
    pub address: Address,
    pub decimals: u8,
}

lazy_static! {
    /// Club code → fan-token contract on the Chiliz Spicy testnet.
    static ref TOKEN_MAP: HashMap<&'static str, TokenInfo> = {
        let entries: [(&'static str, &'static str); 11] = [
            ("PSG", "0xb0Fa395a3386800658B9617F90e834E2CeC76Dd3"),
            ("SPURS", "0x9B9C9AAa74678FcF4E1c76eEB1fa969A8E7254f8"),
            ("BAR", "0x7F73C50748560BD2B286a4c7bF6a805cFb6f735d"),
            ("ACM", "0x641d040dB51398Ba3a4f2d7839532264EcdCc3aE"),
            ("OG", "0xEc1C46424E20671d9b21b9336353EeBcC8aEc7b5"),
            ("CITY", "0x66F80ddAf5ccfbb082A0B0Fae3F21eA19f6B88ef"),
            ("AFC", "0x44B190D30198F2E585De8974999a28f5c68C6E0F"),
            ("MENGO", "0x1CC71168281dd78fF004ba6098E113bbbCBDc914"),
            ("JUV", "0x945EeD98f5CBada87346028aD0BeE0eA66849A0e"),
            ("NAP", "0x8DBe49c4Dcde110616fafF53b39270E1c48F861a"),
            ("ATM", "0xc926130FA2240e16A41c737d54c1d9b1d4d45257"),
        ];

        entries
            .iter()
            .map(|(club, addr)| {
                (
                    *club,
                    TokenInfo {
                        address: addr.parse().expect("static token address"),
                        decimals: 18,
                    },
                )
            })
            .collect()
    };
}

/// Resolve a club code (case-insensitive) to its fan-token contract.
pub fn token_info(club: &str) -> Option<TokenInfo> {
    TOKEN_MAP.get(club.to_uppercase().as_str()).copied()
}

pub fn supported_clubs() -> Vec<&'static str> {
    let mut clubs: Vec<&'static str> = TOKEN_MAP.keys().copied().collect();
    clubs.sort_unstable();
    clubs
}

/// Signer-backed RPC agent. Cheap to share behind an Arc; the provider
/// pools its HTTP connections.
pub struct ChainAgent {
    provider: DynProvider,
    address: Address,
}

impl ChainAgent {
    pub fn new(private_key: &str, rpc_url: &str) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| ChatError::Configuration(format!("PRIVATE_KEY: {}", e)))?;
        let address = signer.address();

        let url = rpc_url
            .parse()
            .map_err(|e| ChatError::Rpc(format!("Invalid RPC URL {}: {}", rpc_url, e)))?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        info!(agent = %address, "Chain agent initialized");

        Ok(Self { provider, address })
    }

    /// Checksummed address of the agent wallet.
    pub fn address(&self) -> String {
        self.address.to_checksum(None)
    }

    /// Liveness probe against the RPC endpoint (eth_blockNumber).
    pub async fn probe(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChatError::Rpc(format!("Failed to reach RPC URL: {}", e)))
    }

    /// Native CHZ balance of the agent wallet.
    pub async fn native_balance(&self) -> Result<f64> {
        let raw = self
            .provider
            .get_balance(self.address)
            .await
            .map_err(|e| ChatError::Rpc(format!("Balance lookup failed: {}", e)))?;

        units_to_f64(raw, 18)
    }

    /// Fan-token balance of `holder` for the given club.
    pub async fn token_balance(&self, club: &str, holder: &str) -> Result<f64> {
        let info = token_info(club).ok_or_else(|| {
            ChatError::Tool(format!(
                "Unsupported club {:?}. Supported: {}",
                club,
                supported_clubs().join(", ")
            ))
        })?;

        let holder: Address = holder
            .parse()
            .map_err(|e| ChatError::Tool(format!("Invalid holder address: {}", e)))?;

        debug!(club = %club, contract = %info.address, holder = %holder, "balanceOf");

        let contract = IERC20::new(info.address, &self.provider);
        let raw = contract
            .balanceOf(holder)
            .call()
            .await
            .map_err(|e| ChatError::Rpc(format!("balanceOf failed: {}", e)))?;

        units_to_f64(raw, info.decimals)
    }

    /// Transfer `amount` fan tokens from the agent wallet to `to`.
    /// Returns the transaction hash once the transaction lands.
    pub async fn transfer_token(&self, club: &str, to: &str, amount: f64) -> Result<String> {
        let info = token_info(club).ok_or_else(|| {
            ChatError::Tool(format!(
                "Unsupported club {:?}. Supported: {}",
                club,
                supported_clubs().join(", ")
            ))
        })?;

        let to: Address = to
            .parse()
            .map_err(|e| ChatError::Tool(format!("Invalid recipient address: {}", e)))?;

        let raw_amount = parse_units(&amount.to_string(), info.decimals)
            .map_err(|e| ChatError::Tool(format!("Invalid amount {}: {}", amount, e)))?
            .get_absolute();

        info!(club = %club, to = %to, amount = amount, "Submitting token transfer");

        let contract = IERC20::new(info.address, &self.provider);
        let pending = contract
            .transfer(to, raw_amount)
            .send()
            .await
            .map_err(|e| ChatError::Rpc(format!("transfer failed: {}", e)))?;

        let tx_hash = pending
            .watch()
            .await
            .map_err(|e| ChatError::Rpc(format!("transfer not confirmed: {}", e)))?;

        Ok(format!("{:#x}", tx_hash))
    }
}

fn units_to_f64(raw: alloy::primitives::U256, decimals: u8) -> Result<f64> {
    let formatted = format_units(raw, decimals)
        .map_err(|e| ChatError::Tool(format!("Unit conversion failed: {}", e)))?;
    formatted
        .parse::<f64>()
        .map_err(|e| ChatError::Tool(format!("Unit conversion failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    #[test]
    fn test_token_map_covers_all_clubs() {
        assert_eq!(supported_clubs().len(), 11);
        for club in ["PSG", "SPURS", "BAR", "ACM", "OG", "CITY", "AFC", "MENGO", "JUV", "NAP", "ATM"] {
            let info = token_info(club).expect(club);
            assert_eq!(info.decimals, 18);
        }
    }

    #[test]
    fn test_token_lookup_is_case_insensitive() {
        let upper = token_info("PSG").unwrap();
        let lower = token_info("psg").unwrap();
        assert_eq!(upper.address, lower.address);
        assert!(token_info("REAL").is_none());
    }

    #[test]
    fn test_units_to_f64() {
        let one_token = U256::from(10u64).pow(U256::from(18u64));
        assert_eq!(units_to_f64(one_token, 18).unwrap(), 1.0);
        assert_eq!(units_to_f64(U256::ZERO, 18).unwrap(), 0.0);
    }

    #[test]
    fn test_agent_address_derivation() {
        // Well-known address for private key 0x...01
        let agent = ChainAgent::new(
            "0x0000000000000000000000000000000000000000000000000000000000000001",
            "https://spicy-rpc.chiliz.com",
        )
        .unwrap();
        assert_eq!(
            agent.address(),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
    }

    #[test]
    fn test_agent_rejects_bad_key() {
        assert!(ChainAgent::new("not-a-key", "https://spicy-rpc.chiliz.com").is_err());
    }
}
