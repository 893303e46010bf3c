//! External capability interfaces (C10).
//!
//! The core never dials out to a chain, a rate provider, or a settlement
//! gateway directly (§1 Non-goals). Instead it defines a narrow trait per
//! capability and accepts whatever implementation the deployment wires in;
//! the mocks here are deterministic and are what the literal scenarios in
//! §8 exercise.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::error::BridgeResult;
use crate::order::PaymentOrder;
use crate::timestamp::UnixMillis;
use crate::types::Token;

/// An unsigned transfer request produced by `createTransferTx`, handed to
/// `signTransaction` to become a [`TransactionSignature`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub token: Token,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub chain_id: u64,
}

/// Opaque beyond these fields, per §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSignature {
    pub signed_tx: String,
    pub from: String,
    pub to: String,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub chain_id: u64,
    pub signed_at: UnixMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResult {
    pub success: bool,
    pub settlement_id: Option<String>,
    pub transaction_ref: Option<String>,
    pub timestamp: Option<UnixMillis>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Blockchain: Send + Sync {
    async fn get_balance(&self, address: &str, token: Token) -> BridgeResult<Decimal>;
    async fn create_transfer_tx(&self, from: &str, to: &str, amount: Decimal, token: Token) -> BridgeResult<TxRequest>;
    async fn sign_transaction(&self, tx: &TxRequest, key: &str) -> BridgeResult<TransactionSignature>;
    async fn broadcast_transaction(&self, signed_tx: &str) -> BridgeResult<String>;
    async fn wait_for_confirmation(&self, tx_hash: &str, confirmations: u32, timeout_ms: u64) -> BridgeResult<bool>;
}

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_rate(&self, token: Token) -> BridgeResult<crate::quote::ExchangeRate>;
}

/// Every [`crate::quote::RateSource`] is usable directly as an [`Exchange`] —
/// the two traits share a signature by design, since both answer "what is
/// this token worth in THB right now".
#[async_trait]
impl<T: crate::quote::RateSource + Send + Sync> Exchange for T {
    async fn get_rate(&self, token: Token) -> BridgeResult<crate::quote::ExchangeRate> {
        crate::quote::RateSource::get_rate(self, token).await
    }
}

#[async_trait]
pub trait Settlement: Send + Sync {
    async fn settle(&self, order: &PaymentOrder) -> BridgeResult<SettlementResult>;
    async fn check_status(&self, settlement_id: &str) -> BridgeResult<SettlementResult>;
}

/// Deterministic mock blockchain: every balance query returns a configured
/// fixed balance, every broadcast succeeds after recording the blob under a
/// derived `txHash`, and confirmation is immediate. Broadcasting the same
/// blob twice returns the same `txHash` (§4.6 idempotence).
pub struct MockBlockchain {
    balances: DashMap<(String, Token), Decimal>,
    default_balance: Decimal,
    broadcasts: DashMap<String, String>,
    nonce: AtomicU64,
}

impl Default for MockBlockchain {
    fn default() -> Self {
        Self {
            balances: DashMap::new(),
            default_balance: dec!(1000),
            broadcasts: DashMap::new(),
            nonce: AtomicU64::new(0),
        }
    }
}

impl MockBlockchain {
    pub fn new(default_balance: Decimal) -> Self {
        Self {
            default_balance,
            ..Default::default()
        }
    }

    pub fn set_balance(&self, address: &str, token: Token, balance: Decimal) {
        self.balances.insert((address.to_string(), token), balance);
    }
}

#[async_trait]
impl Blockchain for MockBlockchain {
    async fn get_balance(&self, address: &str, token: Token) -> BridgeResult<Decimal> {
        Ok(self
            .balances
            .get(&(address.to_string(), token))
            .map(|b| *b)
            .unwrap_or(self.default_balance))
    }

    async fn create_transfer_tx(&self, from: &str, to: &str, amount: Decimal, token: Token) -> BridgeResult<TxRequest> {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        Ok(TxRequest {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            token,
            nonce,
            gas_limit: 21_000,
            gas_price: 5_000_000_000,
            chain_id: crate::eip712::CHAIN_ID,
        })
    }

    async fn sign_transaction(&self, tx: &TxRequest, _key: &str) -> BridgeResult<TransactionSignature> {
        let blob = format!("signed:{}:{}:{}:{}", tx.from, tx.to, tx.amount, tx.nonce);
        Ok(TransactionSignature {
            signed_tx: blob,
            from: tx.from.clone(),
            to: tx.to.clone(),
            nonce: tx.nonce,
            gas_limit: tx.gas_limit,
            gas_price: tx.gas_price,
            chain_id: tx.chain_id,
            signed_at: UnixMillis::now(),
        })
    }

    async fn broadcast_transaction(&self, signed_tx: &str) -> BridgeResult<String> {
        if let Some(existing) = self.broadcasts.get(signed_tx) {
            return Ok(existing.clone());
        }
        let tx_hash = format!("0x{}", Uuid::new_v4().simple());
        self.broadcasts.insert(signed_tx.to_string(), tx_hash.clone());
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(&self, _tx_hash: &str, _confirmations: u32, _timeout_ms: u64) -> BridgeResult<bool> {
        Ok(true)
    }
}

/// Deterministic mock settlement: idempotent on `orderId` within a 24h
/// window (§8 "Idempotent settlement" law).
pub struct MockSettlement {
    settlements: DashMap<Uuid, (String, UnixMillis)>,
}

impl Default for MockSettlement {
    fn default() -> Self {
        Self {
            settlements: DashMap::new(),
        }
    }
}

const IDEMPOTENCY_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

impl MockSettlement {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Settlement for MockSettlement {
    async fn settle(&self, order: &PaymentOrder) -> BridgeResult<SettlementResult> {
        let now = UnixMillis::now();
        if let Some(entry) = self.settlements.get(&order.id) {
            let (settlement_id, recorded_at) = entry.clone();
            if now.0 - recorded_at.0 < IDEMPOTENCY_WINDOW_MS {
                return Ok(SettlementResult {
                    success: true,
                    settlement_id: Some(settlement_id),
                    transaction_ref: order.tx_hash.clone(),
                    timestamp: Some(now),
                    error: None,
                });
            }
        }
        let settlement_id = format!("stl_{}", Uuid::new_v4().simple());
        self.settlements.insert(order.id, (settlement_id.clone(), now));
        Ok(SettlementResult {
            success: true,
            settlement_id: Some(settlement_id),
            transaction_ref: order.tx_hash.clone(),
            timestamp: Some(now),
            error: None,
        })
    }

    async fn check_status(&self, settlement_id: &str) -> BridgeResult<SettlementResult> {
        for entry in self.settlements.iter() {
            if entry.value().0 == settlement_id {
                return Ok(SettlementResult {
                    success: true,
                    settlement_id: Some(settlement_id.to_string()),
                    transaction_ref: None,
                    timestamp: Some(entry.value().1),
                    error: None,
                });
            }
        }
        Ok(SettlementResult {
            success: false,
            settlement_id: None,
            transaction_ref: None,
            timestamp: None,
            error: Some("settlement not found".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_is_idempotent_on_signed_blob() {
        let chain = MockBlockchain::default();
        let first = chain.broadcast_transaction("blob-a").await.unwrap();
        let second = chain.broadcast_transaction("blob-a").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn balances_default_unless_overridden() {
        let chain = MockBlockchain::new(dec!(1.0));
        assert_eq!(chain.get_balance("0xabc", Token::Usdt).await.unwrap(), dec!(1.0));
        chain.set_balance("0xabc", Token::Usdt, dec!(50));
        assert_eq!(chain.get_balance("0xabc", Token::Usdt).await.unwrap(), dec!(50));
    }
}
