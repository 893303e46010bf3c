//! Rate cache & quote engine (C3).
//!
//! Abstracts rate retrieval behind [`RateSource`], caches the result per
//! `(token, fiat)` for a 5 minute validity window, and turns a cached rate
//! plus a THB amount into a fee-inclusive, time-bounded [`PaymentQuote`].

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::qr::PromptPayData;
use crate::timestamp::UnixMillis;
use crate::types::Token;

const RATE_VALIDITY_MS: i64 = 5 * 60 * 1000;
const QUOTE_VALIDITY_MS: i64 = 180_000;
const SERVICE_FEE_RATE: Decimal = dec!(0.005);

fn network_fee_thb(token: Token) -> Decimal {
    match token {
        Token::Usdt | Token::Usdc => dec!(5),
        Token::Eth => dec!(15),
    }
}

fn mock_base_rate(token: Token) -> Decimal {
    match token {
        Token::Usdt => dec!(35.50),
        Token::Usdc => dec!(35.48),
        Token::Eth => dec!(122000),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRate {
    pub token: Token,
    pub fiat: String,
    pub rate: Decimal,
    pub source: String,
    pub timestamp: UnixMillis,
    pub valid_until: UnixMillis,
}

/// Capability boundary for rate retrieval. All non-mock implementations fall
/// back to the mock on upstream failure, per §4.3.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn get_rate(&self, token: Token) -> BridgeResult<ExchangeRate>;
}

/// Deterministic mock rate source: a fixed base rate with small bounded
/// noise, used standalone in demo mode and as the fallback for every other
/// variant.
pub struct MockRateSource;

#[async_trait]
impl RateSource for MockRateSource {
    async fn get_rate(&self, token: Token) -> BridgeResult<ExchangeRate> {
        let base = mock_base_rate(token);
        let noise_bps = rand::rng().random_range(-25i64..=25); // +/- 0.25%
        let noise = base * Decimal::new(noise_bps, 4);
        let now = UnixMillis::now();
        Ok(ExchangeRate {
            token,
            fiat: "THB".to_string(),
            rate: base + noise,
            source: "mock".to_string(),
            timestamp: now,
            valid_until: now.plus_millis(RATE_VALIDITY_MS),
        })
    }
}

/// Thai-local ticker provider. Falls back to [`MockRateSource`] whenever the
/// upstream call fails — the upstream HTTP client itself is an external
/// capability this crate does not implement (§1 Non-goals).
pub struct ThaiLocalRateSource<U> {
    upstream: U,
    fallback: MockRateSource,
}

impl<U> ThaiLocalRateSource<U> {
    pub fn new(upstream: U) -> Self {
        Self {
            upstream,
            fallback: MockRateSource,
        }
    }
}

#[async_trait]
impl<U: RateSource> RateSource for ThaiLocalRateSource<U> {
    async fn get_rate(&self, token: Token) -> BridgeResult<ExchangeRate> {
        match self.upstream.get_rate(token).await {
            Ok(mut rate) => {
                rate.source = "thai_local".to_string();
                Ok(rate)
            }
            Err(_) => self.fallback.get_rate(token).await,
        }
    }
}

/// Global rate provider. Same fallback contract as [`ThaiLocalRateSource`].
pub struct GlobalRateSource<U> {
    upstream: U,
    fallback: MockRateSource,
}

impl<U> GlobalRateSource<U> {
    pub fn new(upstream: U) -> Self {
        Self {
            upstream,
            fallback: MockRateSource,
        }
    }
}

#[async_trait]
impl<U: RateSource> RateSource for GlobalRateSource<U> {
    async fn get_rate(&self, token: Token) -> BridgeResult<ExchangeRate> {
        match self.upstream.get_rate(token).await {
            Ok(mut rate) => {
                rate.source = "global".to_string();
                Ok(rate)
            }
            Err(_) => self.fallback.get_rate(token).await,
        }
    }
}

/// Caches rates keyed by token (fiat is always THB in this bridge); a cache
/// hit requires `validUntil > now`.
#[derive(Default)]
pub struct RateCache {
    rates: DashMap<Token, ExchangeRate>,
}

impl RateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch<S: RateSource>(&self, token: Token, source: &S) -> BridgeResult<ExchangeRate> {
        if let Some(cached) = self.rates.get(&token) {
            if cached.valid_until.0 > UnixMillis::now().0 {
                return Ok(cached.clone());
            }
        }
        let fresh = source.get_rate(token).await?;
        self.rates.insert(token, fresh.clone());
        Ok(fresh)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fee {
    pub network: Decimal,
    pub service: Decimal,
    pub total: Decimal,
}

/// Immutable once created. `expiresAt = createdAt + 180_000 ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentQuote {
    pub id: Uuid,
    pub amount_thb: Decimal,
    pub amount_crypto: Decimal,
    pub token: Token,
    pub rate: ExchangeRate,
    pub fee: Fee,
    pub prompt_pay: PromptPayData,
    pub created_at: UnixMillis,
    pub expires_at: UnixMillis,
}

impl PaymentQuote {
    pub fn is_expired(&self, now: UnixMillis) -> bool {
        now.0 > self.expires_at.0
    }
}

/// Builds a quote from a validated amount, token, and rate. `maxAmountThb` is
/// the configured per-order ceiling (default 10000).
pub fn create_quote(
    amount_thb: Decimal,
    token: Token,
    prompt_pay: PromptPayData,
    rate: ExchangeRate,
    max_amount_thb: Decimal,
) -> BridgeResult<PaymentQuote> {
    if amount_thb <= Decimal::ZERO {
        return Err(BridgeError::AmountOutOfRange("amountTHB must be positive".to_string()));
    }
    if amount_thb > max_amount_thb {
        return Err(BridgeError::AmountOutOfRange(format!(
            "amountTHB {amount_thb} exceeds configured maximum {max_amount_thb}"
        )));
    }
    if prompt_pay.account_id.is_empty() {
        return Err(BridgeError::InvalidAccountId("promptPay.accountId is empty".to_string()));
    }

    let amount_crypto_base = amount_thb / rate.rate;
    let network_fee = network_fee_thb(token) / rate.rate;
    let service_fee = amount_crypto_base * SERVICE_FEE_RATE;
    let total_fee = network_fee + service_fee;
    let amount_crypto = amount_crypto_base + total_fee;

    let created_at = UnixMillis::now();
    Ok(PaymentQuote {
        id: Uuid::new_v4(),
        amount_thb,
        amount_crypto,
        token,
        rate,
        fee: Fee {
            network: network_fee,
            service: service_fee,
            total: total_fee,
        },
        prompt_pay,
        created_at,
        expires_at: created_at.plus_millis(QUOTE_VALIDITY_MS),
    })
}

/// Short-lived in-memory index of open quotes, keyed by `quoteId`, kept
/// distinct from the order store so quotes can be evicted without losing
/// orders (§3 Ownership).
#[derive(Default)]
pub struct QuoteIndex {
    quotes: DashMap<Uuid, PaymentQuote>,
}

impl QuoteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, quote: PaymentQuote) -> Uuid {
        let id = quote.id;
        self.quotes.insert(id, quote);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<PaymentQuote> {
        self.quotes.get(id).map(|q| q.clone())
    }

    pub fn evict_expired(&self, now: UnixMillis) {
        self.quotes.retain(|_, quote| !quote.is_expired(now));
    }

    pub fn remove(&self, id: &Uuid) {
        self.quotes.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prompt_pay() -> PromptPayData {
        crate::qr::parse(&crate::qr::generate("0812345678", Some(dec!(150.00))).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn mock_rate_source_stays_near_base() {
        let rate = MockRateSource.get_rate(Token::Usdt).await.unwrap();
        assert!(rate.rate > dec!(35.0) && rate.rate < dec!(36.0));
        assert!(rate.valid_until.0 > rate.timestamp.0);
    }

    #[test]
    fn happy_path_quote_matches_scenario_math() {
        let rate = ExchangeRate {
            token: Token::Usdt,
            fiat: "THB".to_string(),
            rate: dec!(35.50),
            source: "mock".to_string(),
            timestamp: UnixMillis::now(),
            valid_until: UnixMillis::now().plus_millis(RATE_VALIDITY_MS),
        };
        let quote = create_quote(dec!(150), Token::Usdt, sample_prompt_pay(), rate, dec!(10000)).unwrap();

        let expected = dec!(150) / dec!(35.50) + dec!(5) / dec!(35.50) + (dec!(150) / dec!(35.50)) * dec!(0.005);
        let diff = (quote.amount_crypto - expected).abs();
        assert!(diff < dec!(0.0005), "amountCrypto {} vs expected {}", quote.amount_crypto, expected);
        assert_eq!(quote.fee.total, quote.fee.network + quote.fee.service);
        assert_eq!(quote.expires_at.0 - quote.created_at.0, QUOTE_VALIDITY_MS);
    }

    #[test]
    fn rejects_amount_over_configured_max() {
        let rate = ExchangeRate {
            token: Token::Usdt,
            fiat: "THB".to_string(),
            rate: dec!(35.50),
            source: "mock".to_string(),
            timestamp: UnixMillis::now(),
            valid_until: UnixMillis::now().plus_millis(RATE_VALIDITY_MS),
        };
        let err = create_quote(dec!(20000), Token::Usdt, sample_prompt_pay(), rate, dec!(10000)).unwrap_err();
        assert!(matches!(err, BridgeError::AmountOutOfRange(_)));
    }

    #[test]
    fn quote_index_evicts_only_expired() {
        let index = QuoteIndex::new();
        let rate = ExchangeRate {
            token: Token::Usdt,
            fiat: "THB".to_string(),
            rate: dec!(35.50),
            source: "mock".to_string(),
            timestamp: UnixMillis(0),
            valid_until: UnixMillis(0),
        };
        let mut quote = create_quote(dec!(150), Token::Usdt, sample_prompt_pay(), rate, dec!(10000)).unwrap();
        quote.expires_at = UnixMillis(0);
        let id = index.insert(quote);

        index.evict_expired(UnixMillis::now());
        assert!(index.get(&id).is_none());
    }
}
