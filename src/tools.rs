//! Tool orchestrators (C9).
//!
//! Each function here is the implementation behind one entry of the tool
//! surface in §6: it validates input, drives the domain modules, and returns
//! a plain result type that `handlers.rs` wraps in the HTTP envelope.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::capabilities::TxRequest;
use crate::context::Context;
use crate::error::{BridgeError, BridgeResult};
use crate::network::NetworkStatus;
use crate::order::{apply_transition, PaymentOrder, PaymentStatus};
use crate::qr::PromptPayData;
use crate::queue::OfflineQueueItem;
use crate::quote::{create_quote, PaymentQuote};
use crate::timestamp::UnixMillis;
use crate::types::Token;

/// Scans a QR image. Real image fetch + symbol recognition is an external
/// capability (§1 Non-goals) — this crate only understands the `mock://`
/// scheme, which carries a pre-decoded PromptPay payload for deterministic
/// testing, and rejects everything else as out of scope.
///
/// The payload is carried as URL-safe, unpadded base64 directly after the
/// `mock://` prefix (e.g. `mock://<payload>`). It's extracted by stripping
/// the prefix from the raw string rather than through `url::Url`'s
/// path/authority split: standard URL parsing would swallow the payload into
/// the authority component (leaving `url.path()` empty) and standard
/// base64's `/`/`+` characters collide with URL syntax either way.
#[instrument]
pub async fn scan_qr(image_url: &str) -> BridgeResult<PromptPayData> {
    let url = url::Url::parse(image_url).map_err(|e| BridgeError::InvalidFormat(format!("imageUrl is not an absolute URL: {e}")))?;
    if url.scheme() != "mock" {
        return Err(BridgeError::InvalidFormat(
            "only mock:// image URLs are supported; real QR recognition is external to this crate".to_string(),
        ));
    }
    let payload = image_url
        .strip_prefix("mock://")
        .ok_or_else(|| BridgeError::InvalidFormat("mock:// URL is missing its payload".to_string()))?;
    let decoded = crate::util::b64::Base64Bytes::from(payload.as_bytes())
        .decode_url_safe()
        .map_err(|e| BridgeError::InvalidFormat(format!("mock:// payload is not valid base64: {e}")))?;
    let payload = String::from_utf8(decoded).map_err(|e| BridgeError::InvalidFormat(format!("mock:// payload is not UTF-8: {e}")))?;
    crate::qr::parse(&payload)
}

/// Produces a fee-inclusive quote for `amount_thb` worth of `token`, caching
/// it under a fresh quote id.
#[instrument(skip(ctx))]
pub async fn get_quote(ctx: &Context, amount_thb: Decimal, token: Token, prompt_pay: PromptPayData) -> BridgeResult<PaymentQuote> {
    let rate = ctx.rates.get_or_fetch(token, ctx.exchange.as_ref()).await?;
    let quote = create_quote(amount_thb, token, prompt_pay, rate, ctx.config.max_amount_thb())?;
    ctx.quotes.insert(quote.clone());
    Ok(quote)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentOutcome {
    pub order_id: Uuid,
    pub status: PaymentStatus,
    pub tx_hash: Option<String>,
}

/// Confirms a quote into a payment order: validates the quote hasn't
/// expired, checks the wallet's on-chain balance, builds and signs a
/// transfer, then hands the signed blob to the offline queue (§4.6/§4.9).
///
/// Resolves the offline-broadcast `from` address as `wallet_address` — the
/// user's own wallet, never `promptPay.accountId` (that field identifies the
/// PromptPay recipient, not the signer of the crypto-side transfer).
#[instrument(skip(ctx))]
pub async fn confirm_payment(ctx: &Context, quote_id: Uuid, wallet_address: &str, user_id: &str, chat_id: &str) -> BridgeResult<ConfirmPaymentOutcome> {
    let quote = ctx
        .quotes
        .get(&quote_id)
        .ok_or_else(|| BridgeError::QuoteNotFound(quote_id.to_string()))?;
    if quote.is_expired(UnixMillis::now()) {
        ctx.quotes.remove(&quote_id);
        return Err(BridgeError::QuoteExpired);
    }

    let mut order = PaymentOrder::new(user_id.to_string(), chat_id.to_string(), quote.clone());
    ctx.orders.insert(&order).await?;
    apply_transition(&mut order, PaymentStatus::Quoted)?;
    ctx.orders.update(&order).await?;

    let balance = ctx.blockchain.get_balance(wallet_address, quote.token).await?;
    if balance < quote.amount_crypto {
        order.error = Some("insufficient balance".to_string());
        apply_transition(&mut order, PaymentStatus::Cancelled)?;
        ctx.orders.update(&order).await?;
        return Err(BridgeError::InsufficientBalance);
    }

    let collection_address = ctx
        .config
        .collection_address()
        .map(|a| format!("{a:#x}"))
        .unwrap_or_else(|| quote.prompt_pay.account_id.clone());

    let tx: TxRequest = ctx
        .blockchain
        .create_transfer_tx(wallet_address, &collection_address, quote.amount_crypto, quote.token)
        .await?;
    let signature = ctx.blockchain.sign_transaction(&tx, wallet_address).await?;

    order.signature = Some(signature.clone());
    apply_transition(&mut order, PaymentStatus::Signed)?;
    ctx.orders.update(&order).await?;

    let item = OfflineQueueItem::new(order.id, signature.signed_tx);
    ctx.queue.enqueue(&item).await?;
    ctx.processor.on_enqueue().await;

    let settled = ctx.orders.get(order.id).await?.unwrap_or(order);
    Ok(ConfirmPaymentOutcome {
        order_id: settled.id,
        status: settled.status,
        tx_hash: settled.tx_hash,
    })
}

/// Looks up an order by id.
#[instrument(skip(ctx))]
pub async fn check_status(ctx: &Context, order_id: Uuid) -> BridgeResult<PaymentOrder> {
    ctx.orders
        .get(order_id)
        .await?
        .ok_or_else(|| BridgeError::Internal(format!("no such order {order_id}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateQuote {
    pub token: Token,
    pub rate: Decimal,
    pub formatted: String,
}

/// Returns the cached/fetched rate for every supported token, plus a
/// human-readable formatted string (§8 supplementary feature).
#[instrument(skip(ctx))]
pub async fn get_exchange_rates(ctx: &Context) -> BridgeResult<Vec<RateQuote>> {
    let mut quotes = Vec::with_capacity(3);
    for token in [Token::Usdt, Token::Usdc, Token::Eth] {
        let rate = ctx.rates.get_or_fetch(token, ctx.exchange.as_ref()).await?;
        quotes.push(RateQuote {
            token,
            rate: rate.rate,
            formatted: format!("1 {token} = {:.2} THB", rate.rate),
        });
    }
    Ok(quotes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{MockBlockchain, MockSettlement};
    use crate::config::Config;
    use crate::network::{NetworkDetector, Probe};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    struct AlwaysUp;

    #[async_trait]
    impl Probe for AlwaysUp {
        async fn probe(&self, _endpoint: &url::Url) -> bool {
            true
        }
    }

    async fn test_context_with_balance(balance: Decimal) -> Context {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::storage::run_migrations(&pool).await.unwrap();
        Context::new(
            Config::default(),
            pool,
            Arc::new(MockBlockchain::new(balance)),
            Arc::new(crate::quote::MockRateSource),
            Arc::new(MockSettlement::new()),
            vec![url::Url::parse("https://a.example").unwrap()],
            Arc::new(AlwaysUp),
        )
    }

    async fn test_context() -> Context {
        test_context_with_balance(dec!(1000)).await
    }

    fn sample_prompt_pay() -> PromptPayData {
        crate::qr::parse(&crate::qr::generate("0812345678", None).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn scan_qr_rejects_non_mock_scheme() {
        let err = scan_qr("https://example.com/qr.png").await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn scan_qr_decodes_mock_url_round_trip() {
        let payload = crate::qr::generate("0812345678", Some(dec!(150.00))).unwrap();
        let encoded = crate::util::b64::Base64Bytes::encode_url_safe(payload.as_bytes());
        let image_url = format!("mock://{encoded}");

        let data = scan_qr(&image_url).await.unwrap();
        assert_eq!(data.account_id, "0812345678");
        assert_eq!(data.amount, Some(dec!(150.00)));
        assert!(data.is_valid);
    }

    #[tokio::test]
    async fn get_quote_then_confirm_reaches_completed_when_online() {
        let ctx = test_context().await;
        let quote = get_quote(&ctx, dec!(150), Token::Usdt, sample_prompt_pay()).await.unwrap();

        let _ = ctx.network.probe_once().await;
        let outcome = confirm_payment(&ctx, quote.id, "0xWallet", "user-1", "chat-1").await.unwrap();

        assert_eq!(outcome.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn confirm_payment_rejects_expired_quote() {
        let ctx = test_context().await;
        let mut quote = get_quote(&ctx, dec!(150), Token::Usdt, sample_prompt_pay()).await.unwrap();
        quote.expires_at = UnixMillis(0);
        ctx.quotes.insert(quote.clone());

        let err = confirm_payment(&ctx, quote.id, "0xWallet", "user-1", "chat-1").await.unwrap_err();
        assert!(matches!(err, BridgeError::QuoteExpired));
    }

    #[tokio::test]
    async fn confirm_payment_rejects_insufficient_balance() {
        let ctx = test_context().await;
        let ctx = Context {
            blockchain: Arc::new(MockBlockchain::new(dec!(0))),
            ..ctx
        };
        let quote = get_quote(&ctx, dec!(150), Token::Usdt, sample_prompt_pay()).await.unwrap();

        let err = confirm_payment(&ctx, quote.id, "0xWallet", "user-1", "chat-1").await.unwrap_err();
        assert!(matches!(err, BridgeError::InsufficientBalance));
    }

    #[tokio::test]
    async fn get_exchange_rates_covers_all_three_tokens() {
        let ctx = test_context().await;
        let rates = get_exchange_rates(&ctx).await.unwrap();
        assert_eq!(rates.len(), 3);
    }
}
