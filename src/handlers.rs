//! HTTP endpoints exposing the tool surface (C9) of §6 as JSON.
//!
//! This is the chat/AI-tool registration surface's stand-in (§1 declares the
//! real one out of scope): a plain Axum router, one route per tool name, each
//! handler a thin wrapper that deserializes the request, calls the matching
//! `tools::*` orchestrator, and renders `{success, ..., error?}` — never a
//! raw 500 for a domain-level failure.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::context::Context;
use crate::error::BridgeError;
use crate::order::PaymentOrder;
use crate::qr::PromptPayData;
use crate::quote::PaymentQuote;
use crate::sync::SyncEvent;
use crate::tools;
use crate::tools::{ConfirmPaymentOutcome, RateQuote};
use crate::types::Token;

pub fn routes() -> Router<Arc<Context>> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/tools/scan_promptpay_qr", post(post_scan_qr))
        .route("/tools/get_crypto_quote", post(post_get_quote))
        .route("/tools/confirm_payment", post(post_confirm_payment))
        .route("/tools/check_payment_status", post(post_check_status))
        .route("/tools/get_exchange_rates", post(post_get_exchange_rates))
        .route("/sync/force", post(post_force_sync))
}

/// `GET /`: greeting, mirrors the teacher's root handler.
#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /health`: liveness plus the current network-quality snapshot.
#[instrument(skip_all)]
pub async fn get_health(State(ctx): State<Arc<Context>>) -> impl IntoResponse {
    let status = ctx.network_status().await;
    Json(json!({ "status": "ok", "network": status }))
}

/// Envelope every tool response renders as, per §4.9 "thin, validated
/// entrypoint returning `{success, …, error?}`".
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolEnvelope<T: Serialize> {
    success: bool,
    #[serde(flatten)]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ToolEnvelope { success: true, data: Some(data), error: None })).into_response()
}

fn fail<T: Serialize>(error: BridgeError) -> Response {
    let status = match error {
        BridgeError::QuoteNotFound(_) | BridgeError::Internal(_) => StatusCode::NOT_FOUND,
        BridgeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    let body: ToolEnvelope<T> = ToolEnvelope {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanQrRequest {
    image_url: String,
}

#[instrument(skip_all)]
async fn post_scan_qr(State(_ctx): State<Arc<Context>>, Json(req): Json<ScanQrRequest>) -> Response {
    match tools::scan_qr(&req.image_url).await {
        Ok(data) => ok::<PromptPayData>(data),
        Err(error) => fail::<PromptPayData>(error),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetQuoteRequest {
    amount_thb: Decimal,
    token: Token,
    prompt_pay: PromptPayData,
}

#[instrument(skip(ctx))]
async fn post_get_quote(State(ctx): State<Arc<Context>>, Json(req): Json<GetQuoteRequest>) -> Response {
    match tools::get_quote(&ctx, req.amount_thb, req.token, req.prompt_pay).await {
        Ok(quote) => ok::<PaymentQuote>(quote),
        Err(error) => fail::<PaymentQuote>(error),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmPaymentRequest {
    quote_id: Uuid,
    wallet_address: String,
    user_id: String,
    chat_id: String,
}

#[instrument(skip(ctx))]
async fn post_confirm_payment(State(ctx): State<Arc<Context>>, Json(req): Json<ConfirmPaymentRequest>) -> Response {
    match tools::confirm_payment(&ctx, req.quote_id, &req.wallet_address, &req.user_id, &req.chat_id).await {
        Ok(outcome) => ok::<ConfirmPaymentOutcome>(outcome),
        Err(error) => fail::<ConfirmPaymentOutcome>(error),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckStatusRequest {
    order_id: Uuid,
}

#[instrument(skip(ctx))]
async fn post_check_status(State(ctx): State<Arc<Context>>, Json(req): Json<CheckStatusRequest>) -> Response {
    match tools::check_status(&ctx, req.order_id).await {
        Ok(order) => ok::<PaymentOrder>(order),
        Err(error) => fail::<PaymentOrder>(error),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRatesResponse {
    rates: Vec<RateQuote>,
}

#[instrument(skip(ctx))]
async fn post_get_exchange_rates(State(ctx): State<Arc<Context>>) -> Response {
    match tools::get_exchange_rates(&ctx).await {
        Ok(rates) => ok::<ExchangeRatesResponse>(ExchangeRatesResponse { rates }),
        Err(error) => fail::<ExchangeRatesResponse>(error),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ForceSyncResponse {
    events: Vec<String>,
}

/// `POST /sync/force`: drives `forceSync` (C8) to completion and reports the
/// event stream it emitted along the way.
#[instrument(skip(ctx))]
async fn post_force_sync(State(ctx): State<Arc<Context>>) -> Response {
    let mut subscription = ctx.sync.subscribe();
    match ctx.sync.force_sync().await {
        Ok(()) => {
            let mut events = Vec::new();
            while let Ok(event) = subscription.try_recv() {
                events.push(describe_sync_event(&event));
            }
            ok::<ForceSyncResponse>(ForceSyncResponse { events })
        }
        Err(error) => fail::<ForceSyncResponse>(error),
    }
}

fn describe_sync_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::Started => "sync_started".to_string(),
        SyncEvent::Progress { total, processed, failed } => {
            format!("sync_progress total={total} processed={processed} failed={failed}")
        }
        SyncEvent::Completed { total, processed, failed } => {
            format!("sync_completed total={total} processed={processed} failed={failed}")
        }
        SyncEvent::Failed { total, processed, failed, reason } => {
            format!("sync_failed total={total} processed={processed} failed={failed} reason={reason}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{MockBlockchain, MockSettlement};
    use crate::config::Config;
    use crate::network::{NetworkDetector, Probe};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use sqlx::sqlite::SqlitePoolOptions;
    use tower::ServiceExt;

    struct AlwaysUp;

    #[async_trait]
    impl Probe for AlwaysUp {
        async fn probe(&self, _endpoint: &url::Url) -> bool {
            true
        }
    }

    async fn test_app() -> Router<()> {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::storage::run_migrations(&pool).await.unwrap();
        let ctx = Arc::new(Context::new(
            Config::default(),
            pool,
            Arc::new(MockBlockchain::default()),
            Arc::new(crate::quote::MockRateSource),
            Arc::new(MockSettlement::new()),
            vec![url::Url::parse("https://a.example").unwrap()],
            Arc::new(AlwaysUp),
        ));
        routes().with_state(ctx)
    }

    #[tokio::test]
    async fn root_returns_greeting() {
        let app = test_app().await;
        let response = app.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scan_qr_rejects_non_mock_url_with_envelope_error() {
        let app = test_app().await;
        let body = json!({ "imageUrl": "https://example.com/qr.png" }).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tools/scan_promptpay_qr")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_exchange_rates_returns_success_envelope() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tools/get_exchange_rates")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
