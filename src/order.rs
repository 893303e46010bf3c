//! Order store & state machine (C4).
//!
//! [`PaymentOrder`] is a mutable envelope around an immutable [`PaymentQuote`].
//! The only mutation path is [`apply_transition`], which enforces the legal
//! transition graph from §4.4 before a status ever reaches storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, query, query_scalar};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

use crate::capabilities::TransactionSignature;
use crate::error::{BridgeError, BridgeResult};
use crate::quote::PaymentQuote;
use crate::timestamp::UnixMillis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Init,
    Quoted,
    Signed,
    Pending,
    Settled,
    Completed,
    Expired,
    Cancelled,
    Failed,
    Timeout,
}

impl Display for PaymentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentStatus::Init => "INIT",
            PaymentStatus::Quoted => "QUOTED",
            PaymentStatus::Signed => "SIGNED",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Settled => "SETTLED",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Timeout => "TIMEOUT",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PaymentStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(PaymentStatus::Init),
            "QUOTED" => Ok(PaymentStatus::Quoted),
            "SIGNED" => Ok(PaymentStatus::Signed),
            "PENDING" => Ok(PaymentStatus::Pending),
            "SETTLED" => Ok(PaymentStatus::Settled),
            "COMPLETED" => Ok(PaymentStatus::Completed),
            "EXPIRED" => Ok(PaymentStatus::Expired),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            "FAILED" => Ok(PaymentStatus::Failed),
            "TIMEOUT" => Ok(PaymentStatus::Timeout),
            other => Err(BridgeError::Internal(format!("unknown order status {other}"))),
        }
    }
}

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Expired
                | PaymentStatus::Cancelled
                | PaymentStatus::Failed
                | PaymentStatus::Timeout
        )
    }
}

/// The legal transition graph of §4.4. Any pair not listed here is rejected.
fn is_legal_transition(from: PaymentStatus, to: PaymentStatus) -> bool {
    use PaymentStatus::*;
    matches!(
        (from, to),
        (Init, Quoted)
            | (Init, Cancelled)
            | (Quoted, Signed)
            | (Quoted, Expired)
            | (Quoted, Cancelled)
            | (Signed, Pending)
            | (Signed, Failed)
            | (Pending, Settled)
            | (Pending, Failed)
            | (Pending, Timeout)
            | (Settled, Completed)
            | (Settled, Failed)
    )
}

/// Mutable envelope around a quote. `updatedAt` is non-decreasing;
/// `completedAt` is set iff `status = COMPLETED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrder {
    pub id: Uuid,
    pub user_id: String,
    pub chat_id: String,
    pub status: PaymentStatus,
    pub quote: PaymentQuote,
    pub signature: Option<TransactionSignature>,
    pub tx_hash: Option<String>,
    pub settlement_id: Option<String>,
    pub error: Option<String>,
    pub created_at: UnixMillis,
    pub updated_at: UnixMillis,
    pub completed_at: Option<UnixMillis>,
}

impl PaymentOrder {
    pub fn new(user_id: String, chat_id: String, quote: PaymentQuote) -> Self {
        let now = UnixMillis::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            chat_id,
            status: PaymentStatus::Init,
            quote,
            signature: None,
            tx_hash: None,
            settlement_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Applies a status transition in place, rejecting anything outside the
/// legal graph. Callers persist the mutated order via [`OrderStore::update`].
pub fn apply_transition(order: &mut PaymentOrder, to: PaymentStatus) -> BridgeResult<()> {
    if !is_legal_transition(order.status, to) {
        return Err(BridgeError::IllegalTransition {
            from: order.status.to_string(),
            to: to.to_string(),
        });
    }
    order.status = to;
    order.updated_at = UnixMillis::now();
    if to == PaymentStatus::Completed {
        order.completed_at = Some(order.updated_at);
    }
    Ok(())
}

/// Durable order storage. By `id` (unique), by `userId` (history, newest
/// first), by `status` (recovery) per §4.4's "Indexes required".
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: &PaymentOrder) -> BridgeResult<()>;
    async fn update(&self, order: &PaymentOrder) -> BridgeResult<()>;
    async fn get(&self, id: Uuid) -> BridgeResult<Option<PaymentOrder>>;
    async fn history(&self, user_id: &str) -> BridgeResult<Vec<PaymentOrder>>;
    async fn list_by_status(&self, status: PaymentStatus) -> BridgeResult<Vec<PaymentOrder>>;
    async fn list_active(&self) -> BridgeResult<Vec<PaymentOrder>>;
    async fn count_failed(&self) -> BridgeResult<i64>;
    async fn delete(&self, id: Uuid) -> BridgeResult<()>;
}

pub struct SqliteOrderStore {
    pool: SqlitePool,
}

impl SqliteOrderStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: SqliteRow) -> BridgeResult<PaymentOrder> {
        let status: String = row.try_get("status")?;
        let quote_json: String = row.try_get("quote_json")?;
        let signature_json: Option<String> = row.try_get("signature_json")?;
        Ok(PaymentOrder {
            id: Uuid::parse_str(row.try_get::<String, _>("id")?.as_str())
                .map_err(|e| BridgeError::Storage(e.to_string()))?,
            user_id: row.try_get("user_id")?,
            chat_id: row.try_get("chat_id")?,
            status: PaymentStatus::from_str(&status)?,
            quote: serde_json::from_str(&quote_json).map_err(|e| BridgeError::Storage(e.to_string()))?,
            signature: signature_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| BridgeError::Storage(e.to_string()))?,
            tx_hash: row.try_get("tx_hash")?,
            settlement_id: row.try_get("settlement_id")?,
            error: row.try_get("error")?,
            created_at: UnixMillis(row.try_get("created_at")?),
            updated_at: UnixMillis(row.try_get("updated_at")?),
            completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(UnixMillis),
        })
    }
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn insert(&self, order: &PaymentOrder) -> BridgeResult<()> {
        let quote_json = serde_json::to_string(&order.quote).map_err(|e| BridgeError::Storage(e.to_string()))?;
        let signature_json = order
            .signature
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| BridgeError::Storage(e.to_string()))?;
        query(
            "INSERT INTO orders (id, user_id, chat_id, status, quote_json, signature_json, tx_hash, \
             settlement_id, error, created_at, updated_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(order.id.to_string())
        .bind(&order.user_id)
        .bind(&order.chat_id)
        .bind(order.status.to_string())
        .bind(quote_json)
        .bind(signature_json)
        .bind(&order.tx_hash)
        .bind(&order.settlement_id)
        .bind(&order.error)
        .bind(order.created_at.0)
        .bind(order.updated_at.0)
        .bind(order.completed_at.map(|t| t.0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, order: &PaymentOrder) -> BridgeResult<()> {
        let quote_json = serde_json::to_string(&order.quote).map_err(|e| BridgeError::Storage(e.to_string()))?;
        let signature_json = order
            .signature
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| BridgeError::Storage(e.to_string()))?;
        query(
            "UPDATE orders SET status = ?, quote_json = ?, signature_json = ?, tx_hash = ?, \
             settlement_id = ?, error = ?, updated_at = ?, completed_at = ? WHERE id = ?",
        )
        .bind(order.status.to_string())
        .bind(quote_json)
        .bind(signature_json)
        .bind(&order.tx_hash)
        .bind(&order.settlement_id)
        .bind(&order.error)
        .bind(order.updated_at.0)
        .bind(order.completed_at.map(|t| t.0))
        .bind(order.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BridgeResult<Option<PaymentOrder>> {
        let row = query("SELECT * FROM orders WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::from_row).transpose()
    }

    async fn history(&self, user_id: &str) -> BridgeResult<Vec<PaymentOrder>> {
        let rows = query("SELECT * FROM orders WHERE user_id = ? ORDER BY created_at DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::from_row).collect()
    }

    async fn list_by_status(&self, status: PaymentStatus) -> BridgeResult<Vec<PaymentOrder>> {
        let rows = query("SELECT * FROM orders WHERE status = ? ORDER BY created_at ASC")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::from_row).collect()
    }

    async fn list_active(&self) -> BridgeResult<Vec<PaymentOrder>> {
        let rows = query(
            "SELECT * FROM orders WHERE status NOT IN ('COMPLETED','EXPIRED','CANCELLED','FAILED','TIMEOUT') \
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::from_row).collect()
    }

    async fn count_failed(&self) -> BridgeResult<i64> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM orders WHERE status = 'FAILED'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn delete(&self, id: Uuid) -> BridgeResult<()> {
        query("DELETE FROM orders WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_graph_allows_happy_path() {
        assert!(is_legal_transition(PaymentStatus::Init, PaymentStatus::Quoted));
        assert!(is_legal_transition(PaymentStatus::Quoted, PaymentStatus::Signed));
        assert!(is_legal_transition(PaymentStatus::Signed, PaymentStatus::Pending));
        assert!(is_legal_transition(PaymentStatus::Pending, PaymentStatus::Settled));
        assert!(is_legal_transition(PaymentStatus::Settled, PaymentStatus::Completed));
    }

    #[test]
    fn legal_graph_rejects_regression_and_skips() {
        assert!(!is_legal_transition(PaymentStatus::Pending, PaymentStatus::Init));
        assert!(!is_legal_transition(PaymentStatus::Init, PaymentStatus::Signed));
        assert!(!is_legal_transition(PaymentStatus::Completed, PaymentStatus::Failed));
    }

    #[test]
    fn terminal_states_have_no_outbound_edges() {
        for terminal in [
            PaymentStatus::Completed,
            PaymentStatus::Expired,
            PaymentStatus::Cancelled,
            PaymentStatus::Failed,
            PaymentStatus::Timeout,
        ] {
            for to in [
                PaymentStatus::Init,
                PaymentStatus::Quoted,
                PaymentStatus::Signed,
                PaymentStatus::Pending,
                PaymentStatus::Settled,
                PaymentStatus::Completed,
            ] {
                assert!(!is_legal_transition(terminal, to));
            }
        }
    }

    #[test]
    fn apply_transition_stamps_completed_at_only_on_completion() {
        let rate = crate::quote::ExchangeRate {
            token: crate::types::Token::Usdt,
            fiat: "THB".to_string(),
            rate: rust_decimal::Decimal::new(3550, 2),
            source: "mock".to_string(),
            timestamp: UnixMillis::now(),
            valid_until: UnixMillis::now().plus_millis(60_000),
        };
        let prompt_pay = crate::qr::parse(&crate::qr::generate("0812345678", None).unwrap()).unwrap();
        let quote = crate::quote::create_quote(
            rust_decimal::Decimal::new(15000, 2),
            crate::types::Token::Usdt,
            prompt_pay,
            rate,
            rust_decimal::Decimal::new(1000000, 2),
        )
        .unwrap();
        let mut order = PaymentOrder::new("user-1".to_string(), "chat-1".to_string(), quote);

        apply_transition(&mut order, PaymentStatus::Quoted).unwrap();
        assert!(order.completed_at.is_none());

        apply_transition(&mut order, PaymentStatus::Signed).unwrap();
        apply_transition(&mut order, PaymentStatus::Pending).unwrap();
        apply_transition(&mut order, PaymentStatus::Settled).unwrap();
        apply_transition(&mut order, PaymentStatus::Completed).unwrap();
        assert!(order.completed_at.is_some());

        let err = apply_transition(&mut order, PaymentStatus::Failed).unwrap_err();
        assert!(matches!(err, BridgeError::IllegalTransition { .. }));
    }
}
