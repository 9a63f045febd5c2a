//! Simple REST API server example for the reservation engine.
//!
//! Run with: `cargo run --example server`
//!
//! ## Endpoints
//!
//! - `GET /products/{id}` - Product with its available stock
//! - `POST /holds` - Reserve units of a product for two minutes
//! - `POST /orders` - Convert a hold into a pending order
//! - `POST /payments/webhook` - Apply a payment notification
//!
//! ## Example Usage
//!
//! ```bash
//! # Reserve
//! curl -X POST http://localhost:3000/holds \
//!   -H "Content-Type: application/json" \
//!   -d '{"product_id": 1, "qty": 2}'
//!
//! # Check out
//! curl -X POST http://localhost:3000/orders \
//!   -H "Content-Type: application/json" \
//!   -d '{"hold_id": 1}'
//!
//! # Payment notification
//! curl -X POST http://localhost:3000/payments/webhook \
//!   -H "Content-Type: application/json" \
//!   -d '{"idempotency_key": "pay-1", "order_id": 1, "status": "success", "amount": "399.98"}'
//!
//! # Stock
//! curl http://localhost:3000/products/1
//! ```

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use flash_reserve_rs::{
    Engine, ErrorKind, HoldId, OrderId, OrderStatus, PaymentEvent, ProductId, ReconcileOutcome,
    ReservationError, StockSnapshot, WebhookId,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;

// === Request/Response DTOs ===

#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    pub product_id: u64,
    pub qty: u32,
}

#[derive(Debug, Serialize)]
pub struct HoldResponse {
    pub hold_id: HoldId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct OrderRequest {
    pub hold_id: u64,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order_id: OrderId,
    pub hold_id: HoldId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub status: OrderStatus,
    pub total_price: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WebhookData {
    pub webhook_id: WebhookId,
    pub order_status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<WebhookData>,
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

/// Shared application state containing the reservation engine.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

// === Error Handling ===

/// An error response with its HTTP status.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn internal(message: impl Into<String>) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL",
            message: message.into(),
        }
    }
}

impl From<ReservationError> for AppError {
    fn from(err: ReservationError) -> Self {
        let (status, code) = match err.kind() {
            ErrorKind::Validation => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_FAILED"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ErrorKind::InsufficientStock => (StatusCode::CONFLICT, "INSUFFICIENT_STOCK"),
            ErrorKind::InvalidOrExpired => (StatusCode::GONE, "HOLD_EXPIRED"),
            ErrorKind::AlreadyUsed => (StatusCode::CONFLICT, "HOLD_ALREADY_USED"),
            ErrorKind::OrderNotYetCreated | ErrorKind::Retryable => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
            }
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Runs a blocking engine call off the async workers.
///
/// Engine operations may wait on row locks and sleep between retries.
async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ReservationError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
        .map_err(AppError::from)
}

// === Handlers ===

/// GET /products/{id} - Product with its available stock.
async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<StockSnapshot>, AppError> {
    let snapshot = state.engine.snapshot(ProductId(id))?;
    Ok(Json(snapshot))
}

/// POST /holds - Reserve stock.
async fn create_hold(
    State(state): State<AppState>,
    Json(request): Json<HoldRequest>,
) -> Result<(StatusCode, Json<HoldResponse>), AppError> {
    let engine = state.engine;
    let hold = blocking(move || engine.reserve(ProductId(request.product_id), request.qty)).await?;
    Ok((
        StatusCode::CREATED,
        Json(HoldResponse {
            hold_id: hold.id,
            expires_at: hold.expires_at,
        }),
    ))
}

/// POST /orders - Convert a hold into an order.
async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), AppError> {
    let engine = state.engine;
    let order = blocking(move || engine.convert(HoldId(request.hold_id))).await?;
    Ok((
        StatusCode::CREATED,
        Json(OrderResponse {
            order_id: order.id,
            hold_id: order.hold_id,
            product_id: order.product_id,
            quantity: order.quantity,
            status: order.status,
            total_price: order.total_price,
            created_at: order.created_at,
        }),
    ))
}

/// POST /payments/webhook - Apply a payment notification.
async fn payment_webhook(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    let event = PaymentEvent::from_json(body).map_err(|e| AppError {
        status: StatusCode::UNPROCESSABLE_ENTITY,
        code: "VALIDATION_FAILED",
        message: e.to_string(),
    })?;

    let engine = state.engine;
    let outcome = blocking(move || engine.reconcile(event))
        .await
        .map_err(|e| match e.status {
            StatusCode::UNPROCESSABLE_ENTITY => e,
            _ => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "WEBHOOK_FAILED",
                message: e.message,
            },
        })?;

    let response = match outcome {
        ReconcileOutcome::Processed(reconciliation) => (
            StatusCode::OK,
            Json(WebhookResponse {
                success: true,
                message: reconciliation.message().to_string(),
                data: Some(WebhookData {
                    webhook_id: reconciliation.webhook_id,
                    order_status: reconciliation.order_status,
                }),
            }),
        ),
        ReconcileOutcome::Deferred => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse {
                success: true,
                message: "webhook received, will process when order is ready".to_string(),
                data: None,
            }),
        ),
    };
    Ok(response)
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/products/{id}", get(get_product))
        .route("/holds", post(create_hold))
        .route("/orders", post(create_order))
        .route("/payments/webhook", post(payment_webhook))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    let engine = Arc::new(Engine::new());
    engine.add_product("Limited Edition Sneakers", dec!(199.99), 100);
    let _sweeper = engine.spawn_sweeper().unwrap();

    let app = create_router(AppState { engine });

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("Flash reserve API server running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  GET  /products/{{id}}     - Product and available stock");
    println!("  POST /holds              - Reserve stock");
    println!("  POST /orders             - Convert a hold into an order");
    println!("  POST /payments/webhook   - Payment notification");

    axum::serve(listener, app).await.unwrap();
}
