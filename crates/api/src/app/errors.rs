use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use medcart_auth::AuthzError;
use medcart_core::AggregateId;
use medcart_infra::settlement::{ErrorKind, SettlementError};
use medcart_inventory::StockError;
use medcart_orders::OrderId;

/// Map a settlement failure to a stable HTTP status and error code.
pub fn settlement_error_to_response(err: SettlementError) -> axum::response::Response {
    let (status, code) = status_and_code(&err);
    if err.kind() == ErrorKind::Infrastructure {
        tracing::warn!(error = %err, retryable = err.is_retryable(), "request failed on infrastructure");
    }
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": err.to_string(),
            "kind": err.kind(),
            "retryable": err.is_retryable(),
        })),
    )
        .into_response()
}

fn status_and_code(err: &SettlementError) -> (StatusCode, &'static str) {
    use SettlementError::*;
    match err {
        PrescriptionRequired(_) => (StatusCode::UNPROCESSABLE_ENTITY, "prescription_required"),
        PaymentMethodMismatch => (StatusCode::BAD_REQUEST, "payment_method_mismatch"),
        InsufficientStock { .. } => (StatusCode::CONFLICT, "insufficient_stock"),
        PaymentVerificationFailed => (StatusCode::BAD_REQUEST, "payment_verification_failed"),
        Integrity(_) => (StatusCode::UNPROCESSABLE_ENTITY, "integrity_violation"),
        Unauthorized => (StatusCode::FORBIDDEN, "forbidden"),
        OrderCancelled => (StatusCode::CONFLICT, "order_cancelled"),
        InvalidTransition { .. } | InvalidDeliveryStatus { .. } => {
            (StatusCode::CONFLICT, "invalid_transition")
        }
        NotPendingPayment(_) => (StatusCode::CONFLICT, "not_pending_payment"),
        Gateway(_) => (StatusCode::BAD_GATEWAY, "gateway_error"),
        Concurrency(_) => (StatusCode::CONFLICT, "conflict"),
        Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        MedicineNotFound(_) | OrderNotFound | IntentNotFound => (StatusCode::NOT_FOUND, "not_found"),
        EmptyCart
        | InvalidQuantity { .. }
        | InvalidAddress(_)
        | Validation(_)
        | MedicineDiscontinued(_) => (StatusCode::BAD_REQUEST, "validation_error"),
    }
}

pub fn stock_error_to_response(err: StockError) -> axum::response::Response {
    settlement_error_to_response(err.into())
}

pub fn authz_error_to_response(err: AuthzError) -> axum::response::Response {
    json_error(StatusCode::FORBIDDEN, "forbidden", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_id(raw: &str, what: &'static str) -> Result<AggregateId, axum::response::Response> {
    raw.parse::<AggregateId>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id")))
}

pub fn parse_order_id(raw: &str) -> Result<OrderId, axum::response::Response> {
    parse_id(raw, "order").map(OrderId::new)
}
