use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};

use medcart_auth::{Principal, Role};
use medcart_catalog::SellerId;
use medcart_infra::settlement::{IntentDetails, NewOrder};
use medcart_orders::{Cart, PaymentMethod};

use crate::app::dto;
use crate::app::errors::{self, authz_error_to_response, settlement_error_to_response};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_order))
        .route("/verify-payment", post(verify_payment))
        .route("/my-orders", get(my_orders))
        .route("/seller/my-orders", get(seller_orders))
        .route("/:id", get(get_order))
        .route("/:id/status", put(update_status))
        .route("/:id/payment-intent", post(create_payment_intent))
        .route("/:id/cancel", post(cancel_order))
}

fn intent_response(services: &AppServices, intent: IntentDetails) -> dto::PaymentIntentResponse {
    dto::PaymentIntentResponse {
        intent,
        key_id: services.gateway_key_id.clone(),
    }
}

/// Checkout. COD orders are confirmed inline; online orders come back
/// `pending_payment` with a gateway intent to pay against.
pub async fn create_order(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<dto::CreateOrderRequest>,
) -> axum::response::Response {
    if let Err(e) = principal.require_any(&[Role::Patient]) {
        return authz_error_to_response(e);
    }

    let new_order = NewOrder {
        buyer_id: principal.id,
        cart: Cart::new(body.items),
        delivery_address: body.delivery_address,
        payment_method: body.payment_method,
        prescription_reference: body.prescription_reference,
    };

    let order = match services.settlement.create_order(new_order) {
        Ok(o) => o,
        Err(e) => return settlement_error_to_response(e),
    };

    let (order, payment_intent) = match order.payment_method {
        PaymentMethod::Cod => match services.settlement.confirm_cod(order.order_id) {
            Ok(confirmed) => (confirmed, None),
            Err(e) => return settlement_error_to_response(e),
        },
        PaymentMethod::Online => match services.settlement.create_intent(order.order_id) {
            Ok(intent) => (order, Some(intent_response(&services, intent))),
            Err(e) => {
                // The order holds its stock; the client retries via /payment-intent.
                tracing::warn!(order_id = %order.order_id, error = %e, "payment intent not created at checkout");
                (order, None)
            }
        },
    };

    (
        StatusCode::CREATED,
        Json(dto::CreateOrderResponse {
            order,
            payment_intent,
        }),
    )
        .into_response()
}

pub async fn verify_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<dto::VerifyPaymentRequest>,
) -> axum::response::Response {
    if let Err(e) = principal.require_any(&[Role::Patient, Role::Admin]) {
        return authz_error_to_response(e);
    }

    let order_id = match services.settlement.resolve_intent(&body.gateway_order_id) {
        Ok(id) => id,
        Err(e) => return settlement_error_to_response(e),
    };
    if let Err(e) = services.settlement.owned_order(order_id, &principal) {
        return settlement_error_to_response(e);
    }

    match services.settlement.verify(order_id, body.into()) {
        Ok(order) => (StatusCode::OK, Json(order)).into_response(),
        Err(e) => settlement_error_to_response(e),
    }
}

pub async fn update_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateStatusRequest>,
) -> axum::response::Response {
    if let Err(e) = principal.require_any(&[Role::Seller]) {
        return authz_error_to_response(e);
    }
    let order_id = match errors::parse_order_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.settlement.update_status(
        order_id,
        SellerId::new(principal.id),
        body.status,
        body.delivery_status,
    ) {
        Ok(order) => (StatusCode::OK, Json(order)).into_response(),
        Err(e) => settlement_error_to_response(e),
    }
}

/// Seller's slices of every order it participates in (read model).
pub async fn seller_orders(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
) -> axum::response::Response {
    if let Err(e) = principal.require_any(&[Role::Seller]) {
        return authz_error_to_response(e);
    }
    let orders = services.orders.list_for_seller(SellerId::new(principal.id));
    (StatusCode::OK, Json(orders)).into_response()
}

/// Buyer's order history (read model), newest first.
pub async fn my_orders(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
) -> axum::response::Response {
    if let Err(e) = principal.require_any(&[Role::Patient]) {
        return authz_error_to_response(e);
    }
    let orders = services.orders.list_for_buyer(principal.id);
    (StatusCode::OK, Json(orders)).into_response()
}

pub async fn get_order(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match errors::parse_order_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.settlement.get_order(order_id, &principal) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => settlement_error_to_response(e),
    }
}

/// Fetch the open intent, or create one (e.g. after a gateway outage at checkout).
pub async fn create_payment_intent(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match errors::parse_order_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    if let Err(e) = services.settlement.owned_order(order_id, &principal) {
        return settlement_error_to_response(e);
    }

    match services.settlement.create_intent(order_id) {
        Ok(intent) => (StatusCode::OK, Json(intent_response(&services, intent))).into_response(),
        Err(e) => settlement_error_to_response(e),
    }
}

pub async fn cancel_order(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match errors::parse_order_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.settlement.cancel_order(order_id, &principal) {
        Ok(order) => (StatusCode::OK, Json(order)).into_response(),
        Err(e) => settlement_error_to_response(e),
    }
}
