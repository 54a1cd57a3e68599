use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use medcart_auth::{Principal, Role};
use medcart_catalog::{CatalogError, Medicine, MedicineId, SellerId};

use crate::app::dto;
use crate::app::errors::{self, authz_error_to_response, json_error, stock_error_to_response};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_medicine))
        .route("/:id", get(get_medicine))
        .route("/:id/restock", post(restock_medicine))
}

fn catalog_error_to_response(err: CatalogError) -> axum::response::Response {
    match err {
        CatalogError::MedicineNotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        CatalogError::InvalidListing { .. } | CatalogError::MedicineDiscontinued(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
        }
        CatalogError::Unavailable(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "catalog_unavailable", err.to_string())
        }
    }
}

fn medicine_response(services: &AppServices, medicine: Medicine) -> axum::response::Response {
    match services.ledger().on_hand(medicine.id) {
        Ok(stock_quantity) => (
            StatusCode::OK,
            Json(dto::MedicineResponse {
                medicine,
                stock_quantity,
            }),
        )
            .into_response(),
        Err(e) => stock_error_to_response(e),
    }
}

/// A seller lists a medicine with its opening stock.
pub async fn create_medicine(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<dto::CreateMedicineRequest>,
) -> axum::response::Response {
    if let Err(e) = principal.require_any(&[Role::Seller]) {
        return authz_error_to_response(e);
    }
    if body.name.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", "name must not be empty");
    }

    let medicine = Medicine::active(
        MedicineId::generate(),
        SellerId::new(principal.id),
        body.name.trim(),
        body.unit_price,
        body.requires_prescription,
    );
    if let Err(e) = services.catalog.upsert(medicine.clone()) {
        return catalog_error_to_response(e);
    }
    // Creates the stock row even when the opening stock is zero.
    if let Err(e) = services.ledger().restock(medicine.id, body.stock) {
        return stock_error_to_response(e);
    }

    tracing::info!(medicine_id = %medicine.id, seller_id = %medicine.seller_id, stock = body.stock, "medicine listed");
    let mut res = medicine_response(&services, medicine);
    if res.status() == StatusCode::OK {
        *res.status_mut() = StatusCode::CREATED;
    }
    res
}

pub async fn get_medicine(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let medicine_id = match errors::parse_id(&id, "medicine") {
        Ok(v) => MedicineId::new(v),
        Err(res) => return res,
    };
    match services.catalog.get(medicine_id) {
        Some(medicine) => medicine_response(&services, medicine),
        None => catalog_error_to_response(CatalogError::MedicineNotFound(medicine_id)),
    }
}

/// Add stock to a listing (owning seller or admin).
pub async fn restock_medicine(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(body): Json<dto::RestockRequest>,
) -> axum::response::Response {
    let medicine_id = match errors::parse_id(&id, "medicine") {
        Ok(v) => MedicineId::new(v),
        Err(res) => return res,
    };
    let Some(medicine) = services.catalog.get(medicine_id) else {
        return catalog_error_to_response(CatalogError::MedicineNotFound(medicine_id));
    };
    if !(principal.is_admin() || medicine.seller_id == SellerId::new(principal.id)) {
        return json_error(StatusCode::FORBIDDEN, "forbidden", "only the listing seller may restock");
    }

    match services.ledger().restock(medicine_id, body.quantity) {
        Ok(on_hand) => {
            tracing::info!(medicine_id = %medicine_id, added = body.quantity, on_hand, "medicine restocked");
            medicine_response(&services, medicine)
        }
        Err(e) => stock_error_to_response(e),
    }
}
