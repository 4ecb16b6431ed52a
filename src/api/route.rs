use crate::{
    api::{
        error::ApiError,
        response::{with_total_count, ApiResponse},
    },
    blockchain::registry::NetworkStatus,
    db::address,
    models::{Address, AddressBalance, AddressState, Trigger},
    service,
    state::AppState,
    validation::{validate_address, validate_addresses},
};
use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Deserialize)]
pub struct AddressesBody {
    pub addresses: Vec<String>,
}

#[derive(Deserialize)]
pub struct PaymentsQuery {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub networks: Vec<NetworkStatus>,
    pub addresses: BTreeMap<String, AddressState>,
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/subscriptions", get(get_subscriptions))
        .route("/status", get(get_status))
        .route("/addresses/sync", post(sync_addresses))
        .route("/addresses/{address}/payments", get(get_payments))
        .route("/addresses/{address}/balance", get(get_balance))
        .route(
            "/paybuttons/{id}/addresses",
            post(link_addresses).delete(unlink_addresses),
        )
        .route("/paybuttons/{id}/triggers", post(create_trigger))
        .route("/cache/rebuild", post(rebuild_cache))
        .with_state(app_state)
}

async fn stored_address(state: &AppState, raw: &str) -> Result<Address, ApiError> {
    validate_address(raw)?;
    address::fetch_address(&state.db_pool, raw)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("address {}", raw)))
}

async fn get_subscriptions(State(state): State<Arc<AppState>>) -> Response {
    let subscribed = state.registry.all_subscribed_addresses();
    let total = subscribed.values().map(Vec::len).sum();
    with_total_count(subscribed, total)
}

async fn get_status(State(state): State<Arc<AppState>>) -> ApiResponse<StatusBody> {
    ApiResponse {
        data: StatusBody {
            networks: state.registry.status().await,
            addresses: state.engine.states(),
        },
    }
}

async fn sync_addresses(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddressesBody>,
) -> Result<Response, ApiError> {
    validate_addresses(&body.addresses)?;
    info!("Sync requested for {} addresses", body.addresses.len());

    let report = state.engine.sync_and_subscribe_addresses(body.addresses).await?;
    let total = report.successful.len();
    Ok(with_total_count(report, total))
}

async fn get_payments(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Query(params): Query<PaymentsQuery>,
) -> Result<Response, ApiError> {
    let address = stored_address(&state, &raw).await?;
    let payments = state.cache.payments_for_address(&address).await?;

    let total = payments.len();
    let page: Vec<_> = payments
        .into_iter()
        .skip(params.offset.unwrap_or(0))
        .take(params.limit.unwrap_or(DEFAULT_PAGE_SIZE))
        .collect();
    Ok(with_total_count(page, total))
}

async fn get_balance(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<ApiResponse<AddressBalance>, ApiError> {
    let address = stored_address(&state, &raw).await?;
    let balance = state.cache.balance(&address).await?;
    Ok(ApiResponse { data: balance })
}

async fn link_addresses(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AddressesBody>,
) -> Result<ApiResponse<service::LinkOutcome>, ApiError> {
    let outcome =
        service::link_paybutton_addresses(&state.db_pool, &state.cache, &state.engine, id, &body.addresses).await?;
    Ok(ApiResponse { data: outcome })
}

async fn unlink_addresses(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AddressesBody>,
) -> Result<ApiResponse<Vec<Address>>, ApiError> {
    let removed = service::unlink_paybutton_addresses(&state.db_pool, &state.cache, id, &body.addresses).await?;
    Ok(ApiResponse { data: removed })
}

async fn create_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<service::NewTrigger>,
) -> Result<ApiResponse<Trigger>, ApiError> {
    let trigger = service::create_trigger(&state.db_pool, id, &body).await?;
    Ok(ApiResponse { data: trigger })
}

async fn rebuild_cache(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let payments = state.cache.rebuild_all().await?;
    info!("Payment cache rebuilt on request with {} payments", payments);
    Ok(with_total_count(serde_json::json!({ "payments": payments }), payments))
}
