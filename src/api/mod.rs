//! HTTP API for configurations, deployment status, and health checks

use crate::chain::{ChainInfo, ChainManager};
use crate::config::ApiConfig;
use crate::coordination::Orchestrator;
use crate::error::{DeployerError, DeployerResult};
use crate::model::{DeploymentStatusReport, NewTokenConfiguration, TokenConfiguration};
use crate::state::DeploymentStats;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub chain_manager: Arc<ChainManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .route("/configurations", post(create_configuration))
        .route("/configurations/:id", get(get_configuration))
        .route("/configurations/:id/fee", post(attach_fee_payment))
        .route("/configurations/:id/start", post(start_deployment))
        .route("/configurations/:id/chains/:chain/retry", post(retry_chain))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    orchestrator: Orchestrator,
    chain_manager: Arc<ChainManager>,
) -> DeployerResult<()> {
    let app = router(AppState {
        orchestrator,
        chain_manager,
    });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| DeployerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| DeployerError::Internal(format!("API server error: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.orchestrator.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let ready = db_ok && chains_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

/// Enabled chains and the hub designation
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.orchestrator.registry();
    Json(ChainsResponse {
        hub: registry.hub().to_string(),
        chains: registry.chains().into_iter().cloned().collect(),
        connected: state.chain_manager.connected_chains(),
    })
}

/// Record counts by status
async fn get_stats(State(state): State<AppState>) -> Result<Json<DeploymentStats>, ApiError> {
    Ok(Json(state.orchestrator.stats().await?))
}

/// Validate and store a new configuration
async fn create_configuration(
    State(state): State<AppState>,
    Json(draft): Json<NewTokenConfiguration>,
) -> Result<(StatusCode, Json<TokenConfiguration>), ApiError> {
    let configuration = state.orchestrator.create_configuration(draft).await?;
    Ok((StatusCode::CREATED, Json(configuration)))
}

/// Aggregate status and per-chain records of one configuration
async fn get_configuration(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentStatusReport>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.get_status(id).await?))
}

async fn attach_fee_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FeePaymentRequest>,
) -> Result<Json<TokenConfiguration>, ApiError> {
    let id = parse_id(&id)?;
    let configuration = state
        .orchestrator
        .attach_fee_payment(id, &request.fee_payment_ref)
        .await?;
    Ok(Json(configuration))
}

/// Start deploying; the work continues after the response
async fn start_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<DeploymentStatusReport>), ApiError> {
    let id = parse_id(&id)?;
    state.orchestrator.start_deployment(id).await?;
    let report = state.orchestrator.get_status(id).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// Retry one failed chain; the work continues after the response
async fn retry_chain(
    State(state): State<AppState>,
    Path((id, chain)): Path<(String, String)>,
) -> Result<(StatusCode, Json<DeploymentStatusReport>), ApiError> {
    let id = parse_id(&id)?;
    state.orchestrator.retry_chain(id, &chain).await?;
    let report = state.orchestrator.get_status(id).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

fn parse_id(id: &str) -> Result<Uuid, DeployerError> {
    Uuid::parse_str(id)
        .map_err(|_| DeployerError::Validation(format!("{} is not a configuration id", id)))
}

/// Maps orchestrator errors onto HTTP responses
struct ApiError(DeployerError);

impl From<DeployerError> for ApiError {
    fn from(e: DeployerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DeployerError::NotFound { .. } => StatusCode::NOT_FOUND,
            DeployerError::Validation(_) | DeployerError::UnknownChain(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployerError::InvalidState(_)
            | DeployerError::InvalidStateTransition { .. }
            | DeployerError::ContractAddressConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !self.0.is_client_error() {
            error!("API request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// Request and response types

#[derive(Deserialize)]
struct FeePaymentRequest {
    fee_payment_ref: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: String,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainsResponse {
    hub: String,
    chains: Vec<ChainInfo>,
    connected: Vec<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::test_registry;
    use crate::chain::ChainDeploymentClient;
    use crate::config::OrchestratorConfig;
    use crate::coordination::testing::{test_config, wait_for_status, ScriptedClient, FEE_REF};
    use crate::coordination::Orchestrator;
    use crate::error::ChainErrorCategory;
    use crate::model::{ConfigurationStatus, NewTokenConfiguration};
    use crate::state::MemoryStore;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::json;
    use tower::ServiceExt;

    fn app() -> (Router, Orchestrator) {
        app_with(
            crate::chain::MockChainDeploymentClient::new(),
            OrchestratorConfig {
                hub_chain: "ethereum".to_string(),
                ..OrchestratorConfig::default()
            },
        )
    }

    fn app_with<C>(client: C, config: OrchestratorConfig) -> (Router, Orchestrator)
    where
        C: ChainDeploymentClient + 'static,
    {
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(client),
            Arc::new(test_registry()),
            config,
        );
        let router = router(AppState {
            orchestrator: orchestrator.clone(),
            chain_manager: Arc::new(ChainManager::empty()),
        });
        (router, orchestrator)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post(
        router: Router,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    fn new_configuration(chains: &[&str]) -> serde_json::Value {
        json!({
            "creator": "0x1111111111111111111111111111111111111111",
            "name": "Rainbow Token",
            "symbol": "RBW",
            "decimals": 18,
            "total_supply": "1000000",
            "icon": null,
            "chains": chains,
        })
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let (router, _) = app();
        let (status, body) = get(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get(router, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_chains_lists_hub() {
        let (router, _) = app();
        let (status, body) = get(router, "/chains").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hub"], "ethereum");
        assert_eq!(body["chains"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_configuration_status() {
        let (router, orchestrator) = app();
        let configuration = orchestrator
            .create_configuration(NewTokenConfiguration {
                creator: "0x1111111111111111111111111111111111111111".to_string(),
                name: "Rainbow Token".to_string(),
                symbol: "RBW".to_string(),
                decimals: 18,
                total_supply: "1000".to_string(),
                icon: None,
                chains: vec!["ethereum".to_string(), "base".to_string()],
            })
            .await
            .unwrap();

        let (status, body) = get(
            router.clone(),
            &format!("/configurations/{}", configuration.id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["configuration"]["status"], "pending");
        assert_eq!(body["records"].as_array().unwrap().len(), 2);

        let (status, _) = get(router.clone(), &format!("/configurations/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(router, "/configurations/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats() {
        let (router, _) = app();
        let (status, body) = get(router, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["configurations"], 0);
    }

    #[tokio::test]
    async fn test_create_pay_and_start() {
        let client = ScriptedClient::new();
        let (router, orchestrator) = app_with(client.clone(), test_config());

        let (status, body) = post(
            router.clone(),
            "/configurations",
            Some(new_configuration(&["ethereum", "base"])),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        let id = body["id"].as_str().unwrap().to_string();

        let (status, _) = post(router.clone(), &format!("/configurations/{}/start", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(client.submissions("ethereum"), 0);

        let fee = format!("/configurations/{}/fee", id);
        let (status, _) = post(router.clone(), &fee, Some(json!({ "fee_payment_ref": "0x12" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = post(router.clone(), &fee, Some(json!({ "fee_payment_ref": FEE_REF }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fee_payment_ref"], FEE_REF);

        let (status, body) = post(router.clone(), &format!("/configurations/{}/start", id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["records"].as_array().unwrap().len(), 2);

        let id = Uuid::parse_str(&id).unwrap();
        wait_for_status(&orchestrator, id, ConfigurationStatus::Completed).await;

        let (status, body) = get(router, &format!("/configurations/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["configuration"]["status"], "completed");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_configuration() {
        let (router, _) = app_with(ScriptedClient::new(), test_config());

        let mut invalid = new_configuration(&["ethereum"]);
        invalid["decimals"] = json!(30);
        let (status, body) = post(router.clone(), "/configurations", Some(invalid)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = post(
            router.clone(),
            "/configurations",
            Some(new_configuration(&["polygon"])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post(
            router,
            &format!("/configurations/{}/start", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retry_failed_chain() {
        let client = ScriptedClient::new();
        client.fail_deploy("base", ChainErrorCategory::Reverted);
        let (router, orchestrator) = app_with(client.clone(), test_config());

        let (_, body) = post(
            router.clone(),
            "/configurations",
            Some(new_configuration(&["ethereum", "base"])),
        )
        .await;
        let id = Uuid::parse_str(body["id"].as_str().unwrap()).unwrap();
        post(
            router.clone(),
            &format!("/configurations/{}/fee", id),
            Some(json!({ "fee_payment_ref": FEE_REF })),
        )
        .await;
        post(router.clone(), &format!("/configurations/{}/start", id), None).await;
        wait_for_status(&orchestrator, id, ConfigurationStatus::Partial).await;

        let (status, _) = post(
            router.clone(),
            &format!("/configurations/{}/chains/ethereum/retry", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = post(
            router.clone(),
            &format!("/configurations/{}/chains/polygon/retry", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post(
            router,
            &format!("/configurations/{}/chains/base/retry", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        wait_for_status(&orchestrator, id, ConfigurationStatus::Completed).await;
        assert_eq!(client.submissions("base"), 2);
    }
}
