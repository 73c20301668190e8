//! HTTP API Server
//!
//! Operator surface for pushes, cluster status, and site availability.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::state::{NodeState, SiteState, XSiteStateTransferMode};
use crate::transfer::StateTransferManager;

/// Shared application state
pub struct AppState {
    pub manager: Arc<StateTransferManager>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, manager: Arc<StateTransferManager>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { manager }),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/status/cluster", get(handle_cluster_status))
            .route("/status/clear", post(handle_clear_status))
            .route("/transfers", get(handle_transfers))
            .route("/receiving", get(handle_receiving))
            // Per-site operations
            .route("/sites/:site/push", post(handle_push))
            .route("/sites/:site/cancel", post(handle_cancel))
            .route("/sites/:site/cancel-receive", post(handle_cancel_receive))
            .route("/sites/:site/online", post(handle_online))
            .route("/sites/:site/offline", post(handle_offline))
            .route("/sites/:site/mode", get(handle_get_mode).put(handle_set_mode))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Start the HTTP server on the configured address
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub site: String,
}

/// One backup site as seen by this node
#[derive(Debug, Serialize, Deserialize)]
pub struct SiteSummary {
    pub status: String,
    pub mode: XSiteStateTransferMode,
    pub state: Option<SiteState>,
}

/// Local status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub site: String,
    pub coordinator: bool,
    pub receiving_from: Option<String>,
    pub sites: BTreeMap<String, SiteSummary>,
    /// Local cluster view, coordinator first
    pub members: Vec<NodeState>,
}

/// Mode request/response
#[derive(Debug, Serialize, Deserialize)]
pub struct ModeBody {
    pub mode: XSiteStateTransferMode,
}

/// Receiving side response
#[derive(Debug, Serialize, Deserialize)]
pub struct ReceivingResponse {
    pub site: Option<String>,
}

/// Result of an operator action
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl OperationResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
        })
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Error::UnknownSite(_) => (StatusCode::NOT_FOUND, "UNKNOWN_SITE"),
            Error::TransferInProgress(_) => (StatusCode::CONFLICT, "TRANSFER_IN_PROGRESS"),
            Error::ConcurrentReceive { .. } => (StatusCode::CONFLICT, "CONCURRENT_RECEIVE"),
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            Error::Remote { .. } | Error::RemoteSite { .. } | Error::Aggregate(_) => {
                (StatusCode::BAD_GATEWAY, "REMOTE_FAILURE")
            }
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) | Error::SuspectNode(_) => {
                (StatusCode::BAD_GATEWAY, "UNREACHABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        error_response(status, code, self.to_string())
    }
}

fn unknown_site(site: &str) -> Response {
    Error::UnknownSite(site.to_string()).into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.manager.node_id().to_string(),
        site: state.manager.local_site().to_string(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = &state.manager;
    let sites = manager
        .get_status()
        .into_iter()
        .map(|(site, status)| {
            let summary = SiteSummary {
                status: status.as_text().to_string(),
                mode: manager.get_automatic_state_transfer(&site).unwrap_or_default(),
                state: manager.site_state(&site),
            };
            (site, summary)
        })
        .collect();

    Json(StatusResponse {
        node_id: manager.node_id().to_string(),
        site: manager.local_site().to_string(),
        coordinator: manager.membership().is_coordinator().await,
        receiving_from: manager.get_sending_site_name(),
        sites,
        members: manager.membership().all_nodes().await,
    })
}

async fn handle_cluster_status(State(state): State<Arc<AppState>>) -> Response {
    match state.manager.get_cluster_status().await {
        Ok(statuses) => {
            let text: BTreeMap<String, String> = statuses
                .into_iter()
                .map(|(site, status)| (site, status.as_text().to_string()))
                .collect();
            Json(text).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn handle_clear_status(State(state): State<Arc<AppState>>) -> Response {
    match state.manager.clear_cluster_status().await {
        Ok(()) => OperationResponse::ok("Status cleared").into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_transfers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.get_running_state_transfers())
}

async fn handle_receiving(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ReceivingResponse {
        site: state.manager.get_sending_site_name(),
    })
}

async fn handle_push(State(state): State<Arc<AppState>>, Path(site): Path<String>) -> Response {
    match state.manager.start_push_state(&site).await {
        Ok(()) => OperationResponse::ok(format!("Push to {} started", site)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_cancel(State(state): State<Arc<AppState>>, Path(site): Path<String>) -> Response {
    match state.manager.cancel_push_state(&site).await {
        Ok(()) => OperationResponse::ok(format!("Push to {} canceled", site)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_cancel_receive(
    State(state): State<Arc<AppState>>,
    Path(site): Path<String>,
) -> Response {
    match state.manager.cancel_receive(&site).await {
        Ok(()) => OperationResponse::ok(format!("Stopped receiving from {}", site)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_online(State(state): State<Arc<AppState>>, Path(site): Path<String>) -> Response {
    if state.manager.site_state(&site).is_none() {
        return unknown_site(&site);
    }
    let changed = state.manager.bring_site_online(&site);
    Json(OperationResponse {
        success: true,
        message: Some(if changed {
            format!("{} is now online", site)
        } else {
            format!("{} was already online", site)
        }),
    })
    .into_response()
}

async fn handle_offline(State(state): State<Arc<AppState>>, Path(site): Path<String>) -> Response {
    if state.manager.site_state(&site).is_none() {
        return unknown_site(&site);
    }
    let changed = state.manager.take_site_offline(&site);
    Json(OperationResponse {
        success: true,
        message: Some(if changed {
            format!("{} is now offline", site)
        } else {
            format!("{} was already offline", site)
        }),
    })
    .into_response()
}

async fn handle_get_mode(State(state): State<Arc<AppState>>, Path(site): Path<String>) -> Response {
    match state.manager.get_automatic_state_transfer(&site) {
        Some(mode) => Json(ModeBody { mode }).into_response(),
        None => unknown_site(&site),
    }
}

async fn handle_set_mode(
    State(state): State<Arc<AppState>>,
    Path(site): Path<String>,
    Json(body): Json<ModeBody>,
) -> Response {
    let Some(current) = state.manager.get_automatic_state_transfer(&site) else {
        return unknown_site(&site);
    };
    if current == body.mode || state.manager.set_automatic_state_transfer(&site, body.mode) {
        Json(ModeBody { mode: body.mode }).into_response()
    } else {
        error_response(
            StatusCode::BAD_REQUEST,
            "MODE_REJECTED",
            format!("Automatic state transfer is not supported for synchronous site {}", site),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::watch;

    use crate::cache::{IracForwarder, MemoryCache, XSiteState};
    use crate::config::{BackupConfig, BackupStrategy};
    use crate::rpc::Transport;
    use crate::state::ClusterMembership;
    use crate::transfer::{Command, Reply};

    /// Remote sites that accept everything
    struct AcceptAll;

    #[async_trait]
    impl Transport for AcceptAll {
        async fn invoke(&self, target: &str, _command: Command) -> Result<Reply> {
            Err(Error::SuspectNode(target.to_string()))
        }

        async fn invoke_site(&self, _site: &str, _command: Command, _timeout: Duration) -> Result<Reply> {
            Ok(Reply::Ack)
        }
    }

    async fn serve() -> (String, Arc<StateTransferManager>, watch::Sender<bool>) {
        let backups = vec![
            BackupConfig::new("NYC", "127.0.0.1:1", BackupStrategy::Async),
            BackupConfig::new("SFO", "127.0.0.1:1", BackupStrategy::Sync),
        ];
        let membership = Arc::new(ClusterMembership::from_view(
            "lon-1".to_string(),
            "127.0.0.1:7800".to_string(),
            vec![("lon-1".to_string(), "127.0.0.1:7800".to_string())],
            8,
            Duration::from_secs(5),
        ));
        membership.install_topology(false).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport: Arc<dyn Transport> = Arc::new(AcceptAll);
        let tracker = Arc::new(IracForwarder::spawn(
            "LON".to_string(),
            Arc::clone(&transport),
            &backups,
            shutdown_rx,
        ));
        let cache = Arc::new(MemoryCache::new());
        cache.insert(XSiteState::new(b"k".to_vec(), b"v".to_vec(), vec![], vec![]));

        let manager = StateTransferManager::new(
            "LON".to_string(),
            &backups,
            membership,
            transport,
            cache.clone(),
            cache,
            tracker,
        );
        manager.start().await.unwrap();

        let server = HttpServer::new(ApiConfig::default(), Arc::clone(&manager));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { server.serve(listener).await });

        (base, manager, shutdown_tx)
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (base, _manager, _shutdown) = serve().await;
        let client = reqwest::Client::new();

        let health: HealthResponse = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(health.healthy);
        assert_eq!(health.site, "LON");

        let status: StatusResponse = client
            .get(format!("{}/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(status.coordinator);
        assert_eq!(status.sites["NYC"].status, "IDLE");
        assert_eq!(status.sites["SFO"].state, Some(SiteState::Online));
        assert_eq!(status.receiving_from, None);
        assert_eq!(status.members.len(), 1);
        assert_eq!(status.members[0].id, "lon-1");
    }

    #[tokio::test]
    async fn test_push_and_cluster_status() {
        let (base, manager, _shutdown) = serve().await;
        let client = reqwest::Client::new();

        let response = client.post(format!("{}/sites/NYC/push", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.get_status()["NYC"].as_text() != "OK" {
            assert!(tokio::time::Instant::now() < deadline, "push never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let cluster: BTreeMap<String, String> = client
            .get(format!("{}/status/cluster", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cluster["NYC"], "OK");
        assert_eq!(cluster["SFO"], "IDLE");

        let response = client.post(format!("{}/status/clear", base)).send().await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(manager.get_status()["NYC"].as_text(), "IDLE");
    }

    #[tokio::test]
    async fn test_unknown_site() {
        let (base, _manager, _shutdown) = serve().await;
        let client = reqwest::Client::new();

        let response = client.post(format!("{}/sites/NO_SITE/push", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.code, "UNKNOWN_SITE");
        assert_eq!(body.error, "Unable to pushState to 'NO_SITE'. Incorrect site name: NO_SITE");

        let response = client.get(format!("{}/sites/NO_SITE/mode", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mode_changes() {
        let (base, manager, _shutdown) = serve().await;
        let client = reqwest::Client::new();

        let response = client
            .put(format!("{}/sites/NYC/mode", base))
            .json(&ModeBody {
                mode: XSiteStateTransferMode::Auto,
            })
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            manager.get_automatic_state_transfer("NYC"),
            Some(XSiteStateTransferMode::Auto)
        );

        let response = client
            .put(format!("{}/sites/SFO/mode", base))
            .json(&ModeBody {
                mode: XSiteStateTransferMode::Auto,
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(
            manager.get_automatic_state_transfer("SFO"),
            Some(XSiteStateTransferMode::Manual)
        );
    }

    #[tokio::test]
    async fn test_offline_and_online() {
        let (base, manager, _shutdown) = serve().await;
        let client = reqwest::Client::new();

        let response = client.post(format!("{}/sites/NYC/offline", base)).send().await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(manager.site_state("NYC"), Some(SiteState::Offline));

        let response = client.post(format!("{}/sites/NYC/online", base)).send().await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(manager.site_state("NYC"), Some(SiteState::Online));
    }
}
