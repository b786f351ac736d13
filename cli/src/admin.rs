//! Admin HTTP surface.
//!
//! | Method | Path           | Body                                                  |
//! |--------|----------------|-------------------------------------------------------|
//! | GET    | `/status`      |                                                       |
//! | POST   | `/restart`     |                                                       |
//! | POST   | `/backfill`    | `{"contractAddress", "blockNumber", "resetLedger"?}`  |
//! | GET    | `/consistency` |                                                       |

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use chainledger_core::IndexerError;
use chainledger_evm::{CheckpointSummary, Indexer};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRequest {
    pub contract_address: String,
    pub block_number: u64,
    /// Abandon stored state from `block_number` on and reset the block ledger.
    #[serde(default)]
    pub reset_ledger: bool,
}

/// Maps [`IndexerError`] onto a status code and `{"error": ...}` body.
pub struct ApiError(IndexerError);

impl From<IndexerError> for ApiError {
    fn from(e: IndexerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            IndexerError::NotFound(_) => StatusCode::NOT_FOUND,
            IndexerError::Config(_) => StatusCode::BAD_REQUEST,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "admin request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router(indexer: Arc<Indexer>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/restart", post(restart))
        .route("/backfill", post(backfill))
        .route("/consistency", get(consistency))
        .with_state(indexer)
}

/// Serve the admin router on `listen` until `shutdown` resolves.
pub async fn serve(
    listen: &str,
    indexer: Arc<Indexer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("cannot bind admin listener on {listen}"))?;
    tracing::info!(address = %listen, "admin server listening");
    axum::serve(listener, router(indexer))
        .with_graceful_shutdown(shutdown)
        .await
        .context("admin server failed")
}

async fn status(State(indexer): State<Arc<Indexer>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(indexer.status().await?))
}

async fn restart(State(indexer): State<Arc<Indexer>>) -> Result<impl IntoResponse, ApiError> {
    tracing::info!("restart requested");
    indexer.restart().await?;
    Ok(Json(indexer.status().await?))
}

async fn backfill(
    State(indexer): State<Arc<Indexer>>,
    Json(req): Json<BackfillRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rewound = if req.reset_ledger {
        indexer.backfill_from_fork(&req.contract_address, req.block_number).await?
    } else {
        indexer.backfill(&req.contract_address, req.block_number).await?
    };
    let summaries: Vec<CheckpointSummary> = rewound.into_iter().map(CheckpointSummary::from).collect();
    Ok(Json(summaries))
}

async fn consistency(State(indexer): State<Arc<Indexer>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(indexer.check_consistency().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chainledger_core::testing::MockChain;
    use chainledger_core::source::EventDecoder;
    use chainledger_core::{BlockLedger, EventQuery, EventStatus, EventStore, MemoryStore, Storage};
    use chainledger_evm::{AbiEventDecoder, IndexerBuilder};
    use tower::ServiceExt;

    const CONTRACT: &str = "0x00000000000000000000000000000000000000aa";
    const PING: &str = "event Ping(uint256 n)";

    fn ping_topic() -> String {
        AbiEventDecoder::new(PING).unwrap().topic().to_string()
    }

    async fn indexer() -> Arc<Indexer> {
        let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let indexer = IndexerBuilder::new()
            .chain_id(1)
            .confirmation_threshold(2)
            .ledger_retention(16)
            .subscribe(CONTRACT, 100, [PING])
            .reader(Arc::new(MockChain::with_blocks(120)))
            .store(store)
            .build()
            .unwrap();
        indexer.ensure_checkpoints().await.unwrap();
        Arc::new(indexer)
    }

    async fn send(app: Router, method: &str, path: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(path);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_reports_checkpoints() {
        let idx = indexer().await;
        idx.tick().await.unwrap();

        let (status, json) = send(router(idx), "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["chainId"], 1);
        assert_eq!(json["running"], false);
        assert_eq!(json["head"], 120);
        assert_eq!(json["halted"], false);
        assert_eq!(json["subscriptions"][0]["contractAddress"], CONTRACT);
        assert_eq!(json["subscriptions"][0]["eventType"], "Ping");
        assert_eq!(json["subscriptions"][0]["lastProcessedBlock"], 118);
    }

    #[tokio::test]
    async fn backfill_rewinds_checkpoint() {
        let idx = indexer().await;
        idx.tick().await.unwrap();

        let body = serde_json::json!({ "contractAddress": CONTRACT, "blockNumber": 105 });
        let (status, json) = send(router(idx.clone()), "POST", "/backfill", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["lastProcessedBlock"], 104);
        assert_eq!(json[0]["status"], "backfilling");
    }

    #[tokio::test]
    async fn backfill_with_ledger_reset_orphans_stored_fork() {
        let chain = Arc::new(MockChain::with_blocks(120));
        chain.add_log_with(110, CONTRACT, vec![ping_topic()], &format!("0x{:064x}", 7), "0xaa01", 0);
        let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let idx = Arc::new(
            IndexerBuilder::new()
                .chain_id(1)
                .confirmation_threshold(2)
                .ledger_retention(16)
                .subscribe(CONTRACT, 100, [PING])
                .reader(chain)
                .store(store.clone())
                .build()
                .unwrap(),
        );
        idx.tick().await.unwrap();

        let body = serde_json::json!({ "contractAddress": CONTRACT, "blockNumber": 105, "resetLedger": true });
        let (status, json) = send(router(idx), "POST", "/backfill", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["lastProcessedBlock"], 104);

        let orphaned = store
            .count_events(&EventQuery::chain(1).status(EventStatus::Orphaned))
            .await
            .unwrap();
        assert_eq!(orphaned, 1);
        assert!(store.ledger_tip(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backfill_of_unknown_contract_is_404() {
        let idx = indexer().await;
        let body = serde_json::json!({
            "contractAddress": "0x00000000000000000000000000000000000000bb",
            "blockNumber": 1
        });
        let (status, json) = send(router(idx), "POST", "/backfill", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("no checkpoint"));
    }

    #[tokio::test]
    async fn restart_starts_the_indexer() {
        let idx = indexer().await;
        let (status, json) = send(router(idx.clone()), "POST", "/restart", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["running"], true);
        idx.stop().await;
    }

    #[tokio::test]
    async fn consistency_is_clean_after_ingest() {
        let idx = indexer().await;
        idx.tick().await.unwrap();
        let (status, json) = send(router(idx), "GET", "/consistency", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["chainId"], 1);
        assert_eq!(json["mismatches"].as_array().unwrap().len(), 0);
    }
}
