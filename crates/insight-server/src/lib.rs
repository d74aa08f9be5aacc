use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use insight_config::Config;
use insight_contracts::{
    IntakeAccepted, IntakeRequest, QueryRecord, QueryStatus, QueueEvent, QueueEventRecord,
    SyncSummary, WorkMessage, WorkerReport,
};
use insight_kernel::{
    accept_prompt, default_watermark, format_watermark, sanitize_crm_record, synced_message,
    WORKER_CONTEXT,
};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

pub mod auth;
pub mod completion;
pub mod crm;
pub mod error;
pub mod queue;
pub mod store;

use auth::AuthGate;
use completion::CompletionClient;
use crm::CrmClient;
pub use error::ServiceError;
use queue::{QueueBackend, QueueError};
use store::{item_from, Item, KvStore, StoreError};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(build_router(AppState::new(cfg)?))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/ai/query", post(intake).get(query_status_missing_id))
        .route("/v1/ai/query/{id}", get(query_status))
        .route("/v1/customers", get(list_customers))
        .route("/v1/customers/sync", post(manual_sync))
        .route("/v1/internal/worker", post(worker_batch))
        .route("/v1/internal/poll", post(scheduled_sync))
        .with_state(state)
}

/// Drains one batch from the configured queue.
pub async fn run_worker_once(cfg: Config) -> Result<WorkerReport, String> {
    let state = AppState::new(cfg)?;
    let report = state.drain_queue().await.map_err(|e| e.to_string())?;
    let remaining = state.pending_messages().await.map_err(|e| e.to_string())?;
    tracing::info!(
        processed = report.processed,
        completed = report.completed,
        failed = report.failed,
        skipped = report.skipped,
        remaining,
        "worker run finished"
    );
    Ok(report)
}

pub async fn run_poll_once(cfg: Config) -> Result<SyncSummary, String> {
    let state = AppState::new(cfg)?;
    state.run_scheduled_sync().await.map_err(|e| e.to_string())
}

/// Creates any configured table that is missing and returns the created names.
pub async fn provision(cfg: Config) -> Result<Vec<String>, String> {
    let state = AppState::new(cfg)?;
    state.provision().await.map_err(|e| e.to_string())
}

pub fn issue_token(cfg: &Config, subject: &str, groups: &[String]) -> Result<String, String> {
    AuthGate::from_config(cfg)?.issue_token(subject, groups)
}

#[derive(Clone)]
pub struct AppState {
    cfg: Arc<Config>,
    store: Arc<Mutex<KvStore>>,
    queue: Arc<Mutex<QueueBackend>>,
    auth: Arc<AuthGate>,
    completion: Arc<CompletionClient>,
    crm: Arc<CrmClient>,
}

impl AppState {
    /// Builds every backend and client once from `cfg`.
    pub fn new(cfg: Config) -> Result<Self, String> {
        let store = KvStore::open(&cfg).map_err(|e| e.to_string())?;
        let queue = QueueBackend::open(&cfg).map_err(|e| e.to_string())?;
        Ok(Self {
            auth: Arc::new(AuthGate::from_config(&cfg)?),
            completion: Arc::new(CompletionClient::new(&cfg)?),
            crm: Arc::new(CrmClient::new(&cfg)?),
            store: Arc::new(Mutex::new(store)),
            queue: Arc::new(Mutex::new(queue)),
            cfg: Arc::new(cfg),
        })
    }

    /// Records a QUEUED query and enqueues it for the worker.
    pub async fn process_intake(&self, prompt: &str) -> Result<IntakeAccepted, ServiceError> {
        let query_id = Uuid::new_v4().to_string();
        self.write_query(&QueryRecord::queued(&query_id, prompt))
            .await?;

        let message = WorkMessage {
            query_id: query_id.clone(),
            prompt: prompt.to_string(),
        };
        let body =
            serde_json::to_string(&message).map_err(|e| QueueError::Backend(e.to_string()))?;
        let sent = {
            let mut queue = self.queue.lock().await;
            queue.send(&self.cfg.queue.name, &body)
        };
        match sent {
            Ok(message_id) => {
                tracing::info!(%query_id, %message_id, "query queued");
                Ok(IntakeAccepted {
                    query_id,
                    status: QueryStatus::Queued,
                })
            }
            Err(err) => {
                tracing::error!(%query_id, error = %err, "enqueue failed");
                let failed = QueryRecord::failed(&query_id, prompt, err.to_string());
                if let Err(write_err) = self.write_query(&failed).await {
                    tracing::error!(%query_id, error = %write_err, "could not mark query failed");
                }
                Err(err.into())
            }
        }
    }

    /// Runs each message independently; never fails as a whole.
    pub async fn process_worker_batch(&self, records: Vec<QueueEventRecord>) -> WorkerReport {
        let mut report = WorkerReport::default();
        for record in records {
            report.processed += 1;
            let message: WorkMessage = match serde_json::from_str(&record.body) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(
                        message_id = record.message_id.as_deref().unwrap_or("-"),
                        error = %err,
                        "skipping unparseable work message"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            let outcome = match self
                .completion
                .generate(&message.prompt, WORKER_CONTEXT)
                .await
            {
                Ok(text) => QueryRecord::completed(&message.query_id, &message.prompt, text),
                Err(err) => {
                    tracing::warn!(query_id = %message.query_id, error = %err, "query failed");
                    QueryRecord::failed(&message.query_id, &message.prompt, err.to_string())
                }
            };

            let completed = match self.write_query(&outcome).await {
                Ok(()) => outcome.status == QueryStatus::Completed,
                Err(err) if outcome.status == QueryStatus::Completed => {
                    // A completed answer that cannot be stored counts as a failure.
                    tracing::error!(query_id = %message.query_id, error = %err, "completed result write failed");
                    let failed =
                        QueryRecord::failed(&message.query_id, &message.prompt, err.to_string());
                    if let Err(err) = self.write_query(&failed).await {
                        tracing::error!(query_id = %message.query_id, error = %err, "could not mark query failed");
                    }
                    false
                }
                Err(err) => {
                    tracing::error!(query_id = %message.query_id, error = %err, "result write failed");
                    false
                }
            };

            if completed {
                report.completed += 1;
                tracing::info!(query_id = %message.query_id, "query completed");
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Receives one batch, processes it, then deletes every message in it.
    pub async fn drain_queue(&self) -> Result<WorkerReport, ServiceError> {
        let queue_name = &self.cfg.queue.name;
        let batch = {
            let mut queue = self.queue.lock().await;
            queue.receive(queue_name, self.cfg.queue.batch_size)?
        };
        if batch.is_empty() {
            tracing::debug!(queue = %queue_name, "queue empty");
            return Ok(WorkerReport::default());
        }

        let records = batch
            .iter()
            .map(|m| QueueEventRecord {
                message_id: Some(m.message_id.clone()),
                body: m.body.clone(),
            })
            .collect();
        let report = self.process_worker_batch(records).await;

        // An undeleted message comes back after the visibility timeout.
        let mut queue = self.queue.lock().await;
        for message in &batch {
            if let Err(err) = queue.delete(queue_name, &message.message_id) {
                tracing::warn!(message_id = %message.message_id, error = %err, "queue delete failed");
            }
        }
        Ok(report)
    }

    pub async fn pending_messages(&self) -> Result<usize, ServiceError> {
        let queue = self.queue.lock().await;
        Ok(queue.pending_count(&self.cfg.queue.name)?)
    }

    pub async fn query_status(&self, query_id: &str) -> Result<Item, ServiceError> {
        let mut store = self.store.lock().await;
        store
            .get(&self.cfg.tables.queries, query_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("query {query_id} not found")))
    }

    pub async fn list_customers(&self) -> Result<Vec<Item>, ServiceError> {
        let mut store = self.store.lock().await;
        Ok(store.scan(&self.cfg.tables.customers)?)
    }

    /// Copies every CRM contact into the customer table as returned.
    pub async fn run_manual_sync(&self) -> Result<SyncSummary, ServiceError> {
        let contacts = self.crm.list_contacts().await?;
        let count = contacts.len();
        {
            let mut store = self.store.lock().await;
            for contact in contacts {
                store.put(&self.cfg.tables.customers, contact)?;
            }
        }
        tracing::info!(count, "manual customer sync finished");
        Ok(SyncSummary {
            message: synced_message(count, "customers"),
        })
    }

    /// Incremental account sync. The watermark only moves forward, to the
    /// cycle start, after every record has been written.
    pub async fn run_scheduled_sync(&self) -> Result<SyncSummary, ServiceError> {
        let started_at = Utc::now();
        let watermark = self.read_watermark(started_at).await?;
        tracing::info!(%watermark, "polling accounts modified after watermark");

        let records = self.crm.list_accounts_since(&watermark).await?;
        let count = records.len();
        let mut store = self.store.lock().await;
        if count > 0 {
            store.put_batch(
                &self.cfg.tables.customers,
                records.into_iter().map(sanitize_crm_record),
            )?;
        }
        store.put_parameter(
            &self.cfg.watermark.parameter_name,
            &format_watermark(started_at),
        )?;
        tracing::info!(count, "scheduled account sync finished");
        Ok(SyncSummary {
            message: synced_message(count, "records"),
        })
    }

    pub async fn provision(&self) -> Result<Vec<String>, ServiceError> {
        let mut store = self.store.lock().await;
        let created = store.provision()?;
        for table in &created {
            tracing::info!(table = %table, "table created");
        }
        Ok(created)
    }

    async fn read_watermark(
        &self,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let name = &self.cfg.watermark.parameter_name;
        let mut store = self.store.lock().await;
        if let Some(value) = store.get_parameter(name)? {
            return Ok(value);
        }
        let fallback = format_watermark(default_watermark(
            started_at,
            self.cfg.watermark.default_lookback_hours,
        ));
        tracing::info!(parameter = %name, watermark = %fallback, "no watermark stored, using default");
        store.put_parameter(name, &fallback)?;
        Ok(fallback)
    }

    async fn write_query(&self, record: &QueryRecord) -> Result<(), StoreError> {
        let item = item_from(record)?;
        let mut store = self.store.lock().await;
        store.put(&self.cfg.tables.queries, item)
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

fn require_service(state: &AppState, headers: &HeaderMap) -> Result<(), ServiceError> {
    if state.auth.check_service(headers) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("Forbidden"))
    }
}

async fn intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IntakeAccepted>), ServiceError> {
    require_service(&state, &headers)?;
    let request: IntakeRequest = if body.is_empty() {
        IntakeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServiceError::Validation(format!("invalid request body: {e}")))?
    };
    let prompt = accept_prompt(request.prompt)
        .ok_or_else(|| ServiceError::Validation("Missing prompt".to_string()))?;
    let accepted = state.process_intake(&prompt).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn query_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Item>, ServiceError> {
    require_service(&state, &headers)?;
    if id.trim().is_empty() {
        return Err(ServiceError::Validation("Missing query_id".to_string()));
    }
    state.query_status(&id).await.map(Json)
}

async fn query_status_missing_id(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Item>, ServiceError> {
    require_service(&state, &headers)?;
    Err(ServiceError::Validation("Missing query_id".to_string()))
}

async fn list_customers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Item>>, ServiceError> {
    require_service(&state, &headers)?;
    state.list_customers().await.map(Json)
}

async fn manual_sync(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.auth.is_admin(&headers) {
        return ServiceError::Forbidden("Forbidden: Access is restricted to administrators.")
            .into_response();
    }
    match state.run_manual_sync().await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "manual customer sync failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn worker_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WorkerReport>, ServiceError> {
    require_service(&state, &headers)?;
    let event: QueueEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::Validation(format!("invalid queue event: {e}")))?;
    Ok(Json(state.process_worker_batch(event.records).await))
}

async fn scheduled_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SyncSummary>, ServiceError> {
    require_service(&state, &headers)?;
    state.run_scheduled_sync().await.map(Json)
}

#[cfg(test)]
pub(crate) mod test_support {
    use insight_config::Config;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/test-config.yaml");

    /// The shared fixture with sandbox and auth overrides cleared, so stores
    /// are strict unless a test opts back in.
    pub fn test_config() -> Config {
        let mut cfg = insight_config::load_and_validate(FIXTURE).expect("load test fixture");
        cfg.sandbox.enabled = false;
        cfg.auth.strict_auth = None;
        cfg
    }

    pub fn sqlite_config(name: &str) -> Config {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("insight-{name}-{nanos}.db"));
        let mut cfg = test_config();
        cfg.store.kind = "sqlite".to_string();
        cfg.store.sqlite_path = Some(path.to_string_lossy().to_string());
        cfg.queue.kind = "sqlite".to_string();
        cfg
    }
}
