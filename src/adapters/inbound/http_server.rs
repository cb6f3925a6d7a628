//! HTTP Server
//!
//! ip-api compatible HTTP front end. Turns `/json` and `/batch` requests into
//! batcher submissions and renders the results as JSON.

use crate::application::Batcher;
use crate::domain::entities::{FailureKind, LookupKey, LookupResult};
use crate::domain::value_objects::{Fields, Language};
use crate::infrastructure::ShutdownController;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Request limits for the HTTP front end.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// How long a request waits for its lookups
    pub submit_timeout: Duration,
    /// Maximum entries in one `/batch` request
    pub max_batch_request: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(30),
            max_batch_request: 100,
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct HttpState {
    pub batcher: Batcher,
    pub limits: HttpLimits,
}

/// `fields` / `lang` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct LookupParams {
    pub fields: Option<String>,
    pub lang: Option<String>,
}

/// `fields` inside a batch entry: names or a numeric mask.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldsParam {
    Mask(u32),
    Names(String),
}

/// One entry of a `/batch` request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Query(String),
    Detailed {
        query: String,
        #[serde(default)]
        fields: Option<FieldsParam>,
        #[serde(default)]
        lang: Option<String>,
    },
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub cache_entries: usize,
    pub cache_bytes: usize,
    pub cache_capacity: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Copy)]
struct LookupOptions {
    fields: Fields,
    lang: Language,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            fields: Fields::DEFAULT,
            lang: Language::English,
        }
    }
}

impl LookupOptions {
    fn from_params(params: &LookupParams) -> Result<Self, String> {
        Self::default().with(params.fields.as_deref(), params.lang.as_deref())
    }

    /// Override with per-request values, keeping `self` for missing ones.
    fn with(self, fields: Option<&str>, lang: Option<&str>) -> Result<Self, String> {
        let fields = match fields {
            Some(raw) => Fields::parse(raw).ok_or_else(|| format!("invalid fields: {}", raw))?,
            None => self.fields,
        };
        let lang = lang.map(Language::from_code).unwrap_or(self.lang);
        Ok(Self { fields, lang })
    }
}

/// HTTP server for lookups.
pub struct HttpServer {
    listen_addr: String,
    state: HttpState,
    shutdown: ShutdownController,
}

impl HttpServer {
    pub fn new(
        listen_addr: String,
        batcher: Batcher,
        limits: HttpLimits,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            listen_addr,
            state: HttpState { batcher, limits },
            shutdown,
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone(), self.shutdown.clone())
    }

    /// Serve until shutdown is initiated.
    ///
    /// Stops accepting connections as soon as shutdown starts; bounding how
    /// long open requests may take is up to the caller.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("listening on {}", self.listen_addr);

        let shutdown = self.shutdown.clone();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

        tracing::info!("listener closed");
        Ok(())
    }
}

/// Build the router. Exposed for tests.
pub fn router(state: HttpState, shutdown: ShutdownController) -> Router {
    Router::new()
        .route("/json", get(lookup_self_handler))
        .route("/json/", get(lookup_self_handler))
        .route("/json/:query", get(lookup_handler))
        .route("/batch", post(batch_handler))
        .route("/health", get(health_handler))
        .layer(middleware::from_fn_with_state(shutdown, track_in_flight))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_in_flight(
    State(shutdown): State<ShutdownController>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = shutdown.request_guard();
    next.run(request).await
}

fn json_response(status: StatusCode, body: impl Into<Body>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body.into(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    json_response(
        status,
        serde_json::json!({ "status": "fail", "message": message }).to_string(),
    )
}

/// Status code for a single-lookup result.
fn status_for(result: &LookupResult) -> StatusCode {
    match result.failure_kind() {
        None | Some(FailureKind::Invalid) | Some(FailureKind::Rejected) => StatusCode::OK,
        Some(FailureKind::Missing) => StatusCode::BAD_GATEWAY,
        Some(FailureKind::Unavailable) => StatusCode::SERVICE_UNAVAILABLE,
        Some(FailureKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn invalid_query() -> LookupResult {
    LookupResult::failure(FailureKind::Invalid, "invalid query")
}

async fn lookup_single(state: &HttpState, query: &str, params: &LookupParams) -> Response {
    let options = match LookupOptions::from_params(params) {
        Ok(options) => options,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    let result = match query.parse::<IpAddr>() {
        Ok(ip) => {
            let key = LookupKey::new(ip, options.fields, options.lang);
            state
                .batcher
                .submit_with_timeout(key, state.limits.submit_timeout)
                .await
        }
        Err(_) => invalid_query(),
    };

    if let LookupResult::Failure(failure) = &result {
        tracing::debug!("lookup {} failed: {}", query, failure);
    }

    json_response(status_for(&result), result.to_record(query))
}

async fn lookup_handler(
    State(state): State<HttpState>,
    Path(query): Path<String>,
    Query(params): Query<LookupParams>,
) -> Response {
    lookup_single(&state, &query, &params).await
}

/// `GET /json` looks up the caller's own address.
async fn lookup_self_handler(
    State(state): State<HttpState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<LookupParams>,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) => lookup_single(&state, &addr.ip().to_string(), &params).await,
        None => json_response(StatusCode::OK, invalid_query().to_record("")),
    }
}

async fn batch_handler(
    State(state): State<HttpState>,
    Query(params): Query<LookupParams>,
    Json(entries): Json<Vec<BatchEntry>>,
) -> Response {
    if entries.len() > state.limits.max_batch_request {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            &format!(
                "too many queries: {} (max {})",
                entries.len(),
                state.limits.max_batch_request
            ),
        );
    }

    let defaults = match LookupOptions::from_params(&params) {
        Ok(options) => options,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    let mut queries = Vec::with_capacity(entries.len());
    let mut results: Vec<Option<LookupResult>> = Vec::with_capacity(entries.len());
    let mut to_submit = Vec::new();
    let mut positions = Vec::new();

    for (i, entry) in entries.into_iter().enumerate() {
        let (query, fields, lang) = match entry {
            BatchEntry::Query(query) => (query, None, None),
            BatchEntry::Detailed { query, fields, lang } => {
                let fields = fields.map(|f| match f {
                    FieldsParam::Mask(mask) => mask.to_string(),
                    FieldsParam::Names(names) => names,
                });
                (query, fields, lang)
            }
        };

        let key = match (
            query.parse::<IpAddr>(),
            defaults.with(fields.as_deref(), lang.as_deref()),
        ) {
            (Ok(ip), Ok(options)) => Some(LookupKey::new(ip, options.fields, options.lang)),
            (Err(_), _) => {
                results.push(Some(invalid_query()));
                None
            }
            (_, Err(message)) => {
                results.push(Some(LookupResult::failure(FailureKind::Invalid, message)));
                None
            }
        };

        if let Some(key) = key {
            results.push(None);
            to_submit.push(key);
            positions.push(i);
        }
        queries.push(query);
    }

    let resolved = state
        .batcher
        .submit_many(to_submit, Some(state.limits.submit_timeout))
        .await;
    for (i, result) in positions.into_iter().zip(resolved) {
        results[i] = Some(result);
    }

    let mut body = BytesMut::new();
    body.put_u8(b'[');
    for (i, (query, result)) in queries.iter().zip(results).enumerate() {
        if i > 0 {
            body.put_u8(b',');
        }
        let record = result.unwrap_or_else(invalid_query).to_record(query);
        body.put_slice(&record);
    }
    body.put_u8(b']');

    json_response(StatusCode::OK, body.freeze())
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let cache = state.batcher.cache();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache_entries: cache.len(),
        cache_bytes: cache.size(),
        cache_capacity: cache.capacity(),
        pending: state.batcher.pending_count(),
    })
}
