//! Purpose: Serve one table over HTTP as chunked newline-delimited JSON.
//! Exports: `ServeConfig`, `serve`, `validate_config`.
//! Role: Axum router for `/bulk-data`, `/bulk-data-paginated`, `/count-records`.
//! Invariants: Invalid page params are rejected before any query runs.
//! Invariants: At most one serialized chunk is buffered per streaming request.
//! Notes: A dump that fails after its first line ends with an `{"error":...}` line.

use axum::body::Body;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tablestream::core::error::{Error, ErrorKind};
use tablestream::core::export::{
    DEFAULT_PAGE_CHUNK_SIZE, DumpOptions, INVALID_PAGE_MESSAGE, count_records, dump_lines,
    export_page, prepare_dump,
};
use tablestream::core::store::{Store, StoreConfig};
use tablestream::core::table::TableName;
use tablestream::core::writer::ChunkWriter;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub store: StoreConfig,
    pub table: TableName,
    pub chunks_dir: PathBuf,
    pub paginated_dir: PathBuf,
    pub dump: DumpOptions,
}

struct AppState {
    store: Store,
    table: TableName,
    dump: DumpOptions,
    dump_writer: ChunkWriter,
    page_writer: ChunkWriter,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let store = Store::open(config.store.clone())?;
    let state = Arc::new(AppState {
        store: store.clone(),
        table: config.table.clone(),
        dump: config.dump,
        dump_writer: ChunkWriter::new(&config.chunks_dir),
        page_writer: ChunkWriter::new(&config.paginated_dir),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/bulk-data", get(bulk_data))
        .route("/bulk-data-paginated", get(bulk_data_paginated))
        .route("/count-records", get(count))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    info!(
        bind = %config.bind,
        table = config.table.as_str(),
        database = %store.config().path.display(),
        max_idle = store.config().max_idle,
        "listening"
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => result.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("server failed")
                .with_source(err)
        }),
        _ = shutdown_signal() => {
            info!("shutting down");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                }),
                Err(_) => Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out")),
            }
        }
    };
    store.close();
    result
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.dump.chunk_size == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--dump-chunk-size must be greater than zero")
            .with_hint("Use a positive value like 1000."));
    }

    if config.dump.limit == Some(0) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--dump-limit must be greater than zero")
            .with_hint("Use --no-dump-limit to export the whole table."));
    }

    if config.chunks_dir == config.paginated_dir {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--chunks-dir and --paginated-dir must differ")
            .with_hint("Paginated exports overwrite part_1.json in their directory."));
    }

    Ok(())
}

/// Logs go to stderr so `dump` and `page` keep stdout for data lines.
pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<i64>,
    chunk_size: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

impl ErrorEnvelope {
    fn from_error(err: &Error) -> Self {
        Self {
            error: ErrorBody {
                kind: format!("{:?}", err.kind()),
                message: err.message().unwrap_or("error").to_string(),
                hint: err.hint().map(str::to_string),
                path: err.path().map(|path| path.to_string_lossy().to_string()),
            },
        }
    }
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn bulk_data(State(state): State<Arc<AppState>>) -> Response {
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), Error>>();
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    tokio::task::spawn_blocking(move || stream_dump(&state, ready_tx, tx));

    match ready_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return error_response(err),
        Err(_) => {
            return error_response(
                Error::new(ErrorKind::Internal).with_message("dump task ended unexpectedly"),
            );
        }
    }

    let stream = ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Runs a dump on a blocking thread, feeding lines into `tx`.
///
/// `ready` resolves once the first chunk is persisted (or the table is empty),
/// so failures up to that point still become an error status. Later failures
/// are reported in-band as a final error line.
fn stream_dump(
    state: &AppState,
    ready: oneshot::Sender<Result<(), Error>>,
    tx: mpsc::Sender<Bytes>,
) {
    let mut ready = Some(ready);
    if let Err(err) = drive_dump(state, &mut ready, &tx) {
        match ready.take() {
            Some(ready) => {
                let _ = ready.send(Err(err));
            }
            None => {
                error!(error = %err, "dump failed mid-stream");
                let _ = tx.blocking_send(Bytes::from(truncation_line(&err)));
            }
        }
    }
}

fn drive_dump(
    state: &AppState,
    ready: &mut Option<oneshot::Sender<Result<(), Error>>>,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), Error> {
    let conn = state.store.connect()?;
    let mut stmt = prepare_dump(&conn, &state.table)?;
    let mut lines = dump_lines(&mut stmt, state.dump, &state.dump_writer)?;
    let first = lines.next().transpose()?;
    if let Some(ready) = ready.take() {
        if ready.send(Ok(())).is_err() {
            return Ok(());
        }
    }

    for line in first.into_iter().map(Ok::<String, Error>).chain(lines) {
        if tx.blocking_send(Bytes::from(line?)).is_err() {
            debug!("client disconnected; stopping dump");
            break;
        }
    }
    Ok(())
}

fn truncation_line(err: &Error) -> String {
    let mut line = serde_json::to_string(&ErrorEnvelope::from_error(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    line.push('\n');
    line
}

fn page_params(query: PageQuery) -> Result<(u64, u64), Error> {
    let page = query.page.unwrap_or(1);
    let chunk_size = query
        .chunk_size
        .unwrap_or(DEFAULT_PAGE_CHUNK_SIZE as i64);
    match (u64::try_from(page), u64::try_from(chunk_size)) {
        (Ok(page), Ok(chunk_size)) if page >= 1 && chunk_size >= 1 => Ok((page, chunk_size)),
        _ => Err(Error::new(ErrorKind::Usage).with_message(INVALID_PAGE_MESSAGE)),
    }
}

async fn bulk_data_paginated(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return error_response(
                Error::new(ErrorKind::Usage)
                    .with_message(rejection.body_text())
                    .with_hint("page and chunk_size must be integers."),
            );
        }
    };
    let (page, chunk_size) = match page_params(query) {
        Ok(params) => params,
        Err(err) => return error_response(err),
    };

    let result = tokio::task::spawn_blocking(move || {
        let conn = state.store.connect()?;
        export_page(&conn, &state.table, page, chunk_size, &state.page_writer)
    })
    .await;
    match flatten_join(result) {
        Ok(line) => {
            let mut response = Response::new(Body::from(line));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => error_response(err),
    }
}

async fn count(State(state): State<Arc<AppState>>) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        let conn = state.store.connect()?;
        count_records(&conn, &state.table)
    })
    .await;
    match flatten_join(result) {
        Ok(total) => json_response(json!({ "total_records": total })),
        Err(err) => error_response(err),
    }
}

fn flatten_join<T>(result: Result<Result<T, Error>, tokio::task::JoinError>) -> Result<T, Error> {
    result.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("request task failed")
            .with_source(err)
    })?
}

fn json_response(payload: serde_json::Value) -> Response {
    Json(payload).into_response()
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Store | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    (status, Json(ErrorEnvelope::from_error(&err))).into_response()
}
