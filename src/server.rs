//! The meta service HTTP surface.
//!
//! Five endpoints, exactly as the remote client consumes them: GET / is the
//! long-poll snapshot, POST /execute submits a command envelope, GET /ping
//! checks liveness, GET /lease acquires an advisory lease, POST /add-meta
//! joins a meta node. The handlers stay thin: every decision (redirect vs.
//! serve, long-poll wake-up, lease arbitration) lives in Store. axum runs on
//! a private tokio runtime thread and bridges into the synchronous store via
//! spawn_blocking.

use crate::data::NodeInfo;
use crate::error::{Error, Result};
use crate::store::Store;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Deserialize;
use tokio::sync::oneshot;

/// The meta service HTTP server.
pub struct Server {
    store: Store,
    addr: std::net::SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<Result<()>>>,
}

impl Server {
    /// Serves the meta service API for the store on the given listener, in
    /// a background thread with its own runtime.
    pub fn serve(store: Store, listener: std::net::TcpListener) -> Result<Server> {
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server_store = store.clone();
        let thread = std::thread::spawn(move || Self::run(server_store, listener, shutdown_rx));
        info!("Meta service listening on {addr}");
        Ok(Server { store, addr, shutdown: Some(shutdown_tx), thread: Some(thread) })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    fn run(
        store: Store,
        listener: std::net::TcpListener,
        shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        let router = Router::new()
            .route("/", get(snapshot))
            .route("/execute", post(execute))
            .route("/ping", get(ping))
            .route("/lease", get(lease))
            .route("/add-meta", post(add_meta))
            .with_state(store);

        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
        runtime.block_on(async move {
            listener.set_nonblocking(true)?;
            let listener = tokio::net::TcpListener::from_std(listener)?;
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown.await.ok();
                })
                .await?;
            Ok(())
        })
    }

    /// Shuts down: closes the store (waking any parked long-polls so their
    /// connections can finish) and waits for the server thread to exit.
    pub fn close(mut self) -> Result<()> {
        self.store.close()?;
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| Error::IO("meta server thread panicked".into()))??;
        }
        Ok(())
    }
}

/// Runs a blocking store call off the async worker threads.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f).await.map_err(|err| Error::IO(err.to_string()))?
}

/// Builds a 307 redirect to the leader's HTTP address.
fn redirect(host: &str, path: &str) -> Response {
    (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, format!("http://{host}{path}"))])
        .into_response()
}

/// Maps a store error onto the HTTP surface.
fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::Abort | Error::Unavailable(_) | Error::Redirect(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::InvalidInput(_) | Error::InvalidData(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

#[derive(Deserialize)]
struct SnapshotQuery {
    index: Option<u64>,
}

/// GET /?index=N: long-polls until the document is newer than N, then
/// returns it serialized.
async fn snapshot(State(store): State<Store>, Query(query): Query<SnapshotQuery>) -> Response {
    let index = query.index.unwrap_or(0);
    match blocking(move || store.snapshot_after(index)).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /execute: proposes a command envelope on the leader, or redirects.
async fn execute(State(store): State<Store>, body: Bytes) -> Response {
    match blocking(move || store.execute(body.to_vec())).await {
        Ok(response) => (StatusCode::OK, response).into_response(),
        Err(Error::Redirect(host)) => redirect(&host, "/execute"),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct PingQuery {
    all: Option<bool>,
}

/// GET /ping[?all=true]: liveness, optionally of the whole quorum.
async fn ping(State(store): State<Store>, Query(query): Query<PingQuery>) -> Response {
    match store.ping(query.all.unwrap_or(false)) {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct LeaseQuery {
    name: String,
    nodeid: Option<u64>,
}

/// GET /lease?name=&nodeid=: grants or refuses an advisory lease.
async fn lease(State(store): State<Store>, Query(query): Query<LeaseQuery>) -> Response {
    match blocking(move || store.acquire_lease(&query.name, query.nodeid.unwrap_or(0))).await {
        Ok(lease) => (StatusCode::OK, Json(lease)).into_response(),
        // Lease contention is a conflict, not a failure.
        Err(Error::InvalidInput(msg)) => (StatusCode::CONFLICT, msg).into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /add-meta: joins a meta node, redirecting to the leader if needed.
async fn add_meta(State(store): State<Store>, Json(node): Json<NodeInfo>) -> Response {
    match blocking(move || store.add_meta_node(&node)).await {
        Ok(node) => (StatusCode::OK, Json(node)).into_response(),
        Err(Error::Redirect(host)) => redirect(&host, "/add-meta"),
        Err(err) => error_response(err),
    }
}
