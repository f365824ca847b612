//! Socket channel. Accepts and parses `GET /<action>?k=v` requests on its own
//! OS thread, authenticates them and parks them in the [`RequestQueue`]. It
//! never touches the host; the worker answers through a oneshot sink.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use scenegate_kernel::session::token_matches;
use scenegate_kernel::{Command, KernelError};
use tokio::sync::{broadcast, oneshot};

use crate::config::HttpConfig;
use crate::error::BridgeError;
use crate::queue::{PendingRequest, Reply, RequestQueue};

#[derive(Clone)]
struct IntakeState {
    queue: RequestQueue,
    nonce: Arc<str>,
    token_header: Arc<str>,
    capability_header: Arc<str>,
    response_timeout: Duration,
}

/// Running listener thread. Dropping it without [`HttpListener::stop`] leaves
/// the thread serving until the process exits.
#[derive(Debug)]
pub struct HttpListener {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl HttpListener {
    /// Binds synchronously so the caller learns about port conflicts (and the
    /// real port when binding `:0`) before the thread starts.
    pub fn spawn(config: &HttpConfig, queue: RequestQueue, nonce: &str) -> Result<Self, BridgeError> {
        let bind_err = |source| BridgeError::Bind {
            addr: config.bind,
            source,
        };
        let listener = std::net::TcpListener::bind(config.bind).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;

        let state = IntakeState {
            queue,
            nonce: Arc::from(nonce),
            token_header: Arc::from(config.token_header.as_str()),
            capability_header: Arc::from(config.capability_header.as_str()),
            response_timeout: config.response_timeout,
        };
        let app = Router::new().fallback(intake).with_state(state);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let thread = std::thread::Builder::new()
            .name("scenegate-http".into())
            .spawn(move || run(listener, app, shutdown_rx))
            .map_err(|source| BridgeError::Io {
                path: "scenegate-http".into(),
                source,
            })?;
        tracing::info!("HTTP listener on http://{addr}");
        Ok(Self {
            addr,
            shutdown_tx,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals graceful shutdown and joins the listener thread.
    pub fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("HTTP listener thread panicked");
            }
        }
        tracing::info!(addr = %self.addr, "HTTP listener stopped");
    }
}

fn run(listener: std::net::TcpListener, app: Router, mut shutdown_rx: broadcast::Receiver<()>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("HTTP runtime failed to start: {err}");
            return;
        }
    };
    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!("HTTP listener handoff failed: {err}");
                return;
            }
        };
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await;
        if let Err(err) = served {
            tracing::error!("HTTP server error: {err}");
        }
    });
}

async fn intake(
    State(state): State<IntakeState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let token = headers
        .get(&*state.token_header)
        .and_then(|value| value.to_str().ok());
    if !token.is_some_and(|token| token_matches(&state.nonce, token)) {
        return respond(Reply::error(
            StatusCode::UNAUTHORIZED,
            KernelError::Unauthorized.to_string(),
        ));
    }
    if method != Method::GET {
        return respond(Reply::error(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("method {method} not allowed"),
        ));
    }

    let command = match parse_command(&uri, &headers, &state.capability_header) {
        Ok(command) => command,
        Err(err) => return respond(Reply::ok(err.to_payload())),
    };
    tracing::debug!(action = command.action(), "queued HTTP request");

    let (reply_tx, reply_rx) = oneshot::channel();
    state.queue.push(PendingRequest {
        command,
        reply: reply_tx,
    });
    let reply = match tokio::time::timeout(state.response_timeout, reply_rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => Reply::error(StatusCode::SERVICE_UNAVAILABLE, "bridge is shutting down"),
        Err(_) => Reply::error(StatusCode::GATEWAY_TIMEOUT, "timed out waiting for the worker"),
    };
    respond(reply)
}

fn parse_command(uri: &Uri, headers: &HeaderMap, capability_header: &str) -> Result<Command, KernelError> {
    let action = uri.path().trim_start_matches('/');
    if action.is_empty() {
        return Err(KernelError::MalformedCommand("missing action".into()));
    }
    let pairs = url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()));
    let capability = headers
        .get(capability_header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|tag| !tag.is_empty());
    Ok(Command::from_pairs(action, capability, pairs))
}

fn respond(reply: Reply) -> Response {
    (reply.status, axum::Json(reply.body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn path_and_query_become_a_command() {
        let uri: Uri = "/light/set-intensity?path=Key%20Light&intensity=4".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("X-Scenegate-Capability", HeaderValue::from_static("lighting"));
        let command = parse_command(&uri, &headers, "X-Scenegate-Capability").unwrap();
        assert_eq!(command.action(), "light/set-intensity");
        assert_eq!(command.arg("path"), Some("Key Light"));
        assert_eq!(command.arg("intensity"), Some("4"));
        assert_eq!(command.capability().map(|c| c.as_str()), Some("lighting"));
    }

    #[test]
    fn missing_capability_header_leaves_capability_unset() {
        let uri: Uri = "/status".parse().unwrap();
        let command = parse_command(&uri, &HeaderMap::new(), "X-Scenegate-Capability").unwrap();
        assert_eq!(command.action(), "status");
        assert!(command.capability().is_none());
        assert!(command.args().is_empty());
    }

    #[test]
    fn root_path_is_malformed() {
        let uri: Uri = "/?x=1".parse().unwrap();
        let err = parse_command(&uri, &HeaderMap::new(), "X-Scenegate-Capability").unwrap_err();
        assert_eq!(err.code(), "MALFORMED_COMMAND");
    }
}
