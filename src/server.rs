//! Stand-alone CMP responder
//!
//! Serves the mock server over HTTP: every POST (any path) carrying an
//! `application/pkixcmp` body is answered by [`MockServer::process`]. The
//! responder stops after `max_msgs` answered messages, or never if 0.

use crate::error::{CmpError, Result};
use crate::http_client::CONTENT_TYPE;
use crate::mock_server::MockServer;
use crate::protocol::{decode_message, encode_message};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone)]
struct ResponderState {
    server: Arc<Mutex<MockServer>>,
    served: Arc<AtomicU64>,
    max_msgs: u64,
    done: Arc<Notify>,
}

/// Decode a request, let the mock server answer it, encode the response
pub fn handle_message(server: &Mutex<MockServer>, body: &[u8]) -> Result<Vec<u8>> {
    let request = decode_message(body)?;
    let response = {
        let mut guard = server
            .lock()
            .map_err(|_| CmpError::Transport("mock server state is poisoned".to_string()))?;
        guard.process(&request)?
    };
    encode_message(&response)
}

async fn handle_post(State(state): State<ResponderState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(ct) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        if !ct.eq_ignore_ascii_case(CONTENT_TYPE) {
            log::warn!("request with unexpected content type '{}'", ct);
        }
    }
    let result = handle_message(&state.server, &body);
    let response = match result {
        Ok(bytes) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], bytes).into_response(),
        Err(CmpError::Decode(msg)) => {
            log::error!("cannot decode request: {}", msg);
            (StatusCode::BAD_REQUEST, "malformed CMP request").into_response()
        }
        Err(e) => {
            log::error!("cannot answer request: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "CMP processing failed").into_response()
        }
    };
    let served = state.served.fetch_add(1, Ordering::SeqCst) + 1;
    log::info!("answered message {}", served);
    if state.max_msgs > 0 && served >= state.max_msgs {
        log::info!("maximum number of messages ({}) served, stopping", state.max_msgs);
        state.done.notify_one();
    }
    response
}

/// Serve on an already bound listener until `max_msgs` messages were answered
///
/// # Returns
/// * `u64` - Number of messages answered
pub fn run_responder_on(listener: std::net::TcpListener, max_msgs: u64, server: MockServer) -> Result<u64> {
    let state = ResponderState {
        server: Arc::new(Mutex::new(server)),
        served: Arc::new(AtomicU64::new(0)),
        max_msgs,
        done: Arc::new(Notify::new()),
    };
    let served = Arc::clone(&state.served);
    let done = Arc::clone(&state.done);

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CmpError::Transport(format!("cannot create async runtime: {}", e)))?;
    rt.block_on(async move {
        listener
            .set_nonblocking(true)
            .map_err(|e| CmpError::Transport(format!("cannot configure listener: {}", e)))?;
        let listener = tokio::net::TcpListener::from_std(listener)
            .map_err(|e| CmpError::Transport(format!("cannot use listener: {}", e)))?;
        let app = Router::new()
            .route("/", post(handle_post))
            .route("/*path", post(handle_post))
            .with_state(state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { done.notified().await })
            .await
            .map_err(|e| CmpError::Transport(format!("responder failed: {}", e)))
    })?;
    Ok(served.load(Ordering::SeqCst))
}

/// Bind `port` on all interfaces and serve
pub fn run_responder(port: &str, max_msgs: u64, server: MockServer) -> Result<u64> {
    let port: u16 = port
        .parse()
        .map_err(|_| CmpError::ProtocolConfig(format!("invalid -port '{}'", port)))?;
    let listener = std::net::TcpListener::bind(("0.0.0.0", port))
        .map_err(|e| CmpError::Transport(format!("cannot bind port {}: {}", port, e)))?;
    log::info!("CMP responder listening on port {}", port);
    run_responder_on(listener, max_msgs, server)
}
