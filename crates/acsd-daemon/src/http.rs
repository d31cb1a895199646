//! HTTP front end for inbound CWMP sessions.
//!
//! Every request to the CWMP endpoint passes the Digest/Basic gate first.
//! A challenge answers with 401 and BOTH `WWW-Authenticate` values as
//! separate header lines (Digest first, then Basic) so firmware that only
//! speaks one scheme still finds its offer. An authenticated request opens
//! a device session: pending tasks are claimed for dispatch and tasks
//! awaiting verification are surfaced.
//!
//! The SOAP envelope itself is owned by the downstream CWMP layer; this
//! module only pulls the device serial out of the Inform to know whose
//! queue to open.

use std::net::SocketAddr;
use std::sync::Arc;

use acsd_core::auth::{AuthDecision, Authenticator};
use acsd_core::task::TaskManager;
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;

/// Longest device serial the Inform scan will accept.
const MAX_SERIAL_LEN: usize = 64;

/// Shared state for the CWMP endpoint.
pub struct AppState {
    /// The authentication gate.
    pub authenticator: Arc<Authenticator>,
    /// The task lifecycle manager.
    pub tasks: Arc<TaskManager>,
}

/// Build the CWMP router.
///
/// Devices are provisioned with a single ACS URL, so the endpoint accepts
/// any method on `/cwmp`; authentication treats them all identically.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/cwmp", any(cwmp_handler))
        .with_state(state)
}

async fn cwmp_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    body: String,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state
        .authenticator
        .authenticate(addr.ip(), method.as_str(), authorization)
    {
        AuthDecision::Challenge { nonce, opaque, .. } => {
            challenge_response(&state.authenticator, &nonce, &opaque)
        },
        AuthDecision::Authenticated { username } => {
            handle_session(&state, addr, &username, &body)
        },
    }
}

/// Build the 401 challenge response.
///
/// Both `WWW-Authenticate` values are emitted as separate header
/// occurrences, Digest first; merging them into one comma-joined line
/// confuses enough CPE firmware to be a field incident.
fn challenge_response(authenticator: &Authenticator, nonce: &str, opaque: &str) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    let headers = response.headers_mut();
    for value in authenticator.challenge_header_values(nonce, opaque) {
        match HeaderValue::try_from(value) {
            Ok(value) => {
                headers.append(header::WWW_AUTHENTICATE, value);
            },
            Err(_) => {
                // Config validation keeps the realm header-safe; reaching
                // this means the invariant broke upstream.
                tracing::error!("challenge header value not representable");
            },
        }
    }
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    response
}

fn handle_session(
    state: &AppState,
    addr: SocketAddr,
    username: &str,
    body: &str,
) -> Response {
    let Some(serial) = extract_device_serial(body) else {
        // Authenticated but not an Inform we can attribute (e.g. an empty
        // POST concluding a session): acknowledge without dispatch.
        tracing::debug!(client_ip = %addr.ip(), "authenticated request without device serial");
        return StatusCode::NO_CONTENT.into_response();
    };

    match state.tasks.begin_session(&serial) {
        Ok(plan) => {
            tracing::info!(
                client_ip = %addr.ip(),
                username = %username,
                device_id = %serial,
                dispatched = plan.dispatched.len(),
                awaiting_verification = plan.awaiting_verification.len(),
                "device session opened"
            );
            StatusCode::NO_CONTENT.into_response()
        },
        Err(err) => {
            tracing::error!(
                client_ip = %addr.ip(),
                device_id = %serial,
                error = %err,
                "failed to open device session"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "task store unavailable\n").into_response()
        },
    }
}

/// Pull the `SerialNumber` element out of a CWMP Inform body.
///
/// A bounded scan, not XML parsing: the serial sits in the Inform's
/// `DeviceIdStruct` and is the only thing the dispatch layer needs.
fn extract_device_serial(body: &str) -> Option<String> {
    let start = body.find("<SerialNumber>")? + "<SerialNumber>".len();
    let rest = &body[start..];
    let end = rest.find("</SerialNumber>")?;
    let serial = rest[..end].trim();
    if serial.is_empty() || serial.len() > MAX_SERIAL_LEN {
        return None;
    }
    Some(serial.to_string())
}
