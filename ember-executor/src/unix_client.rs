//! One-shot HTTP/1.1 exchanges with the Firecracker control socket.
//!
//! Each call opens a fresh `UnixStream`, performs a single request with
//! hyper's low-level connection API, and hands the raw status and body back
//! to [`crate::api`], which owns the success rules.

use std::path::Path;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::ExecutorError;

/// Status and body of one exchange.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

fn transport(context: &str, e: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::ApiRequest(format!("{context}: {e}"))
}

/// Send `method path` with an optional JSON body over `socket`.
///
/// Firecracker requires a `Host` header but ignores its value.
///
/// # Errors
/// Returns [`ExecutorError::ApiRequest`] if the socket cannot be reached or
/// the HTTP exchange breaks off. Any status, including errors, is a
/// successful exchange.
pub(crate) async fn exchange(
    socket: &Path,
    method: Method,
    path: &str,
    json: Option<String>,
) -> Result<RawResponse, ExecutorError> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| transport(&format!("connect to {}", socket.display()), e))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| transport("HTTP handshake", e))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "control socket connection ended");
        }
    });

    let mut request = Request::builder()
        .method(method.clone())
        .uri(path)
        .header("Host", "localhost")
        .header("Accept", "application/json");
    let payload = match json {
        Some(json) => {
            request = request
                .header("Content-Type", "application/json")
                .header("Content-Length", json.len());
            Bytes::from(json)
        }
        None => Bytes::new(),
    };
    let request = request
        .body(Full::new(payload))
        .map_err(|e| transport(&format!("build request {method} {path}"), e))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| transport(&format!("send {method} {path}"), e))?;
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|e| transport("read response body", e))?
        .to_bytes();

    tracing::debug!(%method, path, status = status.as_u16(), "control socket exchange");
    Ok(RawResponse {
        status,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    })
}
