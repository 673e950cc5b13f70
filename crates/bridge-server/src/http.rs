//! HTTP surface of the bridge.
//!
//! | Method | Path            | Response                                          |
//! |--------|-----------------|---------------------------------------------------|
//! | GET    | `/weight/stream`| `200` NDJSON stream of events, `503` if disabled  |
//! | GET    | `/weight`       | one `weight` event, `502` on instrument error     |
//! | GET    | `/status`       | `{"state":"disabled|connected|disconnected"}`     |
//! | POST   | `/zero`         | `{"ok":true}`                                     |
//! | POST   | `/tare`         | `weight` event carrying the tare value            |
//! | GET    | `/health`       | `OK`                                              |
//!
//! The stream body is fed by a [`Subscription`](crate::publisher::Subscription);
//! when the client disconnects hyper drops the body, which drops the
//! subscription and detaches it from the publisher.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bridge_core::config::StreamConfig;
use bridge_core::{BalanceControl, BridgeError, WeightSource};
use futures::StreamExt;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::event::StreamEvent;
use crate::publisher::ReadingPublisher;

/// Content type of the streaming endpoint.
pub const NDJSON: &str = "application/x-ndjson";

/// Everything a request handler needs.
#[derive(Clone)]
pub struct ServerState {
    source: Arc<dyn WeightSource>,
    control: Arc<dyn BalanceControl>,
    publisher: ReadingPublisher,
}

impl ServerState {
    /// State for an instrument that can both be read and zeroed/tared.
    pub fn new<I>(instrument: Arc<I>, stream: &StreamConfig) -> Self
    where
        I: WeightSource + BalanceControl + 'static,
    {
        let source: Arc<dyn WeightSource> = instrument.clone();
        let control: Arc<dyn BalanceControl> = instrument;
        Self {
            publisher: ReadingPublisher::new(Arc::clone(&source), stream),
            source,
            control,
        }
    }

    /// The shared publisher.
    pub fn publisher(&self) -> &ReadingPublisher {
        &self.publisher
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("state", &self.source.connectivity())
            .field("publisher", &self.publisher)
            .finish_non_exhaustive()
    }
}

/// Handle to the running HTTP server.
#[derive(Debug)]
pub struct HttpServerHandle {
    local_addr: SocketAddr,
    publisher: ReadingPublisher,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HttpServerHandle {
    /// Address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// End all streams, stop accepting connections and wait for in-flight
    /// requests to finish.
    pub async fn shutdown(self) {
        self.publisher.close();
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "HTTP server task failed");
        }
    }
}

/// Bind `addr` and serve the bridge endpoints in a background task.
pub async fn start_http_server(
    addr: SocketAddr,
    state: ServerState,
) -> Result<HttpServerHandle, hyper::Error> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let publisher = state.publisher.clone();

    let make_service = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(state.clone(), req)))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);
    let local_addr = server.local_addr();
    let server = server.with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });

    tracing::info!(%local_addr, "balance bridge HTTP server listening");

    let task = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!(error = %e, "HTTP server error");
        }
        tracing::info!("HTTP server stopped");
    });

    Ok(HttpServerHandle {
        local_addr,
        publisher,
        shutdown_tx,
        task,
    })
}

async fn handle_request(
    state: ServerState,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    tracing::debug!(method = %req.method(), path = %req.uri().path(), "request");

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/weight/stream") => stream_weight(&state).await,
        (&Method::GET, "/weight") => match state.source.read_weight().await {
            Ok(reading) => json_response(StatusCode::OK, &StreamEvent::from(reading)),
            Err(e) => error_response(&e),
        },
        (&Method::GET, "/status") => json_response(
            StatusCode::OK,
            &json!({ "state": state.source.connectivity().as_status_str() }),
        ),
        (&Method::POST, "/zero") => match state.control.zero().await {
            Ok(()) => json_response(StatusCode::OK, &json!({ "ok": true })),
            Err(e) => error_response(&e),
        },
        (&Method::POST, "/tare") => match state.control.tare().await {
            Ok(tare) => json_response(StatusCode::OK, &StreamEvent::from(tare)),
            Err(e) => error_response(&e),
        },
        (&Method::GET, "/health") => text_response(StatusCode::OK, "OK"),
        (_, "/weight/stream" | "/weight" | "/status" | "/zero" | "/tare" | "/health") => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

async fn stream_weight(state: &ServerState) -> Response<Body> {
    let subscription = match state.publisher.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => return error_response(&e),
    };
    tracing::debug!(subscriber = subscription.id(), "streaming to HTTP client");

    let lines = subscription.map(|event| event.to_ndjson());
    let mut response = Response::new(Body::wrap_stream(lines));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Map a bridge error to a status code.
pub fn status_for(error: &BridgeError) -> StatusCode {
    match error {
        BridgeError::NotConfigured | BridgeError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::Connection(_) | BridgeError::Protocol(_) => StatusCode::BAD_GATEWAY,
        BridgeError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &BridgeError) -> Response<Body> {
    json_response(status_for(error), &json!({ "error": error.to_string() }))
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode response body");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding error")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{ConnectionError, ProtocolError};

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_for(&BridgeError::NotConfigured),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ConnectionError::Timeout.into()),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&ProtocolError::fault("+").into()),
            StatusCode::BAD_GATEWAY
        );
    }
}
