//! Streaming endpoint for the balance bridge.
//!
//! - [`event`]: `weight` / `error` events and their NDJSON encoding
//! - [`publisher`]: shared poll loop with cancellable per-consumer feeds
//! - [`http`]: hyper server exposing the stream, status and control routes

pub mod event;
pub mod http;
pub mod publisher;

pub use event::StreamEvent;
pub use http::{start_http_server, HttpServerHandle, ServerState};
pub use publisher::{ReadingPublisher, Subscription};
