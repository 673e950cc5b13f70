//! Reading publisher: one shared poll loop fanned out to many subscribers.
//!
//! A single poll task runs while at least one subscriber is attached. Each
//! tick it checks for live subscribers, asks the instrument for one reading
//! and broadcasts the result as a [`StreamEvent`]. Every subscriber sees the
//! same events in the same order, and the aggregate request rate to the
//! balance is bounded by the poll interval no matter how many consumers
//! are attached.
//!
//! Each subscriber gets its own forwarding task and bounded output queue.
//! Cancelling a subscription (explicitly, by dropping it, or because the
//! HTTP client went away) only stops that forwarder. It never touches the
//! instrument connection, the reconnect supervisor or other subscribers.
//! A subscriber that falls behind the fan-out buffer skips readings; it is
//! never sent stale ones.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bridge_core::config::StreamConfig;
use bridge_core::{BridgeError, BridgeResult, ConnectivityState, WeightSource};
use futures::Stream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;

use crate::event::StreamEvent;

struct Inner {
    source: Arc<dyn WeightSource>,
    events: broadcast::Sender<StreamEvent>,
    poll_interval: Duration,
    subscriber_capacity: usize,
    /// True while a poll task is running.
    polling: Mutex<bool>,
    closed: watch::Sender<bool>,
    next_id: AtomicU64,
}

/// Fans instrument readings out to subscribers.
#[derive(Clone)]
pub struct ReadingPublisher {
    inner: Arc<Inner>,
}

impl ReadingPublisher {
    /// Create a publisher polling `source` with the given stream settings.
    pub fn new(source: Arc<dyn WeightSource>, config: &StreamConfig) -> Self {
        let (events, _) = broadcast::channel(config.fanout_capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                source,
                events,
                poll_interval: config.poll_interval,
                subscriber_capacity: config.subscriber_capacity.max(1),
                polling: Mutex::new(false),
                closed,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a new subscriber.
    ///
    /// Fails immediately with [`BridgeError::NotConfigured`] when the
    /// instrument is disabled. A configured but disconnected instrument is
    /// accepted; its subscribers receive `error` events until the link
    /// comes back.
    pub async fn subscribe(&self) -> BridgeResult<Subscription> {
        if self.inner.source.connectivity() == ConnectivityState::Disabled {
            return Err(BridgeError::NotConfigured);
        }
        if *self.inner.closed.borrow() {
            return Err(BridgeError::ShutDown);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // Register with the fan-out before making sure a poller runs
        let feed = self.inner.events.subscribe();
        self.ensure_polling().await;

        let (out_tx, out_rx) = mpsc::channel(self.inner.subscriber_capacity);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let closed = self.inner.closed.subscribe();
        tokio::spawn(forward(id, feed, out_tx, cancel_rx, closed));

        tracing::info!(
            subscriber = id,
            active = self.inner.events.receiver_count(),
            "stream subscriber attached"
        );

        Ok(Subscription {
            id,
            events: ReceiverStream::new(out_rx),
            cancel: Some(cancel_tx),
        })
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    /// True while the shared poll task is running.
    pub async fn is_polling(&self) -> bool {
        *self.inner.polling.lock().await
    }

    /// End every subscription and stop polling.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
        tracing::info!("reading publisher closed");
    }

    async fn ensure_polling(&self) {
        let mut polling = self.inner.polling.lock().await;
        if !*polling {
            *polling = true;
            tokio::spawn(poll_loop(Arc::clone(&self.inner)));
        }
    }
}

impl std::fmt::Debug for ReadingPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingPublisher")
            .field("poll_interval", &self.inner.poll_interval)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

async fn poll_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closed = inner.closed.subscribe();
    tracing::debug!(interval_ms = inner.poll_interval.as_millis() as u64, "poll task started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = closed.changed() => break,
        }
        if *closed.borrow() {
            break;
        }

        {
            // Decide under the lock so a concurrent subscribe either sees
            // this task still running or starts a new one
            let mut polling = inner.polling.lock().await;
            if inner.events.receiver_count() == 0 {
                *polling = false;
                tracing::debug!("no subscribers left, poll task stopping");
                return;
            }
        }

        let event = StreamEvent::from_poll(inner.source.read_weight().await);
        if let StreamEvent::Error { message } = &event {
            tracing::debug!(error = %message, "poll failed");
        }
        // Err only means every receiver dropped since the check above
        let _ = inner.events.send(event);
    }

    *inner.polling.lock().await = false;
    tracing::debug!("poll task stopped");
}

async fn forward(
    id: u64,
    mut feed: broadcast::Receiver<StreamEvent>,
    out: mpsc::Sender<StreamEvent>,
    mut cancel: oneshot::Receiver<()>,
    mut closed: watch::Receiver<bool>,
) {
    let reason = loop {
        let event = tokio::select! {
            _ = &mut cancel => break "cancelled",
            _ = out.closed() => break "receiver dropped",
            _ = closed.changed() => break "publisher closed",
            received = feed.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        subscriber = id,
                        skipped,
                        "subscriber lagging, readings skipped"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break "feed closed",
            },
        };

        tokio::select! {
            permit = out.reserve() => match permit {
                Ok(permit) => permit.send(event),
                Err(_) => break "receiver dropped",
            },
            _ = &mut cancel => break "cancelled",
            _ = closed.changed() => break "publisher closed",
        }
    };
    tracing::info!(subscriber = id, reason, "stream subscriber detached");
}

/// A live feed of [`StreamEvent`]s.
///
/// Implements [`Stream`]. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    events: ReceiverStream<StreamEvent>,
    cancel: Option<oneshot::Sender<()>>,
}

impl Subscription {
    /// Identifier used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop this subscription. Remaining buffered events can still be drained.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}
