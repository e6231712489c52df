//! Paired Relay Engine.
//!
//! Streams bytes from one request (the producer) to another (the consumer)
//! through a small bounded queue, so memory stays bounded however large the
//! transfer is.
//!
//! ```text
//!  POST body ──▶ produce() ──Frame::Data──▶ [queue: relay_queue_capacity] ──▶ Consumer ──▶ GET body
//!                   │ read error                                   │
//!                   └────────Frame::Aborted────────────────────────┘ surfaced as HubError::Upstream
//! ```
//!
//! Either side may arrive first; both resolve the same [`Relay`] through
//! [`RelayHub::get_or_create`]. Each relay admits one producer and one
//! consumer; a second of either is a [`HubError::Conflict`]. Waits on the peer
//! are bounded by `relay_peer_timeout_ms`.
//!
//! Teardown: the consumer removes the relay when it finishes (or is dropped).
//! A producer that finishes first removes it only if a consumer is attached;
//! otherwise the relay stays readable until [`RelayHub::reap_idle`] expires it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Unit of the hand-off queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(Bytes),
    /// The producer's input failed; no further data follows.
    Aborted,
}

/// One in-flight relay.
pub struct Relay {
    id: String,
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
    receiver: Mutex<Option<mpsc::Receiver<Frame>>>,
    closed: AtomicBool,
    /// Set when the producer finished with no consumer attached.
    idle_since: Mutex<Option<Instant>>,
}

impl Relay {
    fn new(id: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            id: id.to_string(),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            idle_since: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn producer_attached(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn consumer_attached(&self) -> bool {
        self.receiver.lock().is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_sender(&self) -> HubResult<mpsc::Sender<Frame>> {
        self.sender
            .lock()
            .take()
            .ok_or_else(|| HubError::Conflict(format!("relay '{}' already has a producer", self.id)))
    }

    fn take_receiver(&self) -> HubResult<mpsc::Receiver<Frame>> {
        self.receiver
            .lock()
            .take()
            .ok_or_else(|| HubError::Conflict(format!("relay '{}' already has a consumer", self.id)))
    }

    fn idle_for(&self) -> Option<Duration> {
        self.idle_since.lock().map(|since| since.elapsed())
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("id", &self.id)
            .field("producer_attached", &self.producer_attached())
            .field("consumer_attached", &self.consumer_attached())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RelayHub
// ---------------------------------------------------------------------------

/// In-flight relays keyed by caller-supplied id. Clones share the same map.
#[derive(Debug, Clone)]
pub struct RelayHub {
    relays: Arc<DashMap<String, Arc<Relay>>>,
    queue_capacity: usize,
    chunk_size: usize,
    peer_timeout: Duration,
}

impl RelayHub {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            relays: Arc::new(DashMap::new()),
            queue_capacity: config.relay_queue_capacity,
            chunk_size: config.relay_chunk_size,
            peer_timeout: config.relay_peer_timeout(),
        }
    }

    /// Return the relay for `id`, creating it if absent.
    ///
    /// Creation runs under the map's entry lock, so concurrent first access
    /// from both sides yields one relay.
    pub fn get_or_create(&self, id: &str) -> Arc<Relay> {
        let entry = self
            .relays
            .entry(id.to_string())
            .or_insert_with(|| {
                log::debug!("Relay '{}' created", id);
                Arc::new(Relay::new(id, self.queue_capacity))
            });
        Arc::clone(entry.value())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Relay>> {
        self.relays.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Sorted ids of in-flight relays.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.relays.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Remove `relay` from the map once. The closed flag is set under the
    /// same shard lock as the removal.
    fn finish(&self, relay: &Arc<Relay>) -> bool {
        let removed = self
            .relays
            .remove_if(relay.id(), |_, current| {
                Arc::ptr_eq(current, relay) && !relay.closed.swap(true, Ordering::SeqCst)
            })
            .is_some();
        if removed {
            log::debug!("Relay '{}' removed", relay.id());
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Producer
    // -----------------------------------------------------------------------

    /// Feed `body` into relay `id`. Returns the number of bytes relayed.
    ///
    /// Chunks larger than `relay_chunk_size` are split. Each enqueue waits at
    /// most the peer timeout for the consumer to make room. A read error is
    /// forwarded as [`Frame::Aborted`] and reported as [`HubError::Upstream`].
    pub async fn produce<S, E>(&self, id: &str, mut body: S) -> HubResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        let relay = self.get_or_create(id);
        let tx = relay.take_sender()?;
        let result = self.pump(&relay, &tx, &mut body).await;
        drop(tx);

        match &result {
            Ok(total) => log::info!("Relay '{}' producer finished ({} bytes)", id, total),
            Err(e) => log::warn!("Relay '{}' producer failed: {}", id, e),
        }

        let dead = matches!(result, Err(HubError::Timeout { .. }) | Err(HubError::Closed(_)));
        if dead || relay.consumer_attached() {
            self.finish(&relay);
        } else {
            *relay.idle_since.lock() = Some(Instant::now());
        }
        result
    }

    async fn pump<S, E>(&self, relay: &Relay, tx: &mpsc::Sender<Frame>, body: &mut S) -> HubResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        let mut total = 0u64;
        while let Some(item) = body.next().await {
            match item {
                Ok(chunk) => {
                    for piece in split_chunk(chunk, self.chunk_size) {
                        let len = piece.len() as u64;
                        self.send_frame(relay, tx, Frame::Data(piece)).await?;
                        total += len;
                    }
                }
                Err(e) => {
                    let _ = self.send_frame(relay, tx, Frame::Aborted).await;
                    return Err(HubError::upstream("reading relay body", e));
                }
            }
        }
        Ok(total)
    }

    async fn send_frame(&self, relay: &Relay, tx: &mpsc::Sender<Frame>, frame: Frame) -> HubResult<()> {
        match tokio::time::timeout(self.peer_timeout, tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HubError::Closed(format!("relay '{}' consumer went away", relay.id()))),
            Err(_) => Err(HubError::Timeout {
                what: format!("relay '{}' consumer", relay.id()),
                after_ms: self.peer_timeout.as_millis() as u64,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Consumer
    // -----------------------------------------------------------------------

    /// Attach the consumer side of relay `id`.
    pub fn consume(&self, id: &str) -> HubResult<Consumer> {
        let relay = self.get_or_create(id);
        let rx = relay.take_receiver()?;
        Ok(Consumer {
            hub: self.clone(),
            relay,
            rx,
            done: false,
        })
    }

    // -----------------------------------------------------------------------
    // Reaping
    // -----------------------------------------------------------------------

    /// Drop relays whose producer finished more than the peer timeout ago
    /// without a consumer ever attaching. Returns how many were removed.
    pub fn reap_idle(&self) -> usize {
        let mut reaped = 0;
        self.relays.retain(|id, relay| {
            let expired = !relay.consumer_attached()
                && relay.idle_for().is_some_and(|idle| idle >= self.peer_timeout);
            if expired {
                relay.closed.store(true, Ordering::SeqCst);
                log::info!("Relay '{}' expired without a consumer", id);
                reaped += 1;
            }
            !expired
        });
        reaped
    }

    /// Run [`reap_idle`](Self::reap_idle) periodically until aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let hub = self.clone();
        let period = (self.peer_timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                hub.reap_idle();
            }
        })
    }
}

fn split_chunk(mut chunk: Bytes, max: usize) -> impl Iterator<Item = Bytes> {
    std::iter::from_fn(move || {
        if chunk.is_empty() {
            None
        } else {
            let n = chunk.len().min(max);
            Some(chunk.split_to(n))
        }
    })
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Reading side of a relay. Dropping it tears the relay down.
pub struct Consumer {
    hub: RelayHub,
    relay: Arc<Relay>,
    rx: mpsc::Receiver<Frame>,
    done: bool,
}

impl Consumer {
    pub fn relay_id(&self) -> &str {
        self.relay.id()
    }

    /// Next chunk in FIFO order; `Ok(None)` at clean end of stream.
    pub async fn next_chunk(&mut self) -> HubResult<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let outcome = match tokio::time::timeout(self.hub.peer_timeout, self.rx.recv()).await {
            Ok(Some(Frame::Data(bytes))) => return Ok(Some(bytes)),
            Ok(Some(Frame::Aborted)) => Err(HubError::Upstream(format!(
                "relay '{}' producer failed",
                self.relay.id()
            ))),
            Ok(None) => Ok(None),
            Err(_) => Err(HubError::Timeout {
                what: format!("relay '{}' producer", self.relay.id()),
                after_ms: self.hub.peer_timeout.as_millis() as u64,
            }),
        };
        self.done = true;
        self.hub.finish(&self.relay);
        outcome
    }

    /// Turn the remaining chunks into a stream that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = HubResult<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut consumer| async move {
            match consumer.next_chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes), consumer)),
                Ok(None) => None,
                Err(e) => Some((Err(e), consumer)),
            }
        })
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.hub.finish(&self.relay);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("relay", &self.relay.id())
            .field("done", &self.done)
            .finish()
    }
}
