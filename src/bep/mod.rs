//! Build-event publisher: one ordered, acknowledged stream per action.
//!
//! Producers hand tool-level events to [`BuildEventPublisher::publish`];
//! a single publisher task wraps them in sequenced envelopes and writes them
//! to the backend, while a sibling task drains acknowledgements. The stream
//! is closed by a trailing `ComponentStreamFinished` envelope, and the first
//! terminal error is latched so both later publishes and the final
//! [`wait`](BuildEventPublisher::wait) surface it.

pub mod client;
pub mod proto;

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use futures::StreamExt as _;

pub use self::client::{AckStream, BesTransport, GrpcBesTransport};
use self::proto::publish::build_event::build_component_stream_finished::FinishType;
use self::proto::publish::build_event::{BuildComponentStreamFinished, Event};
use self::proto::publish::{
    BuildEvent as EventEnvelope, OrderedBuildEvent, PublishBuildToolEventStreamRequest,
};
use self::proto::{bes, pack_bazel_event};

/// Queue depth between producers and the publisher task. Progress events are
/// rate-limited and the backend drains faster than we produce, so this never
/// fills in practice.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("error dialing bes_backend: {0}")]
    Dial(String),

    #[error("error opening build event stream: {0}")]
    OpenStream(String),

    #[error("error sending build event: {0}")]
    Send(String),

    #[error("error receiving acks: {0}")]
    Recv(String),

    #[error("build event stream cancelled")]
    Cancelled,

    #[error("event queue closed")]
    QueueClosed,
}

/// Identity of one build-event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId {
    pub invocation_id: String,
    pub build_id: String,
}

impl StreamId {
    /// Mint a fresh stream identity.
    pub fn random() -> Self {
        Self {
            invocation_id: Uuid::new_v4().to_string(),
            build_id: Uuid::new_v4().to_string(),
        }
    }
}

/// First terminal error observed on the stream; set once, read by every
/// publish and by wait.
#[derive(Clone, Default)]
struct ErrorLatch(Arc<Mutex<Option<PublishError>>>);

impl ErrorLatch {
    fn latch(&self, err: PublishError) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn get(&self) -> Option<PublishError> {
        self.0.lock().unwrap().clone()
    }
}

/// Publisher for a single build-event stream.
///
/// Lifecycle: created idle, [`start`](Self::start) spawns the publisher
/// task, the single call to [`wait`](Self::wait) drains the queue and blocks
/// until the backend has acknowledged everything (or the latched error is
/// returned).
pub struct BuildEventPublisher {
    stream_id: StreamId,
    transport: Arc<dyn BesTransport>,
    events_tx: mpsc::Sender<Option<bes::BuildEvent>>,
    events_rx: Mutex<Option<mpsc::Receiver<Option<bes::BuildEvent>>>>,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
    err: ErrorLatch,
}

impl BuildEventPublisher {
    pub fn new(stream_id: StreamId, transport: Arc<dyn BesTransport>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        Self {
            stream_id,
            transport,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
            err: ErrorLatch::default(),
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Spawn the publisher task. Events queued before `start` are delivered
    /// once the stream is open.
    pub fn start(&self, cancel: &CancellationToken) {
        let Some(events) = self.events_rx.lock().unwrap().take() else {
            warn!("publisher started twice; ignoring");
            return;
        };
        let done_tx = self.done_tx.lock().unwrap().take();
        let stream_id = self.stream_id.clone();
        let transport = self.transport.clone();
        let err = self.err.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_stream(stream_id, transport, events, err, cancel).await;
            if let Some(done) = done_tx {
                let _ = done.send(());
            }
        });
    }

    /// Enqueue one event. Returns the latched error instead once the stream
    /// has failed.
    ///
    /// Exactly one producer context calls this, so checking the latch and
    /// enqueueing are not atomic with respect to other producers; wire order
    /// still equals call order because the single publisher task is the only
    /// stream writer.
    pub async fn publish(&self, event: bes::BuildEvent) -> Result<(), PublishError> {
        if let Some(err) = self.err.get() {
            return Err(err);
        }
        self.events_tx
            .send(Some(event))
            .await
            .map_err(|_| PublishError::QueueClosed)
    }

    /// Drain the queue, close the stream and block until the backend has
    /// acknowledged the whole sequence. Returns the latched error, if any.
    pub async fn wait(&self) -> Result<(), PublishError> {
        // The sentinel tells the publisher task no more events are coming.
        let _ = self.events_tx.send(None).await;
        let started = self.done_tx.lock().unwrap().is_none();
        if started {
            let done = self.done_rx.lock().unwrap().take();
            if let Some(done) = done {
                let _ = done.await;
            }
        }
        match self.err.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_stream(
    stream_id: StreamId,
    transport: Arc<dyn BesTransport>,
    mut events: mpsc::Receiver<Option<bes::BuildEvent>>,
    err: ErrorLatch,
    cancel: CancellationToken,
) {
    let (wire_tx, wire_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let mut acks = match transport.open_stream(ReceiverStream::new(wire_rx)).await {
        Ok(acks) => acks,
        Err(dial_err) => {
            err.latch(dial_err);
            return;
        }
    };

    // Sibling task: receiving every ack proves the backend accepted the
    // sequence. End-of-stream is clean termination.
    let ack_err = err.clone();
    let ack_task = tokio::spawn(async move {
        loop {
            match acks.next().await {
                Some(Ok(_ack)) => {}
                None => {
                    debug!("received all acks from backend");
                    break;
                }
                Some(Err(status)) => {
                    ack_err.latch(PublishError::Recv(status.to_string()));
                    break;
                }
            }
        }
    });

    let mut seq: i64 = 1;
    loop {
        let next = tokio::select! {
            // Cancellation wins over queued events.
            biased;
            () = cancel.cancelled() => {
                err.latch(PublishError::Cancelled);
                ack_task.abort();
                let _ = ack_task.await;
                return;
            }
            next = events.recv() => next,
        };
        let request = match next {
            Some(Some(event)) => envelope(&stream_id, seq, Event::BazelEvent(pack_bazel_event(&event))),
            // Wait() was called (or the publisher was dropped): close the
            // stream with a final ComponentStreamFinished envelope.
            Some(None) | None => {
                let finished = envelope(
                    &stream_id,
                    seq,
                    Event::ComponentStreamFinished(BuildComponentStreamFinished {
                        r#type: FinishType::Finished as i32,
                    }),
                );
                if wire_tx.send(finished).await.is_err() {
                    err.latch(PublishError::Send("build event stream closed".to_owned()));
                } else {
                    debug!(sequence_number = seq, "published stream-finished envelope");
                }
                break;
            }
        };
        if wire_tx.send(request).await.is_err() {
            err.latch(PublishError::Send("build event stream closed".to_owned()));
            break;
        }
        trace!(sequence_number = seq, "published event");
        seq += 1;
    }

    // Half-close our side, then wait for the remaining acks.
    drop(wire_tx);
    let _ = ack_task.await;
}

fn envelope(stream_id: &StreamId, seq: i64, event: Event) -> PublishBuildToolEventStreamRequest {
    PublishBuildToolEventStreamRequest {
        ordered_build_event: Some(OrderedBuildEvent {
            stream_id: Some(proto::publish::StreamId {
                build_id: stream_id.build_id.clone(),
                invocation_id: stream_id.invocation_id.clone(),
            }),
            sequence_number: seq,
            event: Some(EventEnvelope {
                event_time: Some(prost_types::Timestamp::from(std::time::SystemTime::now())),
                event: Some(event),
            }),
        }),
    }
}
