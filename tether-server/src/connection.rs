//! Per-client connection handling
//!
//! One task reads frames and admits tool calls in arrival order. Each
//! admitted call runs on its own task holding its bridge permit, and a writer
//! task drains the bounded response queue into the socket.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use tether_protocol::{CodecError, Frame, RequestId, ResponseEnvelope, RpcError, ServerCodec};

use crate::config::TransportConfig;
use crate::bridge::CallPermit;
use crate::router::{Dispatch, PreparedCall, Router};

/// Per-connection limits
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_frame_bytes: usize,
    pub send_queue_depth: usize,
}

impl From<&TransportConfig> for ConnectionSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            send_queue_depth: config.send_queue_depth,
        }
    }
}

/// State of one accepted client
pub struct Connection {
    id: Uuid,
    router: Arc<Router>,
    settings: ConnectionSettings,
    /// Ids dispatched but not yet answered
    in_flight: Arc<Mutex<HashSet<RequestId>>>,
}

impl Connection {
    pub fn new(router: Arc<Router>, settings: ConnectionSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            router,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serve the client until it disconnects or shutdown is signalled
    ///
    /// Tool calls queue here until the bridge admits them, one at a time and
    /// in arrival order. Calls already admitted keep running after the read
    /// side closes and their responses are flushed before this returns; calls
    /// still queued are dropped without a response.
    pub async fn run(self, stream: UnixStream, mut shutdown: broadcast::Receiver<()>) {
        let (reader, writer) = stream.into_split();
        let mut frames = FramedRead::new(
            reader,
            ServerCodec::with_max_frame(self.settings.max_frame_bytes),
        );
        let (tx, rx) = mpsc::channel(self.settings.send_queue_depth.max(1));
        let writer_task = tokio::spawn(write_responses(
            self.id,
            writer,
            rx,
            self.settings.max_frame_bytes,
        ));
        let max_queued = self.settings.send_queue_depth.max(1);
        let mut queued: VecDeque<PreparedCall> = VecDeque::new();
        let mut admitting: Option<Admission> = None;

        debug!(connection = %self.id, "Connection opened");

        loop {
            if admitting.is_none() {
                if let Some(call) = queued.pop_front() {
                    admitting = Some(self.admission(call));
                }
            }

            // Admission first: a call whose permit is ready counts as
            // dispatched even if the client has already hung up.
            tokio::select! {
                biased;

                permit = admitted(&mut admitting) => {
                    if let Some(admission) = admitting.take() {
                        self.spawn_call(admission.call, permit, &tx);
                    }
                }
                _ = shutdown.recv() => {
                    debug!(connection = %self.id, "Shutdown signalled, closing connection");
                    break;
                }
                frame = frames.next(), if queued.len() < max_queued => match frame {
                    Some(Ok(frame)) => {
                        if let Some(call) = self.accept(frame, &tx).await {
                            queued.push_back(call);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(connection = %self.id, error = %e, "Read failed, closing connection");
                        break;
                    }
                    None => {
                        debug!(connection = %self.id, "Client disconnected");
                        break;
                    }
                },
            }
        }

        let dropped = queued.len() + usize::from(admitting.is_some());
        if dropped > 0 {
            debug!(connection = %self.id, dropped, "Dropping calls that were never admitted");
        }
        drop(admitting);
        drop(queued);
        drop(frames);
        drop(tx);
        if let Err(e) = writer_task.await {
            warn!(connection = %self.id, error = %e, "Writer task failed");
        }
        debug!(connection = %self.id, "Connection closed");
    }

    /// Parse and route one frame
    ///
    /// Anything answerable without the bridge is answered here. A tool call
    /// is returned for queueing and its id counts as in flight from now on.
    async fn accept(
        &self,
        frame: Frame,
        tx: &mpsc::Sender<ResponseEnvelope>,
    ) -> Option<PreparedCall> {
        trace!(connection = %self.id, "Frame received");

        let request = match self.router.parse(frame) {
            Ok(request) => request,
            Err(response) => {
                self.respond(tx, response).await;
                return None;
            }
        };

        if self.in_flight.lock().contains(&request.id) {
            debug!(connection = %self.id, id = %request.id, "Duplicate request id");
            let response = ResponseEnvelope::error(
                Some(request.id.clone()),
                RpcError::invalid_request(format!("duplicate request id {}", request.id)),
            );
            self.respond(tx, response).await;
            return None;
        }

        match self.router.route(request) {
            Dispatch::Respond(response) => {
                self.respond(tx, response).await;
                None
            }
            Dispatch::Call(call) => {
                self.in_flight.lock().insert(call.id().clone());
                Some(call)
            }
        }
    }

    async fn respond(&self, tx: &mpsc::Sender<ResponseEnvelope>, response: ResponseEnvelope) {
        if tx.send(response).await.is_err() {
            debug!(connection = %self.id, "Writer gone, response dropped");
        }
    }

    fn admission(&self, call: PreparedCall) -> Admission {
        let bridge = Arc::clone(self.router.bridge());
        let access = call.access();
        Admission {
            call,
            permit: Box::pin(async move { bridge.admit(access).await }),
        }
    }

    /// Run an admitted call on its own task
    ///
    /// The response slot is reserved before the permit is released, so the
    /// next call admitted on the bridge cannot answer first.
    fn spawn_call(
        &self,
        call: PreparedCall,
        permit: CallPermit,
        tx: &mpsc::Sender<ResponseEnvelope>,
    ) {
        let id = call.id().clone();
        trace!(connection = %self.id, id = %id, tool = call.tool_name(), "Permit granted");

        let router = Arc::clone(&self.router);
        let in_flight = Arc::clone(&self.in_flight);
        let tx = tx.clone();
        let connection = self.id;
        tokio::spawn(async move {
            let response = router.execute(call, &permit).await;
            let slot = tx.reserve().await;
            drop(permit);
            in_flight.lock().remove(&id);
            match slot {
                Ok(slot) => slot.send(response),
                Err(_) => debug!(connection = %connection, id = %id, "Client gone, response dropped"),
            }
        });
    }
}

/// A queued call waiting for its bridge permit
struct Admission {
    call: PreparedCall,
    permit: BoxFuture<'static, CallPermit>,
}

/// Resolve when the pending admission is granted; never when there is none
async fn admitted(admitting: &mut Option<Admission>) -> CallPermit {
    match admitting {
        Some(admission) => (&mut admission.permit).await,
        None => std::future::pending().await,
    }
}

async fn write_responses(
    connection: Uuid,
    writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ResponseEnvelope>,
    max_frame_bytes: usize,
) {
    let mut sink = FramedWrite::new(writer, ServerCodec::with_max_frame(max_frame_bytes));

    while let Some(response) = rx.recv().await {
        let id = response.id.clone();
        match sink.send(response).await {
            Ok(()) => {}
            Err(CodecError::MessageTooLarge { size, max }) => {
                warn!(connection = %connection, size, max, "Response too large, sending error instead");
                let fallback = ResponseEnvelope::error(
                    id,
                    RpcError::internal(format!(
                        "response of {} bytes exceeds limit of {} bytes",
                        size, max
                    )),
                );
                if let Err(e) = sink.send(fallback).await {
                    warn!(connection = %connection, error = %e, "Write failed, closing connection");
                    break;
                }
            }
            Err(e) => {
                warn!(connection = %connection, error = %e, "Write failed, closing connection");
                break;
            }
        }
    }
}
