//! GATT operation queue.
//!
//! The link to a peer cannot multiplex GATT requests, so every request for a
//! session goes through one FIFO queue drained by a single worker task. At
//! most one request is outstanding against the transport at any time.
//! Every queued request resolves exactly once: with its result, a timeout,
//! a cancellation, or the error passed to [`OperationQueue::abort_all`].

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::PeerId;
use crate::ble::characteristics::{CharacteristicDescriptor, ServiceDescriptor};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Identifier of a queued operation, unique per queue.
pub type OperationId = u64;

/// The kind of a queued GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Service discovery.
    DiscoverServices,
    /// Characteristic discovery for one service.
    DiscoverCharacteristics,
    /// Characteristic read.
    Read,
    /// Characteristic write.
    Write,
    /// Enable notifications.
    Subscribe,
    /// Disable notifications.
    Unsubscribe,
}

impl OperationKind {
    /// Name used in log messages and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DiscoverServices => "discover services",
            Self::DiscoverCharacteristics => "discover characteristics",
            Self::Read => "read",
            Self::Write => "write",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A request waiting for (or occupying) the transport.
#[derive(Debug, Clone)]
pub(crate) enum OperationRequest {
    DiscoverServices {
        filter: Vec<Uuid>,
    },
    DiscoverCharacteristics {
        service: Uuid,
        filter: Vec<Uuid>,
    },
    Read {
        characteristic: CharacteristicDescriptor,
    },
    Write {
        characteristic: CharacteristicDescriptor,
        value: Bytes,
        ack_required: bool,
    },
    Subscribe {
        characteristic: CharacteristicDescriptor,
    },
    Unsubscribe {
        characteristic: CharacteristicDescriptor,
    },
}

impl OperationRequest {
    pub(crate) fn kind(&self) -> OperationKind {
        match self {
            Self::DiscoverServices { .. } => OperationKind::DiscoverServices,
            Self::DiscoverCharacteristics { .. } => OperationKind::DiscoverCharacteristics,
            Self::Read { .. } => OperationKind::Read,
            Self::Write { .. } => OperationKind::Write,
            Self::Subscribe { .. } => OperationKind::Subscribe,
            Self::Unsubscribe { .. } => OperationKind::Unsubscribe,
        }
    }

    /// UUID of the targeted service or characteristic, if any.
    pub(crate) fn target(&self) -> Option<Uuid> {
        match self {
            Self::DiscoverServices { .. } => None,
            Self::DiscoverCharacteristics { service, .. } => Some(*service),
            Self::Read { characteristic }
            | Self::Write { characteristic, .. }
            | Self::Subscribe { characteristic }
            | Self::Unsubscribe { characteristic } => Some(characteristic.uuid),
        }
    }
}

/// Successful result of a queued operation.
#[derive(Debug, Clone)]
pub(crate) enum OperationOutput {
    Services(Vec<ServiceDescriptor>),
    Characteristics(Vec<CharacteristicDescriptor>),
    Value(Bytes),
    Done,
}

impl OperationOutput {
    pub(crate) fn into_services(self) -> Result<Vec<ServiceDescriptor>> {
        match self {
            Self::Services(services) => Ok(services),
            other => Err(Error::Internal(format!("expected services, got {other:?}"))),
        }
    }

    pub(crate) fn into_characteristics(self) -> Result<Vec<CharacteristicDescriptor>> {
        match self {
            Self::Characteristics(chars) => Ok(chars),
            other => Err(Error::Internal(format!(
                "expected characteristics, got {other:?}"
            ))),
        }
    }

    pub(crate) fn into_value(self) -> Result<Bytes> {
        match self {
            Self::Value(value) => Ok(value),
            other => Err(Error::Internal(format!("expected value, got {other:?}"))),
        }
    }
}

type Completion = oneshot::Sender<Result<OperationOutput>>;

/// A queued operation and its completion slot.
struct PendingOperation {
    id: OperationId,
    request: OperationRequest,
    requested_at: Instant,
    timeout: Option<Duration>,
    /// `None` for detached requests nobody waits on.
    completion: Option<Completion>,
}

impl PendingOperation {
    fn resolve(self, result: Result<OperationOutput>) {
        let kind = self.request.kind();
        match self.completion {
            Some(completion) => {
                if completion.send(result).is_err() {
                    debug!("Waiter for {} #{} is gone, result discarded", kind, self.id);
                }
            }
            None => {
                if let Err(e) = result {
                    debug!("Detached {} #{} failed: {}", kind, self.id, e);
                }
            }
        }
    }
}

/// The operation currently occupying the transport.
struct InFlight {
    id: OperationId,
    kind: OperationKind,
    abort: oneshot::Sender<Error>,
}

/// Queued operations and the transport slot, always locked together so an
/// operation is never between the two.
#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingOperation>,
    in_flight: Option<InFlight>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    wake: Notify,
    next_id: AtomicU64,
}

/// FIFO queue serializing GATT operations for one peer.
pub(crate) struct OperationQueue {
    peer: PeerId,
    shared: Arc<QueueShared>,
    worker: tokio::task::JoinHandle<()>,
}

impl OperationQueue {
    /// Create the queue and spawn its worker.
    pub(crate) fn new(transport: Arc<dyn Transport>, peer: PeerId) -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            next_id: AtomicU64::new(1),
        });

        let worker = tokio::spawn(Self::run(shared.clone(), transport, peer.clone()));

        Self {
            peer,
            shared,
            worker,
        }
    }

    /// Queue a request and wait for its result.
    ///
    /// Dropping the returned future cancels the request: if it is still
    /// queued it is skipped, if it is on the transport the slot is released.
    #[cfg(test)]
    pub(crate) async fn submit(
        &self,
        request: OperationRequest,
        timeout: Option<Duration>,
    ) -> Result<OperationOutput> {
        Self::completion(self.enqueue(request, timeout)).await
    }

    /// Queue a request and return its completion slot.
    ///
    /// Enqueueing is synchronous so callers can validate and queue under
    /// one lock. Dropping the receiver cancels the request.
    pub(crate) fn enqueue(
        &self,
        request: OperationRequest,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<Result<OperationOutput>> {
        let (tx, rx) = oneshot::channel();
        self.push(request, timeout, Some(tx));
        rx
    }

    /// Wait for a completion slot returned by [`enqueue`](Self::enqueue).
    pub(crate) async fn completion(
        rx: oneshot::Receiver<Result<OperationOutput>>,
    ) -> Result<OperationOutput> {
        // A dropped completion means the queue itself went away.
        rx.await.unwrap_or(Err(Error::SessionClosed))
    }

    /// Queue a request nobody waits on.
    pub(crate) fn submit_detached(&self, request: OperationRequest, timeout: Option<Duration>) {
        self.push(request, timeout, None);
    }

    fn push(
        &self,
        request: OperationRequest,
        timeout: Option<Duration>,
        completion: Option<Completion>,
    ) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Queueing {} #{} for {} (target {:?})",
            request.kind(),
            id,
            self.peer,
            request.target()
        );

        self.shared.state.lock().pending.push_back(PendingOperation {
            id,
            request,
            requested_at: Instant::now(),
            timeout,
            completion,
        });
        self.shared.wake.notify_one();
    }

    /// Resolve every queued and in-flight operation with `error`.
    ///
    /// Each waiter receives its own copy of the error. The in-flight
    /// transport request is abandoned.
    pub(crate) fn abort_all(&self, error: Error) {
        let (drained, in_flight) = {
            let mut state = self.shared.state.lock();
            let drained: Vec<_> = state.pending.drain(..).collect();
            (drained, state.in_flight.take())
        };

        if drained.is_empty() && in_flight.is_none() {
            return;
        }

        debug!(
            "Aborting {} queued and {} in-flight operations for {}: {}",
            drained.len(),
            usize::from(in_flight.is_some()),
            self.peer,
            error
        );

        if let Some(in_flight) = in_flight {
            trace!("Aborting in-flight {} #{}", in_flight.kind, in_flight.id);
            let _ = in_flight.abort.send(error.clone());
        }

        for op in drained {
            op.resolve(Err(error.clone()));
        }
    }

    /// Number of operations waiting behind the in-flight one.
    pub(crate) fn queued(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Kind of the operation currently on the transport.
    pub(crate) fn in_flight(&self) -> Option<OperationKind> {
        self.shared.state.lock().in_flight.as_ref().map(|f| f.kind)
    }

    async fn run(shared: Arc<QueueShared>, transport: Arc<dyn Transport>, peer: PeerId) {
        loop {
            let claimed = {
                let mut state = shared.state.lock();
                match state.pending.pop_front() {
                    Some(op) if op.completion.as_ref().is_some_and(|c| c.is_closed()) => {
                        debug!("Skipping cancelled {} #{}", op.request.kind(), op.id);
                        continue;
                    }
                    Some(op) => {
                        let (abort_tx, abort_rx) = oneshot::channel();
                        state.in_flight = Some(InFlight {
                            id: op.id,
                            kind: op.request.kind(),
                            abort: abort_tx,
                        });
                        Some((op, abort_rx))
                    }
                    None => None,
                }
            };
            let Some((mut op, abort_rx)) = claimed else {
                shared.wake.notified().await;
                continue;
            };

            let kind = op.request.kind();

            trace!(
                "Dispatching {} #{} to {} after {:?} in queue",
                kind,
                op.id,
                peer,
                op.requested_at.elapsed()
            );

            let result = Self::dispatch(
                transport.as_ref(),
                &peer,
                op.request.clone(),
                op.timeout,
                abort_rx,
                op.completion.as_mut(),
            )
            .await;

            {
                // Only release the slot we claimed; abort_all may already
                // have taken it.
                let mut state = shared.state.lock();
                if state.in_flight.as_ref().map(|f| f.id) == Some(op.id) {
                    state.in_flight = None;
                }
            }

            if let Err(ref e) = result {
                match e {
                    Error::Cancelled | Error::SessionClosed | Error::RadioUnavailable => {
                        debug!("{} #{} for {} ended: {}", kind, op.id, peer, e)
                    }
                    _ => warn!("{} #{} for {} failed: {}", kind, op.id, peer, e),
                }
            }

            op.resolve(result);
        }
    }

    async fn dispatch(
        transport: &dyn Transport,
        peer: &PeerId,
        request: OperationRequest,
        timeout: Option<Duration>,
        abort_rx: oneshot::Receiver<Error>,
        waiter: Option<&mut Completion>,
    ) -> Result<OperationOutput> {
        let kind = request.kind();
        let call = async move {
            let call = Self::execute(transport, peer, request);
            match timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .map_err(|_| Error::OperationTimeout {
                        operation: kind.name(),
                    })?,
                None => call.await,
            }
        };
        let caller_gone = async move {
            match waiter {
                Some(waiter) => waiter.closed().await,
                None => std::future::pending().await,
            }
        };

        // Whichever branch loses is dropped, so a transport completion that
        // arrives after a timeout, abort or cancellation is never delivered.
        // An abort that raced the claim wins over a transport result that is
        // already available.
        tokio::select! {
            biased;
            Ok(error) = abort_rx => Err(error),
            _ = caller_gone => Err(Error::Cancelled),
            result = call => result,
        }
    }

    async fn execute(
        transport: &dyn Transport,
        peer: &PeerId,
        request: OperationRequest,
    ) -> Result<OperationOutput> {
        match request {
            OperationRequest::DiscoverServices { filter } => transport
                .discover_services(peer, &filter)
                .await
                .map(OperationOutput::Services),
            OperationRequest::DiscoverCharacteristics { service, filter } => transport
                .discover_characteristics(peer, &service, &filter)
                .await
                .map(OperationOutput::Characteristics),
            OperationRequest::Read { characteristic } => transport
                .read(peer, &characteristic)
                .await
                .map(OperationOutput::Value),
            OperationRequest::Write {
                characteristic,
                value,
                ack_required,
            } => transport
                .write(peer, &characteristic, &value, ack_required)
                .await
                .map(|_| OperationOutput::Done),
            OperationRequest::Subscribe { characteristic } => transport
                .subscribe(peer, &characteristic)
                .await
                .map(|_| OperationOutput::Done),
            OperationRequest::Unsubscribe { characteristic } => transport
                .unsubscribe(peer, &characteristic)
                .await
                .map(|_| OperationOutput::Done),
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
