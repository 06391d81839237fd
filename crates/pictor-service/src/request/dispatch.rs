use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::binding::RequestControl;
use super::consumer::Consumer;
use crate::caching::InUse;
use crate::types::{Outcome, RequestId, RequestState};

pub(crate) enum Message {
    Register {
        control: Arc<RequestControl>,
        consumer: Box<dyn Consumer>,
        state: watch::Sender<RequestState>,
    },
    StateChanged {
        id: RequestId,
        state: RequestState,
    },
    Terminal {
        id: RequestId,
        outcome: Outcome,
        /// Keeps a completed resource alive until it has been delivered or discarded.
        pin: Option<InUse>,
    },
}

/// Creates a connected [`Dispatcher`] and [`ConsumerContext`].
pub fn channel() -> (Dispatcher, ConsumerContext) {
    let (tx, rx) = mpsc::unbounded_channel();
    let context = ConsumerContext {
        rx,
        requests: HashMap::new(),
    };
    (Dispatcher { tx }, context)
}

/// Hands request updates from worker tasks over to the [`ConsumerContext`].
///
/// Sending never blocks. If the consumer context is gone, updates are dropped along with any
/// resource pins they carry.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Message>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Dispatcher {
    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            tracing::trace!("Consumer context is gone, dropping update");
        }
    }

    pub(crate) fn register(
        &self,
        control: Arc<RequestControl>,
        consumer: Box<dyn Consumer>,
        state: watch::Sender<RequestState>,
    ) {
        self.send(Message::Register {
            control,
            consumer,
            state,
        });
    }

    pub(crate) fn state_changed(&self, id: RequestId, state: RequestState) {
        self.send(Message::StateChanged { id, state });
    }

    pub(crate) fn dispatch(&self, id: RequestId, outcome: Outcome, pin: Option<InUse>) {
        self.send(Message::Terminal { id, outcome, pin });
    }
}

struct Registered {
    control: Arc<RequestControl>,
    consumer: Box<dyn Consumer>,
    state: watch::Sender<RequestState>,
}

/// The single execution context on which consumers are called back.
///
/// Run it on one task with [`run`](Self::run), or drive it from an existing event loop with
/// [`run_until_idle`](Self::run_until_idle). Each outcome is re-validated right before it is
/// delivered: an outcome of a request whose consumer detached or that was canceled in the
/// meantime is delivered as canceled instead.
pub struct ConsumerContext {
    rx: mpsc::UnboundedReceiver<Message>,
    requests: HashMap<RequestId, Registered>,
}

impl fmt::Debug for ConsumerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerContext")
            .field("pending", &self.requests.len())
            .finish()
    }
}

impl ConsumerContext {
    /// Delivers updates until all dispatchers are dropped.
    pub async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            self.handle(message);
        }
    }

    /// Waits for the next update and delivers it.
    ///
    /// Returns `false` once all dispatchers are dropped and nothing is left to deliver.
    pub async fn next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(message) => {
                self.handle(message);
                true
            }
            None => false,
        }
    }

    /// Delivers all updates that are ready, without waiting. Returns how many were delivered.
    pub fn run_until_idle(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle(message);
            handled += 1;
        }
        handled
    }

    /// The number of requests whose outcome has not been delivered yet.
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Register {
                control,
                consumer,
                state,
            } => {
                self.requests.insert(
                    control.id(),
                    Registered {
                        control,
                        consumer,
                        state,
                    },
                );
            }
            Message::StateChanged { id, state } => {
                if let Some(request) = self.requests.get_mut(&id) {
                    request.consumer.on_state_changed(state);
                    request.state.send_replace(state);
                }
            }
            Message::Terminal { id, outcome, pin } => {
                let Some(request) = self.requests.remove(&id) else {
                    tracing::warn!(%id, "Dropping outcome of unknown request");
                    return;
                };
                deliver(request, outcome, pin);
            }
        }
    }
}

fn deliver(mut request: Registered, outcome: Outcome, pin: Option<InUse>) {
    let outcome = match (outcome, request.control.check()) {
        (outcome @ Outcome::Canceled(_), _) => outcome,
        (stale, Some(cause)) => {
            tracing::debug!(
                id = %request.control.id(),
                outcome = stale.tag(),
                "Discarding stale outcome"
            );
            Outcome::Canceled(cause)
        }
        (outcome, None) => outcome,
    };

    match &outcome {
        Outcome::Completed(resource, provenance) => {
            request.consumer.on_completed(resource, *provenance)
        }
        Outcome::Failed(cause) => request.consumer.on_failed(*cause),
        Outcome::Canceled(cause) => request.consumer.on_canceled(*cause),
    }
    // the consumer has taken its own pin if it needs one
    drop(pin);

    metric!(counter("requests.outcome") += 1, "outcome" => outcome.tag());
    request.state.send_replace(outcome.state());
}
