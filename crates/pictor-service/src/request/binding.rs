use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::types::{CancelCause, RequestId};

/// Tells whether the consumer that submitted a request is still interested in its result.
///
/// Bindings are polled at every checkpoint of a request and once more right before its
/// outcome is delivered, from both worker tasks and the consumer context.
pub trait ConsumerBinding: Send + Sync + 'static {
    /// Whether the consumer is still attached.
    fn is_attached(&self) -> bool;

    /// The reason to report once the binding is no longer attached.
    fn detach_cause(&self) -> CancelCause {
        CancelCause::ConsumerDetached
    }
}

/// A binding for consumers that never detach.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attached;

impl ConsumerBinding for Attached {
    fn is_attached(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct BindingState {
    detached: OnceLock<CancelCause>,
}

impl BindingState {
    fn detach(&self, cause: CancelCause) {
        // the first reason sticks
        let _ = self.detached.set(cause);
    }
}

/// A consumer slot that is bound to at most one request at a time, like a view showing an
/// image.
///
/// Binding the slot to a new request supersedes the previous binding, and clearing the slot
/// detaches it.
#[derive(Clone, Default)]
pub struct ConsumerSlot {
    current: Arc<Mutex<Option<Arc<BindingState>>>>,
}

impl fmt::Debug for ConsumerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSlot")
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl ConsumerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the slot to a new request.
    ///
    /// A previous binding is detached with [`CancelCause::Superseded`].
    pub fn bind(&self) -> SlotBinding {
        let state = Arc::new(BindingState::default());
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&state));

        if let Some(previous) = previous {
            previous.detach(CancelCause::Superseded);
        }

        SlotBinding { state }
    }

    /// Detaches the current binding with [`CancelCause::ConsumerDetached`].
    pub fn clear(&self) {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(previous) = previous {
            previous.detach(CancelCause::ConsumerDetached);
        }
    }

    pub fn is_bound(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// A binding handed out by [`ConsumerSlot::bind`].
#[derive(Debug, Clone)]
pub struct SlotBinding {
    state: Arc<BindingState>,
}

impl ConsumerBinding for SlotBinding {
    fn is_attached(&self) -> bool {
        self.state.detached.get().is_none()
    }

    fn detach_cause(&self) -> CancelCause {
        self.state
            .detached
            .get()
            .copied()
            .unwrap_or(CancelCause::ConsumerDetached)
    }
}

/// The cancellation state of one request, shared by its handle, its worker and the consumer
/// context.
pub(crate) struct RequestControl {
    id: RequestId,
    canceled: OnceLock<CancelCause>,
    binding: Arc<dyn ConsumerBinding>,
}

impl fmt::Debug for RequestControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestControl")
            .field("id", &self.id)
            .field("canceled", &self.canceled.get())
            .finish()
    }
}

impl RequestControl {
    pub fn new(id: RequestId, binding: Arc<dyn ConsumerBinding>) -> Self {
        Self {
            id,
            canceled: OnceLock::new(),
            binding,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Requests cancellation. Only the first cause is kept.
    pub fn cancel(&self, cause: CancelCause) {
        let _ = self.canceled.set(cause);
    }

    /// Re-evaluates whether the request is canceled.
    ///
    /// A detached binding cancels the request for good, even if it reattaches later.
    pub fn check(&self) -> Option<CancelCause> {
        if let Some(cause) = self.canceled.get() {
            return Some(*cause);
        }
        if !self.binding.is_attached() {
            self.cancel(self.binding.detach_cause());
            return self.canceled.get().copied();
        }
        None
    }
}
