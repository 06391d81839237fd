use std::sync::Arc;

use crate::caching::Resource;
use crate::types::{CancelCause, FailedCause, Provenance, RequestState};

/// The receiving end of a request.
///
/// All methods are called on the consumer context, never concurrently, and exactly one of
/// [`on_completed`](Consumer::on_completed), [`on_failed`](Consumer::on_failed) and
/// [`on_canceled`](Consumer::on_canceled) is called per request.
pub trait Consumer: Send + 'static {
    /// The request entered `state`. States are reported in the order they were entered.
    fn on_state_changed(&mut self, _state: RequestState) {}

    /// The request completed with `resource`.
    ///
    /// The resource is pinned for the duration of this call only. Consumers that keep
    /// presenting its pixels afterwards take their own [`InUse`](crate::caching::InUse) pin.
    fn on_completed(&mut self, resource: &Arc<Resource>, provenance: Provenance);

    /// The request failed.
    fn on_failed(&mut self, cause: FailedCause);

    /// The request was canceled.
    fn on_canceled(&mut self, cause: CancelCause);
}
