//! Submits the requested images and collects what the consumer context delivers.
use std::sync::Arc;
use std::time::{Duration, Instant};

use pictor_service::caching::{DecodeOptions, RequestKey, Resource};
use pictor_service::request::{Attached, Consumer};
use pictor_service::services::SharedServices;
use pictor_service::types::{CancelCause, FailedCause, Provenance, RequestOptions, RequestState};
use serde::Serialize;
use tokio::sync::mpsc;

/// What to load.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub uris: Vec<String>,
    pub decode: DecodeOptions,
    pub options: RequestOptions,
    /// How many times every URI is loaded, one round after the other.
    pub rounds: usize,
}

/// The outcome of one request.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub round: usize,
    #[serde(skip)]
    pub index: usize,
    pub uri: String,
    pub state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSummary>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl LoadReport {
    pub fn is_completed(&self) -> bool {
        self.state == RequestState::Completed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub animated: bool,
    pub byte_size: usize,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u128(duration.as_millis())
    }
}

/// A consumer that turns the delivered outcome into a [`LoadReport`].
struct ReportingConsumer {
    round: usize,
    index: usize,
    uri: String,
    submitted: Instant,
    reports: mpsc::UnboundedSender<LoadReport>,
}

impl ReportingConsumer {
    fn report(
        &mut self,
        state: RequestState,
        provenance: Option<Provenance>,
        cause: Option<String>,
        image: Option<ImageSummary>,
    ) {
        let report = LoadReport {
            round: self.round,
            index: self.index,
            uri: std::mem::take(&mut self.uri),
            state,
            provenance,
            cause,
            image,
            duration: self.submitted.elapsed(),
        };
        // the receiver outlives every request
        let _ = self.reports.send(report);
    }
}

impl Consumer for ReportingConsumer {
    fn on_state_changed(&mut self, state: RequestState) {
        tracing::trace!(uri = %self.uri, %state, "Request state changed");
    }

    fn on_completed(&mut self, resource: &Arc<Resource>, provenance: Provenance) {
        let info = resource.info();
        let image = ImageSummary {
            width: info.width,
            height: info.height,
            mime_type: info.mime_type.clone(),
            animated: info.animated,
            byte_size: info.byte_size,
        };
        self.report(RequestState::Completed, Some(provenance), None, Some(image));
    }

    fn on_failed(&mut self, cause: FailedCause) {
        self.report(RequestState::Failed, None, Some(cause.to_string()), None);
    }

    fn on_canceled(&mut self, cause: CancelCause) {
        self.report(RequestState::Canceled, None, Some(cause.to_string()), None);
    }
}

/// Loads every URI of the `plan`, round by round, and returns the reports in submission order.
pub async fn load_all(services: &SharedServices, plan: LoadPlan) -> Vec<LoadReport> {
    let (loader, context) = services.loader();
    tokio::spawn(context.run());

    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
    let mut reports = Vec::new();

    for round in 1..=plan.rounds {
        let handles: Vec<_> = plan
            .uris
            .iter()
            .enumerate()
            .map(|(index, uri)| {
                let key = RequestKey::with_options(uri.as_str(), plan.decode);
                let consumer = ReportingConsumer {
                    round,
                    index,
                    uri: uri.clone(),
                    submitted: Instant::now(),
                    reports: reports_tx.clone(),
                };
                loader.submit(key, plan.options, Arc::new(Attached), consumer)
            })
            .collect();

        for handle in &handles {
            handle.finished().await;
        }

        while let Ok(report) = reports_rx.try_recv() {
            reports.push(report);
        }
        tracing::debug!(round, "Finished loading round");
    }

    reports.sort_by_key(|report| (report.round, report.index));
    reports
}
