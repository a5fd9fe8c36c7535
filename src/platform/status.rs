use std::sync::Arc;
use std::time::Instant;

use crate::error::LoadError;
use crate::gate::{COMPLETION_SENTINEL, Classification, PollAttempt, PollRequest, StatusCheck};
use crate::platform::{PlatformClient, StepKind};
use crate::stats::Stats;

/// Classify an artifact-status response body.
///
/// `Done` only for an `overall.status` string equal to the sentinel. Any other
/// value or a missing field is `Pending`; a body that is not a JSON object is
/// `Error` so a stray substring can never read as completion.
pub fn classify_status_body(body: &[u8]) -> Classification {
    let parsed: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("unparseable artifact status body: {e}");
            return Classification::Error;
        }
    };
    let Some(object) = parsed.as_object() else {
        tracing::debug!("artifact status body is not a JSON object");
        return Classification::Error;
    };

    let status = object
        .get("overall")
        .and_then(|overall| overall.get("status"))
        .and_then(serde_json::Value::as_str);
    match status {
        Some(COMPLETION_SENTINEL) => Classification::Done,
        _ => Classification::Pending,
    }
}

/// [`StatusCheck`] over the platform's artifact-status endpoint.
/// Each query is recorded as a `Check Scan Status` request when stats are attached.
pub struct ScanStatusCheck {
    client: Arc<PlatformClient>,
    stats: Option<Arc<Stats>>,
}

impl ScanStatusCheck {
    pub fn new(client: Arc<PlatformClient>) -> Self {
        Self { client, stats: None }
    }

    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }
}

impl StatusCheck for ScanStatusCheck {
    async fn check_status(&self, request: &PollRequest) -> Result<PollAttempt, LoadError> {
        let start = Instant::now();
        let result = self.client.artifact_status(request).await;

        if let Some(stats) = &self.stats {
            match &result {
                Ok(resp) => {
                    stats
                        .record(StepKind::CheckScanStatus, start.elapsed(), true, Some(resp.status))
                        .await
                }
                Err(e) => {
                    stats
                        .record(StepKind::CheckScanStatus, start.elapsed(), false, e.status())
                        .await
                }
            }
        }

        let response = result?;
        let classification = classify_status_body(&response.body);
        let payload = String::from_utf8_lossy(&response.body).into_owned();
        Ok(PollAttempt::new(payload, classification))
    }
}
