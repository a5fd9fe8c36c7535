use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Config, ImageConfig, ScenarioConfig};
use crate::container::ImagePusher;
use crate::error::LoadError;
use crate::gate::{PollConfig, PollOutcome, PollRequest, PollingGate};
use crate::platform::status::ScanStatusCheck;
use crate::platform::{PlatformClient, StepKind};
use crate::stats::Stats;

/// One executed step of a pipeline iteration.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: StepKind,
    pub latency: Duration,
    pub ok: bool,
    pub status: Option<u16>,
}

/// What happened during one iteration.
#[derive(Debug, Default)]
pub struct PipelineRun {
    pub steps: Vec<StepRecord>,
    pub poll_outcome: Option<PollOutcome>,
    pub violations: Option<u64>,
    /// Set when a fatal error cut the iteration short.
    pub aborted: Option<String>,
}

impl PipelineRun {
    pub fn step(&self, step: StepKind) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step == step)
    }
}

/// The full scan sequence run by each virtual user:
/// repository, image push, policy, watch, apply, scan wait, violations.
pub struct ScanPipeline {
    client: Arc<PlatformClient>,
    pusher: Option<ImagePusher>,
    scenario: ScenarioConfig,
    image: ImageConfig,
    poll: PollConfig,
    stats: Arc<Stats>,
}

impl ScanPipeline {
    pub fn new(client: Arc<PlatformClient>, config: &Config, stats: Arc<Stats>) -> Self {
        let pusher = config
            .image
            .push
            .then(|| ImagePusher::new(&config.platform, &config.image));
        Self {
            client,
            pusher,
            scenario: config.scenario.clone(),
            image: config.image.clone(),
            poll: config.poll,
            stats,
        }
    }

    /// Run every step once. `label` identifies the iteration in logs and
    /// names its poll sequence.
    pub async fn run(&self, label: &str) -> PipelineRun {
        let mut run = PipelineRun::default();
        let scenario = &self.scenario;

        let start = Instant::now();
        let result = self.client.create_repository().await;
        if !self.track(&mut run, label, StepKind::CreateRepository, start, status_of(&result)).await {
            return run;
        }

        if let Some(pusher) = &self.pusher {
            let start = Instant::now();
            let result = pusher.push().await.map(|_| None);
            // A failed push is recorded; later steps still run against whatever
            // image is already in the registry.
            if !self.track(&mut run, label, StepKind::PushImage, start, result.as_ref().copied()).await {
                return run;
            }
        }

        let start = Instant::now();
        let result = self.client.create_policy(scenario).await;
        if !self.track(&mut run, label, StepKind::CreatePolicy, start, status_of(&result)).await {
            return run;
        }

        let start = Instant::now();
        let result = self.client.create_watch(scenario).await;
        if !self.track(&mut run, label, StepKind::CreateWatch, start, status_of(&result)).await {
            return run;
        }

        let start = Instant::now();
        let result = self.client.apply_watch(scenario).await;
        if !self.track(&mut run, label, StepKind::ApplyWatch, start, status_of(&result)).await {
            return run;
        }

        let request = PollRequest::for_image(
            &self.client.config().repo,
            &self.image.name,
            &self.image.tag,
            label,
        );
        let check = ScanStatusCheck::new(self.client.clone()).with_stats(self.stats.clone());
        let gate = PollingGate::new(check, self.poll);
        let outcome = gate.await_completion(&request).await;
        self.stats.record_poll(&outcome).await;

        let completed = outcome.is_completed();
        if let PollOutcome::Failed { reason, .. } = &outcome {
            run.aborted = Some(reason.clone());
            run.poll_outcome = Some(outcome);
            return run;
        }
        run.poll_outcome = Some(outcome);

        if !completed && scenario.skip_violations_unless_completed {
            tracing::info!(user = label, "scan not completed, skipping violations");
            return run;
        }

        let start = Instant::now();
        let result = self.client.get_violations(scenario, &request.path).await;
        let status = result.as_ref().map(|(resp, _)| Some(resp.status));
        if self.track(&mut run, label, StepKind::GetViolations, start, status).await
            && let Ok((_, total)) = result
        {
            run.violations = total;
        }

        run
    }

    /// Record a finished step. Returns false when the iteration must stop.
    async fn track(
        &self,
        run: &mut PipelineRun,
        label: &str,
        step: StepKind,
        start: Instant,
        result: Result<Option<u16>, &LoadError>,
    ) -> bool {
        let latency = start.elapsed();
        let (ok, status) = match result {
            Ok(status) => (true, status),
            Err(e) => {
                tracing::warn!(user = label, step = %step, "step failed: {e}");
                (false, e.status())
            }
        };
        self.stats.record(step, latency, ok, status).await;
        run.steps.push(StepRecord {
            step,
            latency,
            ok,
            status,
        });

        match result {
            Err(e) if e.is_fatal() => {
                run.aborted = Some(e.to_string());
                false
            }
            _ => true,
        }
    }
}

fn status_of(result: &Result<crate::platform::StepResponse, LoadError>) -> Result<Option<u16>, &LoadError> {
    result.as_ref().map(|resp| Some(resp.status))
}
