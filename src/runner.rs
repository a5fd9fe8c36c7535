use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, LoadConfig};
use crate::error::LoadError;
use crate::pipeline::ScanPipeline;
use crate::platform::PlatformClient;
use crate::report::Report;
use crate::stats::Stats;

/// Drives a load test: ramps up virtual users, lets each loop the scan
/// pipeline with random think time, and stops them at the end of the run.
///
/// Stop sequence:
/// - the run timer (or the caller's token) cancels the shared stop token
/// - users finish their current iteration within `shutdown_grace`
/// - whatever is still running after that is aborted and its in-flight
///   results are discarded
pub struct LoadRunner {
    config: Config,
    client: Arc<PlatformClient>,
    stats: Arc<Stats>,
}

impl LoadRunner {
    pub fn new(config: Config) -> Result<Self, LoadError> {
        let client = Arc::new(PlatformClient::new(config.platform.clone())?);
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: Config, client: Arc<PlatformClient>) -> Self {
        Self {
            config,
            client,
            stats: Arc::new(Stats::new()),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Report {
        let load = self.config.load.clone();
        let pipeline = Arc::new(ScanPipeline::new(
            self.client.clone(),
            &self.config,
            self.stats.clone(),
        ));

        let stop = shutdown.child_token();
        let timer = {
            let stop = stop.clone();
            let run_time = load.run_time;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(run_time) => {
                        tracing::info!(run_time_secs = run_time.as_secs(), "run time reached");
                        stop.cancel();
                    }
                    _ = stop.cancelled() => {}
                }
            })
        };

        match self.config.poll.worst_case_wait() {
            Some(bound) => tracing::info!(
                users = load.users,
                spawn_rate = load.spawn_rate,
                run_time_secs = load.run_time.as_secs(),
                poll_worst_case_ms = bound.as_millis() as u64,
                "starting load test"
            ),
            None => tracing::info!(
                users = load.users,
                spawn_rate = load.spawn_rate,
                run_time_secs = load.run_time.as_secs(),
                "starting load test, poll wait bound overflows"
            ),
        }

        let mut set = JoinSet::new();
        // An unrepresentable gap only happens for unvalidated configs; one
        // user per run is the closest meaning.
        let spawn_gap = load.spawn_gap().unwrap_or(load.run_time);

        for user in 0..load.users {
            if user > 0 {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(spawn_gap) => {}
                }
            }
            if stop.is_cancelled() {
                break;
            }
            set.spawn(virtual_user(
                user,
                pipeline.clone(),
                self.stats.clone(),
                load.clone(),
                stop.clone(),
            ));
            tracing::debug!(user, "virtual user started");
        }

        stop.cancelled().await;
        timer.abort();

        let stats = self.stats.clone();
        let drained = tokio::time::timeout(load.shutdown_grace, drain(&mut set, &stats)).await;
        if drained.is_err() {
            tracing::warn!(
                remaining = set.len(),
                grace_secs = load.shutdown_grace.as_secs(),
                "users still busy after grace period, aborting"
            );
            set.abort_all();
            drain(&mut set, &stats).await;
        }

        self.stats.snapshot(load.users).await
    }
}

async fn drain(set: &mut JoinSet<()>, stats: &Stats) {
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!("virtual user panicked: {e}");
            }
            stats.record_aborted_user().await;
        }
    }
}

async fn virtual_user(
    id: usize,
    pipeline: Arc<ScanPipeline>,
    stats: Arc<Stats>,
    load: LoadConfig,
    stop: CancellationToken,
) {
    let mut iteration: u64 = 0;
    while !stop.is_cancelled() {
        let label = format!("user-{id}-iter-{iteration}");
        let run = pipeline.run(&label).await;
        stats.record_iteration().await;

        if let Some(reason) = &run.aborted {
            tracing::warn!(user = label, "iteration aborted: {reason}");
        }
        iteration += 1;

        let wait = think_time(load.wait_min, load.wait_max);
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::debug!(user = id, iterations = iteration, "virtual user stopped");
}

/// Uniform random pause between iterations.
pub fn think_time(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let secs = rand::thread_rng().gen_range(min.as_secs_f64()..=max.as_secs_f64());
    Duration::from_secs_f64(secs)
}
