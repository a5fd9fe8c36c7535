pub mod payloads;
pub mod status;

use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;

use crate::config::{PlatformConfig, ScenarioConfig};
use crate::error::{LoadError, truncate_body};
use crate::gate::PollRequest;

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// The steps of one scan pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    CreateRepository,
    PushImage,
    CreatePolicy,
    CreateWatch,
    ApplyWatch,
    CheckScanStatus,
    GetViolations,
}

impl StepKind {
    pub const ALL: [StepKind; 7] = [
        StepKind::CreateRepository,
        StepKind::PushImage,
        StepKind::CreatePolicy,
        StepKind::CreateWatch,
        StepKind::ApplyWatch,
        StepKind::CheckScanStatus,
        StepKind::GetViolations,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateRepository => "Create Repository",
            Self::PushImage => "Push Image",
            Self::CreatePolicy => "Create Policy",
            Self::CreateWatch => "Create Watch",
            Self::ApplyWatch => "Apply Watch",
            Self::CheckScanStatus => "Check Scan Status",
            Self::GetViolations => "Get Violations",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepted response of one REST step.
#[derive(Debug)]
pub struct StepResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Status codes each create step treats as success. 409 means the resource
/// already exists, which is expected once the first user has run.
const CREATE_OK: &[u16] = &[200, 201, 409];
const REPOSITORY_OK: &[u16] = &[200, 409];

#[derive(Deserialize)]
struct ViolationsPage {
    total_violations: Option<u64>,
}

/// REST client for the scanning platform. One instance is shared by all
/// virtual users so connections are pooled.
pub struct PlatformClient {
    client: Client,
    config: PlatformConfig,
}

impl PlatformClient {
    pub fn new(config: PlatformConfig) -> Result<Self, LoadError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LoadError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Send one JSON request and classify the response.
    ///
    /// `accepted` lists non-2xx codes that still count as success for this step;
    /// an empty slice accepts any 2xx.
    async fn send_step(
        &self,
        step: StepKind,
        method: Method,
        path: &str,
        body: &serde_json::Value,
        accepted: &[u16],
    ) -> Result<StepResponse, LoadError> {
        let response = self
            .client
            .request(method, self.url(path))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LoadError::AuthFailed {
                step: step.name().to_string(),
                message: format!("HTTP {status}"),
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LoadError::RateLimited {
                step: step.name().to_string(),
            });
        }

        if let Some(len) = response.content_length()
            && len as usize > MAX_RESPONSE_BYTES
        {
            return Err(LoadError::Upstream {
                step: step.name().to_string(),
                message: format!("response too large: {len} bytes (max {MAX_RESPONSE_BYTES})"),
                status: Some(status.as_u16()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| LoadError::Upstream {
            step: step.name().to_string(),
            message: format!("failed to read response body: {e}"),
            status: Some(status.as_u16()),
        })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(LoadError::Upstream {
                step: step.name().to_string(),
                message: format!(
                    "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                    bytes.len()
                ),
                status: Some(status.as_u16()),
            });
        }

        let code = status.as_u16();
        let ok = if accepted.is_empty() {
            status.is_success()
        } else {
            accepted.contains(&code)
        };

        if !ok {
            let text = String::from_utf8_lossy(&bytes);
            return Err(LoadError::Upstream {
                step: step.name().to_string(),
                message: format!("{status}: {}", truncate_body(&text)),
                status: Some(code),
            });
        }

        Ok(StepResponse {
            status: code,
            body: bytes.to_vec(),
        })
    }

    pub async fn create_repository(&self) -> Result<StepResponse, LoadError> {
        let path = format!("/artifactory/api/repositories/{}", self.config.repo);
        self.send_step(
            StepKind::CreateRepository,
            Method::PUT,
            &path,
            &payloads::repository(&self.config.repo),
            REPOSITORY_OK,
        )
        .await
    }

    pub async fn create_policy(&self, scenario: &ScenarioConfig) -> Result<StepResponse, LoadError> {
        self.send_step(
            StepKind::CreatePolicy,
            Method::POST,
            "/xray/api/v2/policies",
            &payloads::security_policy(&scenario.policy_name),
            CREATE_OK,
        )
        .await
    }

    pub async fn create_watch(&self, scenario: &ScenarioConfig) -> Result<StepResponse, LoadError> {
        self.send_step(
            StepKind::CreateWatch,
            Method::POST,
            "/xray/api/v2/watches",
            &payloads::watch(&scenario.watch_name, &self.config.repo, &scenario.policy_name),
            CREATE_OK,
        )
        .await
    }

    pub async fn apply_watch(&self, scenario: &ScenarioConfig) -> Result<StepResponse, LoadError> {
        self.send_step(
            StepKind::ApplyWatch,
            Method::POST,
            "/xray/api/v1/applyWatch",
            &payloads::apply_watch(&scenario.watch_name, Utc::now()),
            &[],
        )
        .await
    }

    pub async fn artifact_status(&self, request: &PollRequest) -> Result<StepResponse, LoadError> {
        self.send_step(
            StepKind::CheckScanStatus,
            Method::POST,
            "/xray/api/v1/artifact/status",
            &payloads::artifact_status(request),
            &[],
        )
        .await
    }

    /// Fetch violations for the artifact; returns the response and the
    /// reported violation total when the body carries one.
    pub async fn get_violations(
        &self,
        scenario: &ScenarioConfig,
        artifact_path: &str,
    ) -> Result<(StepResponse, Option<u64>), LoadError> {
        let response = self
            .send_step(
                StepKind::GetViolations,
                Method::POST,
                "/xray/api/v1/violations",
                &payloads::violations(&scenario.watch_name, &self.config.repo, artifact_path),
                &[],
            )
            .await?;
        let total = serde_json::from_slice::<ViolationsPage>(&response.body)
            .ok()
            .and_then(|page| page.total_violations);
        Ok((response, total))
    }
}
