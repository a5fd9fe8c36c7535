use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::LoadError;
use crate::gate::PollConfig;

/// Config file consulted when `XRAY_LOAD_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "xray-load.toml";

/// Connection details for the scanning platform.
#[derive(Clone)]
pub struct PlatformConfig {
    /// e.g. `https://acme.jfrog.io`
    pub base_url: String,
    /// Docker registry host, e.g. `acme.jfrog.io`.
    pub registry: String,
    pub username: String,
    pub password: String,
    pub repo: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("base_url", &self.base_url)
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("repo", &self.repo)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub name: String,
    pub tag: String,
    /// Run the docker pull/tag/push step. Off when the image is already in place.
    pub push: bool,
    pub docker: String,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub policy_name: String,
    pub watch_name: String,
    pub skip_violations_unless_completed: bool,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub users: usize,
    /// Users started per second during ramp-up.
    pub spawn_rate: f64,
    pub run_time: Duration,
    pub wait_min: Duration,
    pub wait_max: Duration,
    pub shutdown_grace: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            users: 1,
            spawn_rate: 1.0,
            run_time: Duration::from_secs(60),
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl LoadConfig {
    /// Delay between starting two users. `None` when `spawn_rate` is not a
    /// positive number or is so small the gap cannot be represented.
    pub fn spawn_gap(&self) -> Option<Duration> {
        if !(self.spawn_rate.is_finite() && self.spawn_rate > 0.0) {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / self.spawn_rate).ok()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub platform: PlatformConfig,
    pub image: ImageConfig,
    pub scenario: ScenarioConfig,
    pub load: LoadConfig,
    pub poll: PollConfig,
    pub report_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// TOML file layout. Every field optional; env vars override.
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub platform: PlatformSection,
    pub image: ImageSection,
    pub scenario: ScenarioSection,
    pub load: LoadSection,
    pub poll: PollSection,
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformSection {
    pub platform_id: Option<String>,
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub repo: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSection {
    pub name: Option<String>,
    pub tag: Option<String>,
    pub push: Option<bool>,
    pub docker: Option<String>,
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioSection {
    pub policy_name: Option<String>,
    pub watch_name: Option<String>,
    pub skip_violations_unless_completed: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadSection {
    pub users: Option<usize>,
    pub spawn_rate: Option<f64>,
    pub run_time_secs: Option<u64>,
    pub wait_min_secs: Option<u64>,
    pub wait_max_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollSection {
    pub max_attempts: Option<u32>,
    pub interval_ms: Option<u64>,
    pub initial_delay_ms: Option<u64>,
}

impl FileConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, LoadError> {
        toml::from_str(s).map_err(|e| LoadError::Config(format!("config file: {e}")))
    }

    pub fn read(path: &Path) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LoadError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Overlay environment variables onto the file values.
    pub fn apply_env<F>(&mut self, get: F) -> Result<(), LoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let p = &mut self.platform;
        set_string(&mut p.username, get("JFROG_USERNAME"));
        set_string(&mut p.password, get("JFROG_PASSWORD"));
        set_string(&mut p.platform_id, get("JFROG_PLATFORM_ID"));
        set_string(&mut p.base_url, get("JFROG_BASE_URL"));
        set_string(&mut p.repo, get("JFROG_REPO_NAME"));

        set_string(&mut self.image.name, get("DOCKER_IMAGE_NAME"));
        set_string(&mut self.image.tag, get("DOCKER_IMAGE_TAG"));
        set_parsed(&mut self.image.push, "XRAY_LOAD_PUSH_IMAGE", get("XRAY_LOAD_PUSH_IMAGE"))?;

        let l = &mut self.load;
        set_parsed(&mut l.users, "XRAY_LOAD_USERS", get("XRAY_LOAD_USERS"))?;
        set_parsed(&mut l.spawn_rate, "XRAY_LOAD_SPAWN_RATE", get("XRAY_LOAD_SPAWN_RATE"))?;
        set_parsed(&mut l.run_time_secs, "XRAY_LOAD_RUN_TIME_SECS", get("XRAY_LOAD_RUN_TIME_SECS"))?;

        let q = &mut self.poll;
        set_parsed(&mut q.max_attempts, "XRAY_POLL_MAX_ATTEMPTS", get("XRAY_POLL_MAX_ATTEMPTS"))?;
        set_parsed(&mut q.interval_ms, "XRAY_POLL_INTERVAL_MS", get("XRAY_POLL_INTERVAL_MS"))?;
        set_parsed(
            &mut q.initial_delay_ms,
            "XRAY_POLL_INITIAL_DELAY_MS",
            get("XRAY_POLL_INITIAL_DELAY_MS"),
        )?;

        if let Some(path) = get("XRAY_LOAD_REPORT").filter(|v| !v.trim().is_empty()) {
            self.report_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Resolve defaults and validate.
    pub fn resolve(self) -> Result<Config, LoadError> {
        let p = self.platform;
        let (base_url, registry) = resolve_endpoint(p.platform_id.as_deref(), p.base_url.as_deref())?;

        let username = p
            .username
            .ok_or_else(|| LoadError::Config("JFROG_USERNAME is not set".into()))?;
        let password = p
            .password
            .ok_or_else(|| LoadError::Config("JFROG_PASSWORD is not set".into()))?;

        let platform = PlatformConfig {
            base_url,
            registry,
            username,
            password,
            repo: p.repo.unwrap_or_else(|| "docker-local".to_string()),
            request_timeout: Duration::from_secs(p.request_timeout_secs.unwrap_or(60)),
        };

        let image = ImageConfig {
            name: self.image.name.unwrap_or_else(|| "alpine".to_string()),
            tag: self.image.tag.unwrap_or_else(|| "3.9".to_string()),
            push: self.image.push.unwrap_or(true),
            docker: self.image.docker.unwrap_or_else(|| "docker".to_string()),
            command_timeout: Duration::from_secs(self.image.command_timeout_secs.unwrap_or(300)),
        };

        let scenario = ScenarioConfig {
            policy_name: self
                .scenario
                .policy_name
                .unwrap_or_else(|| "sec_policy_1".to_string()),
            watch_name: self.scenario.watch_name.unwrap_or_else(|| "watch_1".to_string()),
            skip_violations_unless_completed: self
                .scenario
                .skip_violations_unless_completed
                .unwrap_or(false),
        };

        let defaults = LoadConfig::default();
        let l = self.load;
        let load = LoadConfig {
            users: l.users.unwrap_or(defaults.users),
            spawn_rate: l.spawn_rate.unwrap_or(defaults.spawn_rate),
            run_time: l.run_time_secs.map(Duration::from_secs).unwrap_or(defaults.run_time),
            wait_min: l.wait_min_secs.map(Duration::from_secs).unwrap_or(defaults.wait_min),
            wait_max: l.wait_max_secs.map(Duration::from_secs).unwrap_or(defaults.wait_max),
            shutdown_grace: l
                .shutdown_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        };

        let poll_defaults = PollConfig::default();
        let poll = PollConfig::new(
            self.poll.max_attempts.unwrap_or(poll_defaults.max_attempts.get()),
            self.poll
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(poll_defaults.interval),
        )?
        .with_initial_delay(
            self.poll
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(poll_defaults.initial_delay),
        );

        let config = Config {
            platform,
            image,
            scenario,
            load,
            poll,
            report_path: self.report_path,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Load from the optional TOML file, then the process environment.
    pub fn load() -> Result<Self, LoadError> {
        let mut file = match std::env::var("XRAY_LOAD_CONFIG") {
            Ok(path) => FileConfig::read(Path::new(&path))?,
            Err(_) => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    FileConfig::read(default)?
                } else {
                    FileConfig::default()
                }
            }
        };
        file.apply_env(|key| std::env::var(key).ok())?;
        file.resolve()
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.load.users == 0 {
            return Err(LoadError::Config("users must be at least 1".into()));
        }
        if !(self.load.spawn_rate.is_finite() && self.load.spawn_rate > 0.0) {
            return Err(LoadError::Config("spawn_rate must be a positive number".into()));
        }
        if self.load.spawn_gap().is_none() {
            return Err(LoadError::Config(format!(
                "spawn_rate too small: {}",
                self.load.spawn_rate
            )));
        }
        if self.load.wait_min > self.load.wait_max {
            return Err(LoadError::Config(format!(
                "wait_min ({}s) exceeds wait_max ({}s)",
                self.load.wait_min.as_secs(),
                self.load.wait_max.as_secs()
            )));
        }
        if self.platform.repo.trim().is_empty() {
            return Err(LoadError::Config("repository name is empty".into()));
        }
        Ok(())
    }
}

/// Work out the REST base URL and docker registry host.
/// An explicit base URL wins over the platform id.
fn resolve_endpoint(
    platform_id: Option<&str>,
    base_url: Option<&str>,
) -> Result<(String, String), LoadError> {
    if let Some(raw) = base_url.filter(|s| !s.trim().is_empty()) {
        let url = reqwest::Url::parse(raw.trim())
            .map_err(|e| LoadError::Config(format!("invalid base url {raw:?}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| LoadError::Config(format!("base url {raw:?} has no host")))?;
        let registry = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        return Ok((url.as_str().trim_end_matches('/').to_string(), registry));
    }

    match platform_id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => Ok((format!("https://{id}.jfrog.io"), format!("{id}.jfrog.io"))),
        None => Err(LoadError::Config(
            "JFROG_PLATFORM_ID or JFROG_BASE_URL must be set".into(),
        )),
    }
}

fn set_string(slot: &mut Option<String>, value: Option<String>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        *slot = Some(v);
    }
}

fn set_parsed<T: std::str::FromStr>(
    slot: &mut Option<T>,
    key: &str,
    value: Option<String>,
) -> Result<(), LoadError> {
    if let Some(raw) = value.filter(|v| !v.trim().is_empty()) {
        let parsed = raw
            .trim()
            .parse()
            .map_err(|_| LoadError::Config(format!("{key}: cannot parse {raw:?}")))?;
        *slot = Some(parsed);
    }
    Ok(())
}
