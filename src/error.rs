use thiserror::Error;

/// Cap on upstream error bodies carried inside errors and log lines.
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("auth failed on {step}: {message}")]
    AuthFailed { step: String, message: String },

    #[error("rate limited on {step}")]
    RateLimited { step: String },

    #[error("upstream error on {step}: {message}")]
    Upstream {
        step: String,
        message: String,
        status: Option<u16>,
    },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("{command} exited with code {code}: {stderr}")]
    ProcessExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl LoadError {
    /// Step name for variants raised while talking to the platform.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::AuthFailed { step, .. } => Some(step),
            Self::RateLimited { step } => Some(step),
            Self::Upstream { step, .. } => Some(step),
            _ => None,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => *status,
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Errors that make further requests with the same credentials pointless.
    /// A polling sequence ends as `Failed` on these instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed { .. })
    }
}

/// Tail-truncate an upstream body for error messages.
pub fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_failures_are_fatal() {
        let auth = LoadError::AuthFailed {
            step: "Check Scan Status".into(),
            message: "401".into(),
        };
        assert!(auth.is_fatal());
        assert_eq!(auth.step(), Some("Check Scan Status"));

        let upstream = LoadError::Upstream {
            step: "Check Scan Status".into(),
            message: "boom".into(),
            status: Some(503),
        };
        assert!(!upstream.is_fatal());
        assert_eq!(upstream.status(), Some(503));
        assert_eq!(upstream.step(), Some("Check Scan Status"));
    }

    #[test]
    fn rate_limits_and_client_errors_are_not_fatal() {
        let limited = LoadError::RateLimited {
            step: "Create Policy".into(),
        };
        assert!(!limited.is_fatal());
        assert_eq!(limited.status(), None);

        let bad = LoadError::Upstream {
            step: "Create Policy".into(),
            message: "bad request".into(),
            status: Some(400),
        };
        assert!(!bad.is_fatal());
        assert_eq!(bad.status(), Some(400));
    }

    #[test]
    fn truncate_body_caps_long_text() {
        let long = "x".repeat(1000);
        let out = truncate_body(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), MAX_ERROR_BODY_CHARS + 3);
        assert_eq!(truncate_body("  short \n"), "short");
    }
}
