//! Request bodies for the platform's REST API.
//!
//! Shapes follow the Artifactory and Xray contracts and are not ours to change.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use crate::gate::PollRequest;

/// Local docker repository with Xray indexing on.
pub fn repository(repo: &str) -> Value {
    json!({
        "key": repo,
        "packageType": "docker",
        "rclass": "local",
        "xrayIndex": true,
    })
}

/// Security policy flagging high-severity CVEs without blocking downloads.
pub fn security_policy(name: &str) -> Value {
    json!({
        "name": name,
        "description": "High severity CVEs",
        "type": "security",
        "rules": [{
            "name": "block_high",
            "criteria": {"min_severity": "high"},
            "actions": {"block_download": {"active": false}},
            "priority": 1,
        }],
    })
}

/// Watch over every artifact in `repo`, assigned to `policy`.
pub fn watch(name: &str, repo: &str, policy: &str) -> Value {
    json!({
        "general_data": {
            "name": name,
            "description": "Watch for docker repo",
            "active": true,
        },
        "project_resources": {
            "resources": [{
                "type": "repository",
                "bin_mgr_id": "default",
                "name": repo,
                "filters": [{"type": "regex", "value": ".*"}],
            }],
        },
        "assigned_policies": [{"name": policy, "type": "security"}],
    })
}

/// Apply `watch` to artifacts in a zero-length window at `now`.
pub fn apply_watch(watch: &str, now: DateTime<Utc>) -> Value {
    let ts = now.to_rfc3339_opts(SecondsFormat::Micros, false);
    json!({
        "watch_names": [watch],
        "date_range": {
            "start_date": ts,
            "end_date": ts,
        },
    })
}

pub fn artifact_status(request: &PollRequest) -> Value {
    json!({
        "repo": request.repo,
        "path": request.path,
    })
}

/// First page of high-severity security violations for one artifact.
pub fn violations(watch: &str, repo: &str, path: &str) -> Value {
    json!({
        "filters": {
            "watch_name": watch,
            "violation_type": "Security",
            "min_severity": "High",
            "resources": {
                "artifacts": [{"repo": repo, "path": path}],
            },
        },
        "pagination": {
            "order_by": "created",
            "direction": "asc",
            "limit": 100,
            "offset": 1,
        },
    })
}
