use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{ImageConfig, PlatformConfig};
use crate::error::LoadError;

/// Pushes the test image into the platform's docker registry with the
/// docker CLI.
///
/// - No shell: `Command::new` + args
/// - `kill_on_drop(true)` so a timed-out command does not linger
/// - Password delivered on stdin (`--password-stdin`), never in argv
pub struct ImagePusher {
    docker: String,
    image: String,
    tag: String,
    registry: String,
    repo: String,
    username: String,
    password: String,
    timeout: Duration,
}

impl ImagePusher {
    pub fn new(platform: &PlatformConfig, image: &ImageConfig) -> Self {
        Self {
            docker: image.docker.clone(),
            image: image.name.clone(),
            tag: image.tag.clone(),
            registry: platform.registry.clone(),
            repo: platform.repo.clone(),
            username: platform.username.clone(),
            password: platform.password.clone(),
            timeout: image.command_timeout,
        }
    }

    /// Fully qualified reference of the image inside the platform registry.
    pub fn remote_ref(&self) -> String {
        format!("{}/{}/{}:{}", self.registry, self.repo, self.image, self.tag)
    }

    fn local_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// The four docker invocations, in order. The login step reads stdin.
    pub fn commands(&self) -> Vec<(Vec<String>, bool)> {
        vec![
            (vec!["pull".into(), self.local_ref()], false),
            (
                vec![
                    "login".into(),
                    self.registry.clone(),
                    "-u".into(),
                    self.username.clone(),
                    "--password-stdin".into(),
                ],
                true,
            ),
            (vec!["tag".into(), self.local_ref(), self.remote_ref()], false),
            (vec!["push".into(), self.remote_ref()], false),
        ]
    }

    /// Pull, log in, tag and push. Stops at the first failing command.
    pub async fn push(&self) -> Result<(), LoadError> {
        for (args, wants_password) in self.commands() {
            let stdin = wants_password.then_some(self.password.as_str());
            self.run(&args, stdin).await?;
        }
        tracing::info!(image = %self.remote_ref(), "image pushed");
        Ok(())
    }

    async fn run(&self, args: &[String], stdin: Option<&str>) -> Result<(), LoadError> {
        let start = Instant::now();
        let label = format!("{} {}", self.docker, args.first().map(String::as_str).unwrap_or(""));

        let mut cmd = Command::new(&self.docker);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| LoadError::Other(format!("failed to spawn {}: {e}", self.docker)))?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes()).await?;
            // drop closes the pipe so the child sees EOF
            drop(pipe);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(LoadError::Timeout(start.elapsed().as_millis() as u64)),
        };

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(command = %label, code, "docker command failed");
            return Err(LoadError::ProcessExit {
                command: label,
                code,
                stderr,
            });
        }

        tracing::debug!(
            command = %label,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "docker command finished"
        );
        Ok(())
    }
}
