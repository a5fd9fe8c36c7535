//! Minimal HTTP/1.1 mock of the platform for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use xray_load::config::{Config, FileConfig};

#[derive(Debug, Clone)]
pub struct Hit {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Hit {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

type Route = dyn Fn(&str, &str, usize) -> (u16, String) + Send + Sync;

pub struct MockPlatform {
    pub port: u16,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl MockPlatform {
    /// Serve every connection with `route(method, path, nth)`, where `nth`
    /// counts earlier requests to the same path (0-based).
    pub async fn start<F>(route: F) -> Self
    where
        F: Fn(&str, &str, usize) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let route: Arc<Route> = Arc::new(route);

        let server_hits = hits.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let hits = server_hits.clone();
                let route = route.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, hits, route).await;
                });
            }
        });

        Self { port, hits }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }

    pub fn hits_for(&self, path: &str) -> Vec<Hit> {
        self.hits().into_iter().filter(|h| h.path == path).collect()
    }
}

async fn serve(
    mut socket: TcpStream,
    hits: Arc<Mutex<Vec<Hit>>>,
    route: Arc<Route>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();
    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    let nth = {
        let mut guard = hits.lock().unwrap();
        let nth = guard.iter().filter(|h| h.path == path).count();
        guard.push(Hit {
            method: method.clone(),
            path: path.clone(),
            headers,
            body,
        });
        nth
    };

    let (status, response_body) = route(&method, &path, nth);
    let response = format!(
        "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
        response_body.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

/// Config pointing at a mock platform, with the docker push disabled and
/// fast polling.
pub fn test_config(base_url: &str, extra: &str) -> Config {
    let toml = format!(
        r#"
[platform]
base_url = "{base_url}"
username = "loadtester"
password = "s3cret"
request_timeout_secs = 5

[image]
push = false

[poll]
max_attempts = 3
interval_ms = 10

{extra}
"#
    );
    FileConfig::from_toml_str(&toml).unwrap().resolve().unwrap()
}
