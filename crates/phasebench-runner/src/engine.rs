use crate::config::EngineConfig;
use crate::error::UnitError;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitRef(pub String);

impl UnitRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(12).collect();
        f.write_str(&short)
    }
}

pub trait Engine: Send + Sync {
    // Create a unit from `image`. With `publish`, that TCP port is bound to
    // the same port on the host.
    fn create(&self, image: &str, publish: Option<u16>) -> Result<UnitRef, UnitError>;
    fn start(&self, unit: &UnitRef) -> Result<(), UnitError>;
    fn stats(&self, unit: &UnitRef) -> Result<RawStats, UnitError>;
    fn stop(&self, unit: &UnitRef) -> Result<(), UnitError>;
    fn remove(&self, unit: &UnitRef, force: bool) -> Result<(), UnitError>;
    fn info(&self) -> Result<EngineInfo, UnitError>;
}

// One stats sample as reported by the engine. Fields stay optional so a
// short sample is reported as an incomplete measurement instead of a decode
// failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStats {
    #[serde(default)]
    pub cpu_stats: RawCpuStats,
    #[serde(default)]
    pub memory_stats: RawMemoryStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCpuStats {
    #[serde(default)]
    pub cpu_usage: RawCpuUsage,
    pub system_cpu_usage: Option<u64>,
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCpuUsage {
    pub total_usage: Option<u64>,
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMemoryStats {
    pub usage: Option<u64>,
    pub limit: Option<u64>,
    pub max_usage: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineInfo {
    #[serde(rename = "DriverStatus", default)]
    pub driver_status: Option<Vec<Vec<String>>>,
    #[serde(rename = "DockerRootDir", default)]
    pub root_dir: Option<String>,
}

impl EngineInfo {
    pub fn driver_field(&self, name: &str) -> Option<&str> {
        self.driver_status
            .as_ref()?
            .iter()
            .find(|pair| pair.first().map(String::as_str) == Some(name))
            .and_then(|pair| pair.get(1))
            .map(String::as_str)
    }

    pub fn data_space_used(&self) -> Option<u64> {
        self.driver_field("Data Space Used").and_then(parse_size)
    }
}

/// Parse a human readable size such as `1.2 GB` or `512KiB` into bytes.
/// Decimal suffixes use powers of 1000, `i` suffixes powers of 1024.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let unit = unit.trim().to_ascii_lowercase();
    let multiplier: f64 = match unit.as_str() {
        "" | "b" | "bytes" => 1.0,
        "k" | "kb" => 1e3,
        "m" | "mb" => 1e6,
        "g" | "gb" => 1e9,
        "t" | "tb" => 1e12,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier).round() as u64)
}

pub struct DockerEngine {
    base_url: String,
    client: Client,
}

impl DockerEngine {
    pub fn connect(config: &EngineConfig) -> Result<Self, UnitError> {
        let mut builder = Client::builder();
        // reqwest's blocking client applies a 30s default; no timeout unless configured.
        builder = match config.request_timeout_secs {
            Some(secs) => builder.timeout(Duration::from_secs(secs)),
            None => builder.timeout(None::<Duration>),
        };
        let client = builder
            .build()
            .map_err(|e| UnitError::api(None, format!("failed to build engine client: {}", e)))?;
        Ok(Self {
            base_url: normalize_engine_url(&config.url),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<Response, UnitError> {
        let response = request.send().map_err(transport_error)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| body.trim().to_string());
        Err(UnitError::api(Some(status.as_u16()), message))
    }
}

impl Engine for DockerEngine {
    fn create(&self, image: &str, publish: Option<u16>) -> Result<UnitRef, UnitError> {
        let mut body = json!({ "Image": image });
        if let Some(port) = publish {
            let key = format!("{}/tcp", port);
            body["ExposedPorts"] = json!({ key.clone(): {} });
            body["HostConfig"] = json!({
                "PortBindings": { key: [{ "HostPort": port.to_string() }] }
            });
        }
        let response = self.send(self.client.post(self.url("/containers/create")).json(&body))?;
        let created: Value = response.json().map_err(transport_error)?;
        created
            .get("Id")
            .and_then(|v| v.as_str())
            .map(|id| UnitRef(id.to_string()))
            .ok_or_else(|| UnitError::api(None, "create response carried no container Id"))
    }

    fn start(&self, unit: &UnitRef) -> Result<(), UnitError> {
        let path = format!("/containers/{}/start", unit.as_str());
        self.send(self.client.post(self.url(&path)))?;
        Ok(())
    }

    fn stats(&self, unit: &UnitRef) -> Result<RawStats, UnitError> {
        let path = format!("/containers/{}/stats?stream=false", unit.as_str());
        let response = self.send(self.client.get(self.url(&path)))?;
        response.json().map_err(transport_error)
    }

    fn stop(&self, unit: &UnitRef) -> Result<(), UnitError> {
        let path = format!("/containers/{}/stop", unit.as_str());
        self.send(self.client.post(self.url(&path)))?;
        Ok(())
    }

    fn remove(&self, unit: &UnitRef, force: bool) -> Result<(), UnitError> {
        let path = format!("/containers/{}?force={}", unit.as_str(), force);
        self.send(self.client.delete(self.url(&path)))?;
        Ok(())
    }

    fn info(&self) -> Result<EngineInfo, UnitError> {
        let response = self.send(self.client.get(self.url("/info")))?;
        response.json().map_err(transport_error)
    }
}

fn transport_error(err: reqwest::Error) -> UnitError {
    if err.is_timeout() {
        UnitError::BackendTimeout(err.to_string())
    } else if err.is_decode() {
        UnitError::Unexpected(format!("undecodable engine response: {}", err))
    } else {
        UnitError::api(err.status().map(|s| s.as_u16()), err.to_string())
    }
}

fn normalize_engine_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    match url.strip_prefix("tcp://") {
        Some(rest) => format!("http://{}", rest),
        None if url.starts_with("http://") || url.starts_with("https://") => url.to_string(),
        None => format!("http://{}", url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::{Arc, Mutex};
    use std::thread;

    type Seen = Arc<Mutex<Vec<(String, String, String)>>>;

    // Serves `count` requests with canned (status, body) replies chosen by route.
    fn fake_docker(
        count: usize,
        reply: fn(&str, &str) -> (u16, String),
    ) -> (String, Seen, thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind fake engine");
        let addr = server.server_addr().to_ip().expect("ip listener");
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let handle = thread::spawn(move || {
            for _ in 0..count {
                let mut request = match server.recv() {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let method = request.method().to_string();
                let url = request.url().to_string();
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let (status, payload) = reply(&method, &url);
                log.lock().unwrap().push((method, url, body));
                let response = tiny_http::Response::from_string(payload).with_status_code(status);
                let _ = request.respond(response);
            }
        });
        (format!("tcp://{}", addr), seen, handle)
    }

    fn engine(url: &str) -> DockerEngine {
        DockerEngine::connect(&EngineConfig {
            url: url.to_string(),
            request_timeout_secs: Some(5),
            ..EngineConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn parse_size_handles_decimal_and_binary_units() {
        assert_eq!(parse_size("1.2 GB"), Some(1_200_000_000));
        assert_eq!(parse_size("512KiB"), Some(512 * 1024));
        assert_eq!(parse_size("3 MB"), Some(3_000_000));
        assert_eq!(parse_size("42"), Some(42));
        assert_eq!(parse_size("1.5 kB"), Some(1500));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size("12 parsecs"), None);
    }

    #[test]
    fn engine_info_reads_driver_status() {
        let info: EngineInfo = serde_json::from_value(json!({
            "DriverStatus": [["Pool Name", "docker-pool"], ["Data Space Used", "2.5 MB"]],
            "DockerRootDir": "/var/lib/docker"
        }))
        .unwrap();
        assert_eq!(info.data_space_used(), Some(2_500_000));
        assert_eq!(info.root_dir.as_deref(), Some("/var/lib/docker"));

        let bare: EngineInfo = serde_json::from_value(json!({ "DriverStatus": null })).unwrap();
        assert_eq!(bare.data_space_used(), None);
    }

    #[test]
    fn engine_url_normalization() {
        assert_eq!(normalize_engine_url("tcp://10.0.0.1:2375"), "http://10.0.0.1:2375");
        assert_eq!(normalize_engine_url("http://docker:2375/"), "http://docker:2375");
        assert_eq!(normalize_engine_url("localhost:2375"), "http://localhost:2375");
    }

    #[test]
    fn unit_ref_displays_short_id() {
        let unit = UnitRef("0123456789abcdef0123".into());
        assert_eq!(unit.to_string(), "0123456789ab");
    }

    #[test]
    fn lifecycle_calls_hit_docker_routes() {
        let (url, seen, server) = fake_docker(6, |method, url| match (method, url) {
            ("POST", "/containers/create") => (201, r#"{"Id":"abc123","Warnings":[]}"#.into()),
            ("POST", "/containers/abc123/start") => (204, String::new()),
            ("GET", "/containers/abc123/stats?stream=false") => (
                200,
                r#"{"cpu_stats":{"cpu_usage":{"total_usage":150,"percpu_usage":[1,2]},"system_cpu_usage":1100},
                    "memory_stats":{"usage":512,"limit":2048,"max_usage":600}}"#
                    .into(),
            ),
            ("POST", "/containers/abc123/stop") => (304, String::new()),
            ("DELETE", "/containers/abc123?force=true") => (204, String::new()),
            ("GET", "/info") => (
                200,
                r#"{"DriverStatus":[["Data Space Used","1 kB"]],"DockerRootDir":"/tmp"}"#.into(),
            ),
            _ => (404, r#"{"message":"no route"}"#.into()),
        });
        let docker = engine(&url);

        let unit = docker.create("ptdocker:latest", Some(39000)).expect("create");
        assert_eq!(unit, UnitRef("abc123".into()));
        docker.start(&unit).expect("start");
        let stats = docker.stats(&unit).expect("stats");
        assert_eq!(stats.cpu_stats.cpu_usage.total_usage, Some(150));
        assert_eq!(stats.memory_stats.limit, Some(2048));
        docker.stop(&unit).expect("stop tolerates 304");
        docker.remove(&unit, true).expect("remove");
        assert_eq!(docker.info().expect("info").data_space_used(), Some(1000));
        server.join().unwrap();

        let seen = seen.lock().unwrap();
        let create_body: Value = serde_json::from_str(&seen[0].2).unwrap();
        assert_eq!(create_body["Image"], "ptdocker:latest");
        assert_eq!(
            create_body["HostConfig"]["PortBindings"]["39000/tcp"][0]["HostPort"],
            "39000"
        );
        assert!(create_body["ExposedPorts"].get("39000/tcp").is_some());
    }

    #[test]
    fn api_failures_carry_status_and_message() {
        let (url, _seen, server) = fake_docker(2, |_, url| {
            if url.starts_with("/containers/create") {
                (404, r#"{"message":"No such image: missing:latest"}"#.into())
            } else {
                (500, "engine exploded".into())
            }
        });
        let docker = engine(&url);
        let err = docker.create("missing:latest", None).unwrap_err();
        assert_eq!(err, UnitError::api(Some(404), "No such image: missing:latest"));
        let err = docker.start(&UnitRef("x".into())).unwrap_err();
        assert_eq!(err, UnitError::api(Some(500), "engine exploded"));
        server.join().unwrap();
    }

    #[test]
    fn unreachable_engine_is_an_api_error() {
        let docker = engine("http://127.0.0.1:1");
        match docker.info() {
            Err(UnitError::BackendApi { status: None, .. }) => {}
            other => panic!("expected connection failure, got {:?}", other),
        }
    }
}
