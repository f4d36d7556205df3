use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bay_domain::{Capability, RuntimeType};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::api::{CapabilityCall, RuntimeApi, RuntimeConnector, RuntimeDescription};
use crate::error::RuntimeError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error body runtimes return for expected failures.
#[derive(Debug, Deserialize)]
struct RuntimeErrorBody {
    code: String,
    message: String,
}

/// HTTP adapter for one runtime sidecar.
///
/// The code runtime exposes `/python/exec`, `/shell/exec`, and
/// `/filesystem/{op}`; the browser runtime exposes a single `/exec`. Both
/// share `/health` and `/meta`.
pub struct HttpRuntime {
    client: reqwest::Client,
    base: String,
    runtime_type: RuntimeType,
}

impl HttpRuntime {
    pub fn new(client: reqwest::Client, endpoint: &str, runtime_type: RuntimeType) -> Self {
        Self {
            client,
            base: endpoint.trim_end_matches('/').to_string(),
            runtime_type,
        }
    }

    fn capability_path(&self, call: &CapabilityCall) -> Result<String, RuntimeError> {
        match (self.runtime_type, call.capability) {
            (RuntimeType::CodeRuntime, Capability::Python) if call.operation == "exec" => {
                Ok("/python/exec".to_string())
            }
            (RuntimeType::CodeRuntime, Capability::Shell) if call.operation == "exec" => {
                Ok("/shell/exec".to_string())
            }
            (RuntimeType::CodeRuntime, Capability::Filesystem) => {
                Ok(format!("/filesystem/{}", call.operation))
            }
            (RuntimeType::BrowserRuntime, Capability::Browser) if call.operation == "exec" => {
                Ok("/exec".to_string())
            }
            _ => Err(RuntimeError::Protocol(format!(
                "{} runtime does not serve {}/{}",
                self.runtime_type, call.capability, call.operation
            ))),
        }
    }
}

fn map_transport(e: reqwest::Error) -> RuntimeError {
    if e.is_timeout() {
        RuntimeError::Timeout(e.to_string())
    } else {
        RuntimeError::Transient(e.to_string())
    }
}

async fn decode_failure(status: u16, response: reqwest::Response) -> RuntimeError {
    let bytes = response.bytes().await.unwrap_or_default();
    if (400..500).contains(&status) {
        if let Ok(body) = serde_json::from_slice::<RuntimeErrorBody>(&bytes) {
            return match body.code.as_str() {
                "invalid_path" => RuntimeError::InvalidPath(body.message),
                "validation" => RuntimeError::Validation(body.message),
                "not_found" => RuntimeError::NotFound(body.message),
                _ => RuntimeError::Runtime { status, message: body.message },
            };
        }
    }
    RuntimeError::Runtime {
        status,
        message: String::from_utf8_lossy(&bytes).into_owned(),
    }
}

#[async_trait]
impl RuntimeApi for HttpRuntime {
    async fn health(&self) -> Result<(), RuntimeError> {
        let response = self
            .client
            .get(format!("{}/health", self.base))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(map_transport)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(decode_failure(status.as_u16(), response).await)
        }
    }

    async fn meta(&self) -> Result<RuntimeDescription, RuntimeError> {
        let response = self
            .client
            .get(format!("{}/meta", self.base))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(map_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(decode_failure(status.as_u16(), response).await);
        }
        response
            .json::<RuntimeDescription>()
            .await
            .map_err(|e| RuntimeError::Protocol(format!("malformed meta: {e}")))
    }

    async fn invoke(&self, call: &CapabilityCall) -> Result<Value, RuntimeError> {
        let path = self.capability_path(call)?;
        debug!(
            capability = %call.capability,
            operation = %call.operation,
            path = %path,
            "runtime invoke"
        );
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&call.payload)
            .timeout(call.timeout)
            .send()
            .await
            .map_err(map_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(decode_failure(status.as_u16(), response).await);
        }
        let bytes = response.bytes().await.map_err(map_transport)?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Runtime {
            status: status.as_u16(),
            message: format!("unparseable response body: {e}"),
        })
    }
}

/// Production connector: one shared reqwest client, one adapter per
/// endpoint.
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConnector for HttpConnector {
    fn connect(&self, endpoint: &str, runtime_type: RuntimeType) -> Arc<dyn RuntimeApi> {
        Arc::new(HttpRuntime::new(self.client.clone(), endpoint, runtime_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn call(capability: Capability, operation: &str, payload: Value) -> CapabilityCall {
        CapabilityCall {
            capability,
            operation: operation.to_string(),
            payload,
            timeout: Duration::from_secs(5),
        }
    }

    fn adapter(server: &MockServer, runtime_type: RuntimeType) -> HttpRuntime {
        HttpRuntime::new(reqwest::Client::new(), &server.uri(), runtime_type)
    }

    #[tokio::test]
    async fn meta_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meta"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "runtime": {"name": "ship", "version": "0.3.1", "api_version": "1.2"},
                "workspace": {"mount_path": "/workspace"},
                "capabilities": {
                    "python": {"operations": ["exec"]},
                    "shell": {"operations": ["exec"]},
                    "filesystem": {"operations": ["read", "write", "list", "delete"]},
                    "telemetry": {"operations": ["snapshot"]}
                }
            })))
            .mount(&server)
            .await;

        let meta = adapter(&server, RuntimeType::CodeRuntime).meta().await.unwrap();
        assert!(meta.api_version_compatible());
        assert_eq!(meta.workspace.mount_path, "/workspace");
        // Unknown capability families are ignored.
        let caps = meta.known_capabilities();
        assert_eq!(caps.len(), 3);
        assert!(caps.contains(&Capability::Python));
    }

    #[tokio::test]
    async fn incompatible_api_major_detected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meta"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "runtime": {"name": "ship", "version": "9.0.0", "api_version": "2.0"},
                "workspace": {"mount_path": "/workspace"},
                "capabilities": {}
            })))
            .mount(&server)
            .await;

        let meta = adapter(&server, RuntimeType::CodeRuntime).meta().await.unwrap();
        assert!(!meta.api_version_compatible());
    }

    #[tokio::test]
    async fn code_runtime_paths() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/python/exec"))
            .and(body_json(json!({"code": "print(1+1)"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": "2"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/filesystem/read"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "keep"})))
            .mount(&server)
            .await;

        let rt = adapter(&server, RuntimeType::CodeRuntime);
        let out = rt
            .invoke(&call(Capability::Python, "exec", json!({"code": "print(1+1)"})))
            .await
            .unwrap();
        assert_eq!(out["output"], "2");

        let out = rt
            .invoke(&call(Capability::Filesystem, "read", json!({"path": "state.txt"})))
            .await
            .unwrap();
        assert_eq!(out["content"], "keep");
    }

    #[tokio::test]
    async fn browser_runtime_uses_single_exec() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "stdout": "", "stderr": "", "exit_code": 0
            })))
            .mount(&server)
            .await;

        let rt = adapter(&server, RuntimeType::BrowserRuntime);
        let out = rt
            .invoke(&call(
                Capability::Browser,
                "exec",
                json!({"cmd": "screenshot /workspace/p.png"}),
            ))
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 0);
    }

    #[tokio::test]
    async fn mismatched_capability_is_protocol_error() {
        let server = MockServer::start().await;
        let rt = adapter(&server, RuntimeType::BrowserRuntime);
        let err = rt
            .invoke(&call(Capability::Python, "exec", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(_)));
    }

    #[tokio::test]
    async fn recognized_4xx_body_maps_to_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/filesystem/read"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": "invalid_path", "message": "path escapes workspace"
            })))
            .mount(&server)
            .await;

        let rt = adapter(&server, RuntimeType::CodeRuntime);
        let err = rt
            .invoke(&call(Capability::Filesystem, "read", json!({"path": "../x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn five_hundred_maps_to_runtime_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/python/exec"))
            .respond_with(ResponseTemplate::new(500).set_body_string("kernel died"))
            .mount(&server)
            .await;

        let rt = adapter(&server, RuntimeType::CodeRuntime);
        let err = rt
            .invoke(&call(Capability::Python, "exec", json!({"code": "x"})))
            .await
            .unwrap_err();
        match err {
            RuntimeError::Runtime { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "kernel died");
            }
            other => panic!("expected Runtime, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_runtime_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/python/exec"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"output": "late"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let rt = adapter(&server, RuntimeType::CodeRuntime);
        let mut c = call(Capability::Python, "exec", json!({"code": "x"}));
        c.timeout = Duration::from_millis(50);
        let err = rt.invoke(&c).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        // Nothing listens on this port.
        let rt = HttpRuntime::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            RuntimeType::CodeRuntime,
        );
        let err = rt.health().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transient(_)));
    }
}
