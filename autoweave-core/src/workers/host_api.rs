//! The host API surface a sandboxed plugin can reach.
//!
//! Calls cross the sandbox boundary as a typed request sum serialized to
//! JSON; the host checks each against the plugin's capability grant before
//! servicing. Binary payloads travel base64-encoded so guests can build
//! requests as plain JSON text.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::perf::metrics::{Counter, MetricsRegistry, counters};
use crate::workers::sandbox::CapabilityChecker;

/// Per-plugin state slot, owned by the manager so state survives hot
/// reload. Cleared on crash; only a clean `onUnload` keeps it populated.
pub type StateStore = Arc<Mutex<Option<Vec<u8>>>>;

/// Upper bound on bytes returned from `fetch`.
const MAX_FETCH_BODY: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostCall {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        data_b64: String,
    },
    Fetch {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
    Metric {
        name: String,
        value: f64,
    },
    GetState,
    SetState {
        data_b64: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostReply {
    Ok,
    File {
        data_b64: String,
    },
    Fetched {
        code: u16,
        body_b64: String,
    },
    State {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_b64: Option<String>,
    },
    Denied {
        reason: String,
    },
    Error {
        message: String,
    },
}

/// Services capability-checked host calls for one worker.
pub struct HostService {
    caps: Arc<CapabilityChecker>,
    http: reqwest::Client,
    metrics: Arc<MetricsRegistry>,
    denials: Counter,
    state: StateStore,
}

impl std::fmt::Debug for HostService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostService")
            .field("plugin", &self.caps.plugin_name())
            .finish()
    }
}

impl HostService {
    pub fn new(
        caps: Arc<CapabilityChecker>,
        metrics: Arc<MetricsRegistry>,
        state: StateStore,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let denials = metrics.counter(counters::PERMISSION_DENIALS);
        Self {
            caps,
            http,
            metrics,
            denials,
            state,
        }
    }

    pub fn state(&self) -> StateStore {
        Arc::clone(&self.state)
    }

    pub async fn call(&self, call: HostCall) -> HostReply {
        match call {
            HostCall::ReadFile { path } => self.read_file(&path).await,
            HostCall::WriteFile { path, data_b64 } => {
                self.write_file(&path, &data_b64).await
            }
            HostCall::Fetch { url, method } => {
                self.fetch(&url, method.as_deref()).await
            }
            HostCall::Metric { name, value } => {
                // Always allowed.
                self.metrics
                    .gauge(&format!(
                        "plugin.{}.{}",
                        self.caps.plugin_name(),
                        name
                    ))
                    .set(value as i64);
                HostReply::Ok
            }
            HostCall::GetState => HostReply::State {
                data_b64: self
                    .state
                    .lock()
                    .as_ref()
                    .map(|bytes| BASE64.encode(bytes)),
            },
            HostCall::SetState { data_b64 } => match BASE64.decode(&data_b64)
            {
                Ok(bytes) => {
                    *self.state.lock() = Some(bytes);
                    HostReply::Ok
                }
                Err(err) => HostReply::Error {
                    message: format!("state is not valid base64: {err}"),
                },
            },
        }
    }

    fn deny(&self, reason: String) -> HostReply {
        self.denials.incr();
        debug!(
            plugin = self.caps.plugin_name(),
            reason, "host call denied"
        );
        HostReply::Denied { reason }
    }

    /// Canonicalizes the real path and re-checks containment, so symlinks
    /// cannot smuggle access outside a granted root.
    async fn resolve_checked(
        &self,
        raw: &str,
        write: bool,
    ) -> Result<PathBuf, HostReply> {
        let lexical = self
            .caps
            .check_path(Path::new(raw), write)
            .map_err(|denied| self.deny(denied.0))?;

        let canonical = if write {
            // The file may not exist yet; canonicalize its parent.
            let parent = lexical.parent().ok_or_else(|| HostReply::Error {
                message: "path has no parent".to_string(),
            })?;
            let file_name =
                lexical.file_name().ok_or_else(|| HostReply::Error {
                    message: "path has no file name".to_string(),
                })?;
            match tokio::fs::canonicalize(parent).await {
                Ok(dir) => dir.join(file_name),
                Err(err) => {
                    return Err(HostReply::Error {
                        message: format!("parent directory: {err}"),
                    });
                }
            }
        } else {
            match tokio::fs::canonicalize(&lexical).await {
                Ok(path) => path,
                Err(err) => {
                    return Err(HostReply::Error {
                        message: format!("{err}"),
                    });
                }
            }
        };

        self.caps
            .check_path(&canonical, write)
            .map_err(|denied| self.deny(denied.0))?;
        Ok(canonical)
    }

    async fn read_file(&self, raw: &str) -> HostReply {
        let path = match self.resolve_checked(raw, false).await {
            Ok(path) => path,
            Err(reply) => return reply,
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => HostReply::File {
                data_b64: BASE64.encode(bytes),
            },
            Err(err) => HostReply::Error {
                message: format!("read failed: {err}"),
            },
        }
    }

    async fn write_file(&self, raw: &str, data_b64: &str) -> HostReply {
        let bytes = match BASE64.decode(data_b64) {
            Ok(bytes) => bytes,
            Err(err) => {
                return HostReply::Error {
                    message: format!("payload is not valid base64: {err}"),
                };
            }
        };
        let path = match self.resolve_checked(raw, true).await {
            Ok(path) => path,
            Err(reply) => return reply,
        };
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => HostReply::Ok,
            Err(err) => HostReply::Error {
                message: format!("write failed: {err}"),
            },
        }
    }

    async fn fetch(&self, raw_url: &str, method: Option<&str>) -> HostReply {
        let url = match self.caps.check_fetch(raw_url) {
            Ok(url) => url,
            Err(denied) => return self.deny(denied.0),
        };
        let request = match method.unwrap_or("GET") {
            "GET" => self.http.get(url),
            "HEAD" => self.http.head(url),
            other => {
                return HostReply::Error {
                    message: format!("method `{other}` is not supported"),
                };
            }
        };
        match request.send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                match response.bytes().await {
                    Ok(body) => {
                        let truncated =
                            &body[..body.len().min(MAX_FETCH_BODY)];
                        HostReply::Fetched {
                            code,
                            body_b64: BASE64.encode(truncated),
                        }
                    }
                    Err(err) => HostReply::Error {
                        message: format!("body read failed: {err}"),
                    },
                }
            }
            Err(err) => {
                warn!(
                    plugin = self.caps.plugin_name(),
                    error = %err,
                    "fetch failed"
                );
                HostReply::Error {
                    message: format!("fetch failed: {err}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoweave_model::PluginManifest;
    use tempfile::tempdir;

    fn service_for(
        manifest_json: &str,
    ) -> (HostService, Arc<MetricsRegistry>) {
        let manifest: PluginManifest =
            serde_json::from_str(manifest_json).unwrap();
        let caps =
            Arc::new(CapabilityChecker::from_manifest(&manifest).unwrap());
        let metrics = MetricsRegistry::new();
        let service = HostService::new(
            caps,
            Arc::clone(&metrics),
            Arc::new(Mutex::new(None)),
        );
        (service, metrics)
    }

    fn fs_manifest(root: &Path, mode: &str) -> String {
        format!(
            r#"{{"name":"ex","version":"1.0.0","entry":"a.wasm",
                "permissions":{{"filesystem":[{{"path":"{}","mode":"{mode}"}}]}}}}"#,
            root.display()
        )
    }

    #[tokio::test]
    async fn write_denied_under_read_only_grant_creates_nothing() {
        let tmp = tempdir().unwrap();
        let (service, metrics) =
            service_for(&fs_manifest(tmp.path(), "read"));

        let target = tmp.path().join("x");
        let reply = service
            .call(HostCall::WriteFile {
                path: target.to_string_lossy().to_string(),
                data_b64: BASE64.encode(b"data"),
            })
            .await;
        assert!(matches!(reply, HostReply::Denied { .. }));
        assert!(!target.exists(), "denied write must not create the file");
        assert_eq!(
            metrics.counter(counters::PERMISSION_DENIALS).get(),
            1
        );
    }

    #[tokio::test]
    async fn read_write_round_trip_under_grant() {
        let tmp = tempdir().unwrap();
        let (service, _) =
            service_for(&fs_manifest(tmp.path(), "readwrite"));

        let target = tmp.path().join("note.txt");
        let reply = service
            .call(HostCall::WriteFile {
                path: target.to_string_lossy().to_string(),
                data_b64: BASE64.encode(b"hello"),
            })
            .await;
        assert_eq!(reply, HostReply::Ok);

        let reply = service
            .call(HostCall::ReadFile {
                path: target.to_string_lossy().to_string(),
            })
            .await;
        match reply {
            HostReply::File { data_b64 } => {
                assert_eq!(BASE64.decode(data_b64).unwrap(), b"hello");
            }
            other => panic!("expected File, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn symlink_escape_is_caught_after_canonicalization() {
        let tmp = tempdir().unwrap();
        let inside = tmp.path().join("inside");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&inside).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret"), b"s").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(&outside, inside.join("link")).unwrap();

        let (service, _) = service_for(&fs_manifest(&inside, "readwrite"));
        #[cfg(unix)]
        {
            let reply = service
                .call(HostCall::ReadFile {
                    path: inside
                        .join("link/secret")
                        .to_string_lossy()
                        .to_string(),
                })
                .await;
            assert!(
                matches!(reply, HostReply::Denied { .. }),
                "symlinked escape must be denied, got {reply:?}"
            );
        }
    }

    #[tokio::test]
    async fn fetch_outside_grant_is_denied_without_network_io() {
        let (service, metrics) = service_for(
            r#"{"name":"ex","version":"1.0.0","entry":"a.wasm"}"#,
        );
        let reply = service
            .call(HostCall::Fetch {
                url: "https://example.com/".to_string(),
                method: None,
            })
            .await;
        assert!(matches!(reply, HostReply::Denied { .. }));
        assert_eq!(
            metrics.counter(counters::PERMISSION_DENIALS).get(),
            1
        );
    }

    #[tokio::test]
    async fn metric_is_always_allowed() {
        let (service, metrics) = service_for(
            r#"{"name":"ex","version":"1.0.0","entry":"a.wasm"}"#,
        );
        let reply = service
            .call(HostCall::Metric {
                name: "readings".to_string(),
                value: 42.0,
            })
            .await;
        assert_eq!(reply, HostReply::Ok);
        assert_eq!(
            metrics.snapshot().get("plugin.ex.readings"),
            Some(&42)
        );
    }

    #[tokio::test]
    async fn state_round_trips_through_the_store() {
        let (service, _) = service_for(
            r#"{"name":"ex","version":"1.0.0","entry":"a.wasm"}"#,
        );
        assert_eq!(
            service.call(HostCall::GetState).await,
            HostReply::State { data_b64: None }
        );
        let payload = BASE64.encode(br#"{"counter":1}"#);
        assert_eq!(
            service
                .call(HostCall::SetState {
                    data_b64: payload.clone()
                })
                .await,
            HostReply::Ok
        );
        assert_eq!(
            service.call(HostCall::GetState).await,
            HostReply::State {
                data_b64: Some(payload)
            }
        );
    }

    #[test]
    fn host_call_wire_format_is_stable() {
        let call: HostCall = serde_json::from_str(
            r#"{"op":"read_file","path":"/var/ex/x"}"#,
        )
        .unwrap();
        assert_eq!(
            call,
            HostCall::ReadFile {
                path: "/var/ex/x".to_string()
            }
        );
        let json = serde_json::to_string(&HostReply::Denied {
            reason: "nope".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"status\":\"denied\""));
    }
}
