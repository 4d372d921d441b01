//! Lazy per-topic execution sandbox provisioning.
//!
//! One sandbox backs one chat topic. Creation is lazy (first tool call
//! that needs one triggers it) and cross-pod exclusive: whichever pod's
//! turn gets to a topic first acquires a distributed lock via the event
//! bus, creates the sandbox, and publishes the binding; any other pod
//! racing to the same topic polls until the binding appears instead of
//! creating a second sandbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pz_eventbus::EventBus;
use sa_domain::config::SandboxConfig;
use sa_domain::error::{Error, Result};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A running sandbox's identity and connection info.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub backend: &'static str,
}

/// Result of one command executed inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One entry returned by `list_files`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// One hit returned by `search_in_files`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: u32,
    pub text: String,
}

/// Point-in-time status of a provisioned sandbox (§4.5 `get_status`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SandboxStatus {
    pub sandbox_id: String,
    pub state: String,
}

/// Static/descriptive info about a provisioned sandbox (§4.5 `get_info`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub backend: String,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Backend-specific sandbox provisioning, abstracted so the manager
/// doesn't care whether sandboxes are hosted cloud VMs or a connected
/// runner's local environment.
///
/// Mirrors the full operation surface of spec.md §4.5. Most backends
/// only need a handful of these (a runner-backed sandbox has no
/// meaningful preview URL, for instance); operations a given backend
/// doesn't support keep the default `Unsupported` body rather than
/// forcing every impl to repeat a boilerplate stub.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn create(&self, topic_id: Uuid) -> Result<SandboxHandle>;
    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecResult>;
    async fn destroy(&self, sandbox_id: &str) -> Result<()>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        let _ = (sandbox_id, path);
        Err(Error::Unsupported(format!("{}: read_file", self.name())))
    }
    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        let _ = (sandbox_id, path, content);
        Err(Error::Unsupported(format!("{}: write_file", self.name())))
    }
    async fn read_file_bytes(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        let _ = (sandbox_id, path);
        Err(Error::Unsupported(format!("{}: read_file_bytes", self.name())))
    }
    async fn write_file_bytes(&self, sandbox_id: &str, path: &str, content: &[u8]) -> Result<()> {
        let _ = (sandbox_id, path, content);
        Err(Error::Unsupported(format!("{}: write_file_bytes", self.name())))
    }
    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let _ = (sandbox_id, path);
        Err(Error::Unsupported(format!("{}: list_files", self.name())))
    }
    async fn find_files(&self, sandbox_id: &str, pattern: &str) -> Result<Vec<String>> {
        let _ = (sandbox_id, pattern);
        Err(Error::Unsupported(format!("{}: find_files", self.name())))
    }
    async fn search_in_files(
        &self,
        sandbox_id: &str,
        query: &str,
        path: Option<&str>,
    ) -> Result<Vec<SearchMatch>> {
        let _ = (sandbox_id, query, path);
        Err(Error::Unsupported(format!("{}: search_in_files", self.name())))
    }
    async fn get_preview_url(&self, sandbox_id: &str, port: u16) -> Result<String> {
        let _ = (sandbox_id, port);
        Err(Error::Unsupported(format!("{}: get_preview_url", self.name())))
    }
    async fn get_status(&self, sandbox_id: &str) -> Result<SandboxStatus> {
        let _ = sandbox_id;
        Err(Error::Unsupported(format!("{}: get_status", self.name())))
    }
    async fn keep_alive(&self, sandbox_id: &str) -> Result<()> {
        let _ = sandbox_id;
        Err(Error::Unsupported(format!("{}: keep_alive", self.name())))
    }
    async fn start(&self, sandbox_id: &str) -> Result<()> {
        let _ = sandbox_id;
        Err(Error::Unsupported(format!("{}: start", self.name())))
    }
    async fn get_info(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let _ = sandbox_id;
        Err(Error::Unsupported(format!("{}: get_info", self.name())))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cloud backend — hosted sandbox provider over HTTP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CloudSandboxBackend {
    http: reqwest::Client,
    base_url: String,
}

impl CloudSandboxBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SandboxBackend for CloudSandboxBackend {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn create(&self, topic_id: Uuid) -> Result<SandboxHandle> {
        #[derive(serde::Deserialize)]
        struct CreateResponse {
            sandbox_id: String,
        }
        let resp = self
            .http
            .post(format!("{}/v1/sandboxes", self.base_url))
            .json(&serde_json::json!({ "topic_id": topic_id }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox create: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox create: {e}")))?
            .json::<CreateResponse>()
            .await
            .map_err(|e| Error::Http(format!("sandbox create decode: {e}")))?;
        Ok(SandboxHandle {
            sandbox_id: resp.sandbox_id,
            backend: "cloud",
        })
    }

    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecResult> {
        #[derive(serde::Deserialize)]
        struct ExecResponse {
            exit_code: i32,
            stdout: String,
            stderr: String,
        }
        let resp = self
            .http
            .post(format!(
                "{}/v1/sandboxes/{sandbox_id}/exec",
                self.base_url
            ))
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox exec: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox exec: {e}")))?
            .json::<ExecResponse>()
            .await
            .map_err(|e| Error::Http(format!("sandbox exec decode: {e}")))?;
        Ok(ExecResult {
            exit_code: resp.exit_code,
            stdout: resp.stdout,
            stderr: resp.stderr,
        })
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        self.http
            .delete(format!("{}/v1/sandboxes/{sandbox_id}", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox destroy: {e}")))?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct Resp {
            content: String,
        }
        let resp: Resp = self
            .http
            .get(format!("{}/v1/sandboxes/{sandbox_id}/files", self.base_url))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox read_file: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox read_file: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Http(format!("sandbox read_file decode: {e}")))?;
        Ok(resp.content)
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        self.http
            .put(format!("{}/v1/sandboxes/{sandbox_id}/files", self.base_url))
            .json(&serde_json::json!({ "path": path, "content": content }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox write_file: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox write_file: {e}")))?;
        Ok(())
    }

    async fn read_file_bytes(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        #[derive(serde::Deserialize)]
        struct Resp {
            content_base64: String,
        }
        let resp: Resp = self
            .http
            .get(format!(
                "{}/v1/sandboxes/{sandbox_id}/files/bytes",
                self.base_url
            ))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox read_file_bytes: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox read_file_bytes: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Http(format!("sandbox read_file_bytes decode: {e}")))?;
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, resp.content_base64)
            .map_err(|e| Error::Http(format!("sandbox read_file_bytes base64: {e}")))
    }

    async fn write_file_bytes(&self, sandbox_id: &str, path: &str, content: &[u8]) -> Result<()> {
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, content);
        self.http
            .put(format!(
                "{}/v1/sandboxes/{sandbox_id}/files/bytes",
                self.base_url
            ))
            .json(&serde_json::json!({ "path": path, "content_base64": encoded }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox write_file_bytes: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox write_file_bytes: {e}")))?;
        Ok(())
    }

    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let entries = self
            .http
            .get(format!("{}/v1/sandboxes/{sandbox_id}/list", self.base_url))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox list_files: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox list_files: {e}")))?
            .json::<Vec<FileEntry>>()
            .await
            .map_err(|e| Error::Http(format!("sandbox list_files decode: {e}")))?;
        Ok(entries)
    }

    async fn find_files(&self, sandbox_id: &str, pattern: &str) -> Result<Vec<String>> {
        let paths = self
            .http
            .get(format!("{}/v1/sandboxes/{sandbox_id}/find", self.base_url))
            .query(&[("pattern", pattern)])
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox find_files: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox find_files: {e}")))?
            .json::<Vec<String>>()
            .await
            .map_err(|e| Error::Http(format!("sandbox find_files decode: {e}")))?;
        Ok(paths)
    }

    async fn search_in_files(
        &self,
        sandbox_id: &str,
        query: &str,
        path: Option<&str>,
    ) -> Result<Vec<SearchMatch>> {
        let mut params = vec![("query", query.to_string())];
        if let Some(p) = path {
            params.push(("path", p.to_string()));
        }
        let hits = self
            .http
            .get(format!("{}/v1/sandboxes/{sandbox_id}/grep", self.base_url))
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox search_in_files: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox search_in_files: {e}")))?
            .json::<Vec<SearchMatch>>()
            .await
            .map_err(|e| Error::Http(format!("sandbox search_in_files decode: {e}")))?;
        Ok(hits)
    }

    async fn get_preview_url(&self, sandbox_id: &str, port: u16) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct Resp {
            url: String,
        }
        let resp: Resp = self
            .http
            .get(format!(
                "{}/v1/sandboxes/{sandbox_id}/preview",
                self.base_url
            ))
            .query(&[("port", port.to_string())])
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox get_preview_url: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox get_preview_url: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Http(format!("sandbox get_preview_url decode: {e}")))?;
        Ok(resp.url)
    }

    async fn get_status(&self, sandbox_id: &str) -> Result<SandboxStatus> {
        self.http
            .get(format!("{}/v1/sandboxes/{sandbox_id}", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox get_status: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox get_status: {e}")))?
            .json::<SandboxStatus>()
            .await
            .map_err(|e| Error::Http(format!("sandbox get_status decode: {e}")))
    }

    async fn keep_alive(&self, sandbox_id: &str) -> Result<()> {
        self.http
            .post(format!(
                "{}/v1/sandboxes/{sandbox_id}/keep_alive",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox keep_alive: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox keep_alive: {e}")))?;
        Ok(())
    }

    async fn start(&self, sandbox_id: &str) -> Result<()> {
        self.http
            .post(format!("{}/v1/sandboxes/{sandbox_id}/start", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox start: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox start: {e}")))?;
        Ok(())
    }

    async fn get_info(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        self.http
            .get(format!("{}/v1/sandboxes/{sandbox_id}/info", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Http(format!("sandbox get_info: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("sandbox get_info: {e}")))?
            .json::<SandboxInfo>()
            .await
            .map_err(|e| Error::Http(format!("sandbox get_info decode: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner backend — dispatched over a connected runner's RPC channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the gateway's runner registry exposes to this crate. Kept as a
/// trait (rather than a direct dependency on `crates/gateway`) so
/// `pz-sandbox` stays a leaf crate with no dependency on the binary
/// that wires it up.
#[async_trait]
pub trait RunnerDispatch: Send + Sync {
    async fn sandbox_create(&self, topic_id: Uuid) -> Result<String>;
    async fn sandbox_exec(&self, sandbox_id: &str, command: &str) -> Result<ExecResult>;
    async fn sandbox_read_file(&self, sandbox_id: &str, path: &str) -> Result<String>;
    async fn sandbox_write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()>;
    async fn sandbox_list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>>;
    async fn sandbox_find_files(&self, sandbox_id: &str, pattern: &str) -> Result<Vec<String>>;
    async fn sandbox_search_in_files(
        &self,
        sandbox_id: &str,
        query: &str,
        path: Option<&str>,
    ) -> Result<Vec<SearchMatch>>;
}

pub struct RunnerSandboxBackend<D: RunnerDispatch> {
    dispatch: Arc<D>,
}

impl<D: RunnerDispatch> RunnerSandboxBackend<D> {
    pub fn new(dispatch: Arc<D>) -> Self {
        Self { dispatch }
    }
}

#[async_trait]
impl<D: RunnerDispatch> SandboxBackend for RunnerSandboxBackend<D> {
    fn name(&self) -> &'static str {
        "runner"
    }

    async fn create(&self, topic_id: Uuid) -> Result<SandboxHandle> {
        let sandbox_id = self.dispatch.sandbox_create(topic_id).await?;
        Ok(SandboxHandle {
            sandbox_id,
            backend: "runner",
        })
    }

    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecResult> {
        self.dispatch.sandbox_exec(sandbox_id, command).await
    }

    async fn destroy(&self, _sandbox_id: &str) -> Result<()> {
        // Runner-backed sandboxes are torn down by the runner itself on
        // disconnect; nothing to do from the gateway side.
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        self.dispatch.sandbox_read_file(sandbox_id, path).await
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        self.dispatch
            .sandbox_write_file(sandbox_id, path, content)
            .await
    }

    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        self.dispatch.sandbox_list_files(sandbox_id, path).await
    }

    async fn find_files(&self, sandbox_id: &str, pattern: &str) -> Result<Vec<String>> {
        self.dispatch.sandbox_find_files(sandbox_id, pattern).await
    }

    async fn search_in_files(
        &self,
        sandbox_id: &str,
        query: &str,
        path: Option<&str>,
    ) -> Result<Vec<SearchMatch>> {
        self.dispatch
            .sandbox_search_in_files(sandbox_id, query, path)
            .await
    }

    // `read_file_bytes`/`write_file_bytes`/`get_preview_url`/`get_status`/
    // `keep_alive`/`start`/`get_info` have no corresponding runner RPC
    // kind (a connected runner is a live local process, not a
    // provisioned remote VM with its own lifecycle/preview surface) —
    // fall through to the trait's `Unsupported` default.
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SandboxManager — lazy creation, cross-pod locked
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SandboxManager {
    backend: Arc<dyn SandboxBackend>,
    bus: EventBus,
    config: SandboxConfig,
    /// Local cache of bindings this pod has already resolved, avoiding a
    /// round trip to the event bus on every tool call.
    local: RwLock<HashMap<Uuid, String>>,
}

impl SandboxManager {
    pub fn new(backend: Arc<dyn SandboxBackend>, bus: EventBus, config: SandboxConfig) -> Self {
        Self {
            backend,
            bus,
            config,
            local: RwLock::new(HashMap::new()),
        }
    }

    /// Return the sandbox_id bound to `topic_id`, creating one if none
    /// exists yet. Safe to call concurrently from multiple pods: only
    /// one caller wins the creation lock, the rest poll for the binding.
    pub async fn ensure_sandbox(&self, topic_id: Uuid) -> Result<String> {
        if let Some(id) = self.local.read().await.get(&topic_id).cloned() {
            return Ok(id);
        }

        let topic_key = topic_id.to_string();
        if let Some(id) = self.bus.get_sandbox_binding(&topic_key).await? {
            self.local.write().await.insert(topic_id, id.clone());
            return Ok(id);
        }

        let token = Uuid::new_v4().to_string();
        let acquired = self
            .bus
            .acquire_sandbox_lock(&topic_key, &token, self.config.lock_ttl_ms)
            .await?;

        if acquired {
            let result = self.create_and_bind(topic_id, &topic_key).await;
            // Always release, success or failure, so a crashed creation
            // doesn't block the topic for the full lock TTL.
            let _ = self.bus.release_sandbox_lock(&topic_key, &token).await;
            let id = result?;
            self.local.write().await.insert(topic_id, id.clone());
            return Ok(id);
        }

        self.wait_for_binding(topic_id, &topic_key).await
    }

    async fn create_and_bind(&self, topic_id: Uuid, topic_key: &str) -> Result<String> {
        let handle = self.backend.create(topic_id).await?;
        self.bus
            .set_sandbox_binding(topic_key, &handle.sandbox_id, self.config.idle_ttl_seconds)
            .await?;
        self.bus
            .publish(
                "sandbox-ready",
                serde_json::to_vec(&serde_json::json!({
                    "topic_id": topic_id,
                    "sandbox_id": handle.sandbox_id,
                }))
                .unwrap_or_default(),
            )
            .await?;
        Ok(handle.sandbox_id)
    }

    async fn wait_for_binding(&self, topic_id: Uuid, topic_key: &str) -> Result<String> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.create_timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(50));
        loop {
            if let Some(id) = self.bus.get_sandbox_binding(topic_key).await? {
                self.local.write().await.insert(topic_id, id.clone());
                return Ok(id);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::SandboxCreateTimeout(self.config.create_timeout_ms));
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn exec(&self, topic_id: Uuid, command: &str) -> Result<ExecResult> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.exec(&sandbox_id, command).await
    }

    pub async fn read_file(&self, topic_id: Uuid, path: &str) -> Result<String> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.read_file(&sandbox_id, path).await
    }

    pub async fn write_file(&self, topic_id: Uuid, path: &str, content: &str) -> Result<()> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.write_file(&sandbox_id, path, content).await
    }

    pub async fn read_file_bytes(&self, topic_id: Uuid, path: &str) -> Result<Vec<u8>> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.read_file_bytes(&sandbox_id, path).await
    }

    pub async fn write_file_bytes(&self, topic_id: Uuid, path: &str, content: &[u8]) -> Result<()> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.write_file_bytes(&sandbox_id, path, content).await
    }

    pub async fn list_files(&self, topic_id: Uuid, path: &str) -> Result<Vec<FileEntry>> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.list_files(&sandbox_id, path).await
    }

    pub async fn find_files(&self, topic_id: Uuid, pattern: &str) -> Result<Vec<String>> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.find_files(&sandbox_id, pattern).await
    }

    pub async fn search_in_files(
        &self,
        topic_id: Uuid,
        query: &str,
        path: Option<&str>,
    ) -> Result<Vec<SearchMatch>> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.search_in_files(&sandbox_id, query, path).await
    }

    pub async fn get_preview_url(&self, topic_id: Uuid, port: u16) -> Result<String> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.get_preview_url(&sandbox_id, port).await
    }

    pub async fn get_status(&self, topic_id: Uuid) -> Result<SandboxStatus> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.get_status(&sandbox_id).await
    }

    pub async fn keep_alive(&self, topic_id: Uuid) -> Result<()> {
        let sandbox_id = self.ensure_sandbox(topic_id).await?;
        self.backend.keep_alive(&sandbox_id).await
    }

    pub async fn cleanup(&self, topic_id: Uuid) -> Result<()> {
        if let Some(id) = self.local.write().await.remove(&topic_id) {
            self.backend.destroy(&id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SandboxBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn create(&self, _topic_id: Uuid) -> Result<SandboxHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SandboxHandle {
                sandbox_id: "sbx-1".into(),
                backend: "counting",
            })
        }
        async fn exec(&self, _sandbox_id: &str, _command: &str) -> Result<ExecResult> {
            Ok(ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
        async fn destroy(&self, _sandbox_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sandbox_handle_carries_backend_name() {
        let handle = SandboxHandle {
            sandbox_id: "abc".into(),
            backend: "cloud",
        };
        assert_eq!(handle.backend, "cloud");
        assert_eq!(handle.sandbox_id, "abc");
    }
}
