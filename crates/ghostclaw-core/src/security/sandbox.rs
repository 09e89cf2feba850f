use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::security::tool_policy::{ToolPolicy, ToolPolicyPipeline, ToolPolicyRequest, ToolProfile};

fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// 32-bit FNV-1a over the scope key. `std::hash<std::string>` in the
/// reference is process-randomized in some standard library
/// implementations but deterministic in others; this port needs a hash
/// that's stable across processes and platforms for container-name
/// reproducibility, so it uses FNV-1a rather than `DefaultHasher`
/// (randomized per-process in Rust) or the reference's hasher.
fn short_hash_hex(value: &str) -> String {
    const FNV_OFFSET: u32 = 2166136261;
    const FNV_PRIME: u32 = 16777619;
    let mut hash = FNV_OFFSET;
    for byte in value.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:08x}")
}

fn slugify(input: &str) -> String {
    let normalized = normalize_key(input);
    if normalized.is_empty() {
        return "session".to_string();
    }

    let mut out = String::with_capacity(normalized.len());
    for ch in normalized.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('-');
        }
    }

    let trimmed = out.trim_matches('-');
    let mut result = if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed.to_string()
    };
    result.truncate(36);
    if result.is_empty() {
        result = "session".to_string();
    }
    result
}

fn workspace_mount_arg(host: &Path, container: &str, access: WorkspaceAccess) -> String {
    let mut mount = format!("{}:{container}", host.to_string_lossy());
    if access == WorkspaceAccess::ReadOnly {
        mount.push_str(":ro");
    }
    mount
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    Off,
    NonMain,
    All,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::NonMain => "non-main",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxScope {
    Session,
    Agent,
    Shared,
}

impl SandboxScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Agent => "agent",
            Self::Shared => "shared",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceAccess {
    None,
    ReadOnly,
    ReadWrite,
}

impl WorkspaceAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    pub scope: SandboxScope,
    pub workspace_access: WorkspaceAccess,
    pub image: String,
    pub container_prefix: String,
    pub workdir: String,
    pub read_only_root: bool,
    pub tmpfs: Vec<String>,
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub dns: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub binds: Vec<String>,
    pub tool_allow: Vec<String>,
    pub tool_deny: Vec<String>,
    pub env: Vec<(String, String)>,
    pub pids_limit: Option<u32>,
    pub memory_limit: Option<String>,
    pub memory_swap_limit: Option<String>,
    pub cpu_limit: Option<f64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Off,
            scope: SandboxScope::Session,
            workspace_access: WorkspaceAccess::ReadOnly,
            image: "ghostclaw-sandbox:bookworm-slim".to_string(),
            container_prefix: "ghostclaw-sbx-".to_string(),
            workdir: "/workspace".to_string(),
            read_only_root: true,
            tmpfs: vec!["/tmp".to_string(), "/var/tmp".to_string(), "/run".to_string()],
            network_mode: "none".to_string(),
            cap_drop: vec!["ALL".to_string()],
            dns: Vec::new(),
            extra_hosts: Vec::new(),
            binds: Vec::new(),
            tool_allow: vec![
                "group:fs".to_string(),
                "group:runtime".to_string(),
                "group:sessions".to_string(),
                "group:web".to_string(),
            ],
            tool_deny: vec![
                "group:ui".to_string(),
                "group:automation".to_string(),
                "group:messaging".to_string(),
            ],
            env: vec![("LANG".to_string(), "C.UTF-8".to_string())],
            pids_limit: None,
            memory_limit: None,
            memory_swap_limit: None,
            cpu_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub session_id: String,
    pub agent_id: String,
    pub main_session_id: String,
    pub workspace_dir: PathBuf,
    pub agent_workspace_dir: PathBuf,
}

impl Default for SandboxRequest {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            agent_id: String::new(),
            main_session_id: "main".to_string(),
            workspace_dir: PathBuf::new(),
            agent_workspace_dir: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxRuntime {
    pub enabled: bool,
    pub scope_key: String,
    pub container_name: String,
    pub mounted_workspace_dir: PathBuf,
    pub container_workdir: String,
}

pub fn resolve_sandbox_scope_key(config: &SandboxConfig, request: &SandboxRequest) -> String {
    let session_id = normalize_key(&request.session_id);
    let agent_id = normalize_key(&request.agent_id);

    match config.scope {
        SandboxScope::Shared => "shared".to_string(),
        SandboxScope::Agent => {
            format!("agent:{}", if agent_id.is_empty() { "main" } else { &agent_id })
        }
        SandboxScope::Session => {
            if session_id.is_empty() {
                "session:main".to_string()
            } else {
                session_id
            }
        }
    }
}

pub fn resolve_sandbox_container_name(config: &SandboxConfig, request: &SandboxRequest) -> String {
    let scope_key = resolve_sandbox_scope_key(config, request);
    let slug = slugify(&scope_key);
    let mut name = format!("{}{}-{}", config.container_prefix, slug, short_hash_hex(&scope_key));
    name.truncate(63);
    name
}

/// Exact `docker create` argv for a runtime, flag by flag, in the order
/// the reference emits them.
pub fn build_docker_create_args(
    config: &SandboxConfig,
    runtime: &SandboxRuntime,
    request: &SandboxRequest,
) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        runtime.container_name.clone(),
        "--label".to_string(),
        "ghostclaw.sandbox=1".to_string(),
        "--label".to_string(),
        format!("ghostclaw.scope={}", runtime.scope_key),
    ];

    if config.read_only_root {
        args.push("--read-only".to_string());
    }
    for entry in &config.tmpfs {
        if entry.trim().is_empty() {
            continue;
        }
        args.push("--tmpfs".to_string());
        args.push(entry.clone());
    }

    if !config.network_mode.trim().is_empty() {
        args.push("--network".to_string());
        args.push(config.network_mode.clone());
    }

    for cap in &config.cap_drop {
        if cap.trim().is_empty() {
            continue;
        }
        args.push("--cap-drop".to_string());
        args.push(cap.clone());
    }
    args.push("--security-opt".to_string());
    args.push("no-new-privileges".to_string());

    for (key, value) in &config.env {
        if key.trim().is_empty() {
            continue;
        }
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }

    for entry in &config.dns {
        if entry.trim().is_empty() {
            continue;
        }
        args.push("--dns".to_string());
        args.push(entry.clone());
    }
    for entry in &config.extra_hosts {
        if entry.trim().is_empty() {
            continue;
        }
        args.push("--add-host".to_string());
        args.push(entry.clone());
    }

    if let Some(limit) = config.pids_limit {
        if limit > 0 {
            args.push("--pids-limit".to_string());
            args.push(limit.to_string());
        }
    }
    if let Some(limit) = &config.memory_limit {
        if !limit.is_empty() {
            args.push("--memory".to_string());
            args.push(limit.clone());
        }
    }
    if let Some(limit) = &config.memory_swap_limit {
        if !limit.is_empty() {
            args.push("--memory-swap".to_string());
            args.push(limit.clone());
        }
    }
    if let Some(limit) = config.cpu_limit {
        if limit > 0.0 {
            args.push("--cpus".to_string());
            args.push(format!("{limit:.2}"));
        }
    }

    for bind in &config.binds {
        if bind.trim().is_empty() {
            continue;
        }
        args.push("-v".to_string());
        args.push(bind.clone());
    }

    if config.workspace_access == WorkspaceAccess::None {
        args.push("--tmpfs".to_string());
        args.push(config.workdir.clone());
    } else {
        let mounted = if runtime.mounted_workspace_dir.as_os_str().is_empty() {
            &request.workspace_dir
        } else {
            &runtime.mounted_workspace_dir
        };
        args.push("-v".to_string());
        args.push(workspace_mount_arg(mounted, &config.workdir, config.workspace_access));

        if !request.agent_workspace_dir.as_os_str().is_empty()
            && &request.agent_workspace_dir != mounted
        {
            args.push("-v".to_string());
            args.push(workspace_mount_arg(
                &request.agent_workspace_dir,
                "/agent",
                config.workspace_access,
            ));
        }
    }

    args.push("--workdir".to_string());
    args.push(config.workdir.clone());
    args.push(config.image.clone());
    args.push("sleep".to_string());
    args.push("infinity".to_string());
    args
}

#[derive(Debug, Clone)]
pub struct DockerCommandOptions {
    pub allow_failure: bool,
    pub timeout: Duration,
}

impl Default for DockerCommandOptions {
    fn default() -> Self {
        Self {
            allow_failure: false,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DockerProcessResult {
    pub exit_code: i32,
    pub stdout_text: String,
    pub stderr_text: String,
}

/// Abstracts `docker` CLI invocation so the manager can be exercised
/// without a real container runtime.
pub trait DockerRunner: Send + Sync {
    fn run(&self, args: &[String], options: &DockerCommandOptions) -> Result<DockerProcessResult>;
}

/// Shells out to the `docker` binary on PATH.
pub struct DockerCliRunner;

fn join_args(args: &[String]) -> String {
    args.join(" ")
}

impl DockerRunner for DockerCliRunner {
    fn run(&self, args: &[String], options: &DockerCommandOptions) -> Result<DockerProcessResult> {
        use std::io::Read;
        use std::process::{Command, Stdio};

        let mut child = Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SandboxRuntimeUnavailable(format!("failed to spawn docker: {e}")))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });

        let started = std::time::Instant::now();
        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if started.elapsed() > options.timeout {
                        timed_out = true;
                        let _ = child.kill();
                        let _ = child.wait();
                        break None;
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    return Err(Error::SandboxRuntimeUnavailable(format!(
                        "failed to wait on docker: {e}"
                    )));
                }
            }
        };

        let stdout_text = stdout_reader.join().unwrap_or_default();
        let stderr_text = stderr_reader.join().unwrap_or_default();

        let mut exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        if timed_out {
            exit_code = -1;
            if !options.allow_failure {
                return Err(Error::SandboxRuntimeUnavailable(format!(
                    "docker command timed out: {}",
                    join_args(args)
                )));
            }
        }

        if exit_code != 0 && !options.allow_failure {
            let message = if stderr_text.trim().is_empty() {
                format!("docker command failed: {}", join_args(args))
            } else {
                stderr_text.clone()
            };
            return Err(Error::SandboxRuntimeUnavailable(message));
        }

        Ok(DockerProcessResult {
            exit_code,
            stdout_text,
            stderr_text,
        })
    }
}

struct ContainerState {
    exists: bool,
    running: bool,
}

/// Owns sandbox lifecycle decisions: whether a request should run
/// sandboxed, what container backs it, and `docker create`/`start`/
/// `stop`/`rm` transitions. Guards container creation per scope key so
/// two concurrent `ensure_runtime` calls for the same scope never race
/// into two `create` invocations.
pub struct SandboxManager {
    config: Mutex<SandboxConfig>,
    docker_runner: Arc<dyn DockerRunner>,
    create_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, docker_runner: Arc<dyn DockerRunner>) -> Self {
        Self {
            config: Mutex::new(config),
            docker_runner,
            create_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> SandboxConfig {
        self.config.lock().expect("sandbox config mutex poisoned").clone()
    }

    pub fn set_config(&self, config: SandboxConfig) {
        *self.config.lock().expect("sandbox config mutex poisoned") = config;
    }

    pub fn should_sandbox(&self, request: &SandboxRequest) -> bool {
        let config = self.config();
        if config.mode == SandboxMode::Off {
            return false;
        }
        if config.mode == SandboxMode::All {
            return true;
        }

        let session = normalize_key(&request.session_id);
        let main_session = normalize_key(&request.main_session_id);
        if session.is_empty() {
            return false;
        }
        if main_session.is_empty() {
            return true;
        }
        session != main_session
    }

    pub fn is_tool_allowed(&self, tool_name: &str) -> bool {
        let config = self.config();
        let mut pipeline = ToolPolicyPipeline::new();
        pipeline.set_global_policy(ToolPolicy {
            allow: config.tool_allow,
            deny: config.tool_deny,
        });

        let request = ToolPolicyRequest {
            tool_name: tool_name.to_string(),
            profile: ToolProfile::Full,
            ..Default::default()
        };
        pipeline.evaluate_tool(&request).allowed
    }

    pub fn resolve_runtime(&self, request: &SandboxRequest) -> Result<SandboxRuntime> {
        let config = self.config();
        let scope_key = resolve_sandbox_scope_key(&config, request);
        let container_name = resolve_sandbox_container_name(&config, request);

        let mounted_workspace_dir = if config.workspace_access == WorkspaceAccess::ReadWrite {
            if request.agent_workspace_dir.as_os_str().is_empty() {
                request.workspace_dir.clone()
            } else {
                request.agent_workspace_dir.clone()
            }
        } else {
            let base = if request.workspace_dir.as_os_str().is_empty() {
                request.agent_workspace_dir.clone()
            } else {
                request.workspace_dir.clone()
            };
            base.join(".ghostclaw-sandbox").join(slugify(&scope_key))
        };

        Ok(SandboxRuntime {
            enabled: self.should_sandbox(request),
            scope_key,
            container_name,
            mounted_workspace_dir,
            container_workdir: config.workdir,
        })
    }

    fn scope_lock(&self, scope_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.create_locks.lock().expect("sandbox create-lock map poisoned");
        Arc::clone(locks.entry(scope_key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    pub fn ensure_runtime(&self, request: &SandboxRequest) -> Result<SandboxRuntime> {
        let runtime = self.resolve_runtime(request)?;
        if !runtime.enabled {
            return Ok(runtime);
        }

        let lock = self.scope_lock(&runtime.scope_key);
        let _guard = lock.lock().expect("sandbox scope lock poisoned");

        let config = self.config();
        if config.workspace_access != WorkspaceAccess::None {
            std::fs::create_dir_all(&runtime.mounted_workspace_dir).map_err(|e| {
                Error::SandboxRuntimeUnavailable(format!("failed to create sandbox workspace: {e}"))
            })?;
        }

        let state = self.inspect_container_state(&runtime.container_name)?;

        if !state.exists {
            let args = build_docker_create_args(&config, &runtime, request);
            self.docker_runner.run(&args, &DockerCommandOptions::default())?;
            info!(container = %runtime.container_name, "sandbox container created");
            self.docker_runner.run(
                &["start".to_string(), runtime.container_name.clone()],
                &DockerCommandOptions::default(),
            )?;
            info!(container = %runtime.container_name, "sandbox container started");
        } else if !state.running {
            self.docker_runner.run(
                &["start".to_string(), runtime.container_name.clone()],
                &DockerCommandOptions::default(),
            )?;
            info!(container = %runtime.container_name, "sandbox container restarted");
        }

        Ok(runtime)
    }

    pub fn stop_runtime(&self, request: &SandboxRequest) -> Result<()> {
        let runtime = self.resolve_runtime(request)?;
        if !runtime.enabled {
            return Ok(());
        }
        let result = self.docker_runner.run(
            &["stop".to_string(), runtime.container_name.clone()],
            &DockerCommandOptions {
                allow_failure: true,
                timeout: Duration::from_secs(30),
            },
        );
        if let Err(e) = result {
            warn!(container = %runtime.container_name, error = %e, "failed to stop sandbox container");
        }
        Ok(())
    }

    pub fn remove_runtime(&self, request: &SandboxRequest) -> Result<()> {
        let runtime = self.resolve_runtime(request)?;
        if !runtime.enabled {
            return Ok(());
        }
        let result = self.docker_runner.run(
            &["rm".to_string(), "-f".to_string(), runtime.container_name.clone()],
            &DockerCommandOptions {
                allow_failure: true,
                timeout: Duration::from_secs(30),
            },
        );
        if let Err(e) = result {
            warn!(container = %runtime.container_name, error = %e, "failed to remove sandbox container");
        }
        Ok(())
    }

    fn inspect_container_state(&self, container_name: &str) -> Result<ContainerState> {
        let inspect = self.docker_runner.run(
            &[
                "inspect".to_string(),
                "-f".to_string(),
                "{{.State.Running}}".to_string(),
                container_name.to_string(),
            ],
            &DockerCommandOptions {
                allow_failure: true,
                timeout: Duration::from_secs(10),
            },
        )?;

        if inspect.exit_code != 0 {
            return Ok(ContainerState {
                exists: false,
                running: false,
            });
        }

        let state = normalize_key(&inspect.stdout_text);
        Ok(ContainerState {
            exists: true,
            running: state.contains("true"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDocker {
        create_calls: AtomicUsize,
        inspect_exists: Mutex<bool>,
    }

    impl FakeDocker {
        fn new(inspect_exists: bool) -> Self {
            Self {
                create_calls: AtomicUsize::new(0),
                inspect_exists: Mutex::new(inspect_exists),
            }
        }
    }

    impl DockerRunner for FakeDocker {
        fn run(&self, args: &[String], _options: &DockerCommandOptions) -> Result<DockerProcessResult> {
            if args.first().map(String::as_str) == Some("create") {
                self.create_calls.fetch_add(1, Ordering::SeqCst);
            }
            if args.first().map(String::as_str) == Some("inspect") {
                let exists = *self.inspect_exists.lock().unwrap();
                return Ok(DockerProcessResult {
                    exit_code: if exists { 0 } else { 1 },
                    stdout_text: "false".to_string(),
                    stderr_text: String::new(),
                });
            }
            Ok(DockerProcessResult {
                exit_code: 0,
                stdout_text: String::new(),
                stderr_text: String::new(),
            })
        }
    }

    #[test]
    fn scope_key_uses_session_by_default() {
        let config = SandboxConfig::default();
        let request = SandboxRequest {
            session_id: "Sess-1".to_string(),
            ..Default::default()
        };
        assert_eq!(resolve_sandbox_scope_key(&config, &request), "sess-1");
    }

    #[test]
    fn container_name_is_deterministic_across_calls() {
        let config = SandboxConfig::default();
        let request = SandboxRequest {
            session_id: "sess-1".to_string(),
            ..Default::default()
        };
        let first = resolve_sandbox_container_name(&config, &request);
        let second = resolve_sandbox_container_name(&config, &request);
        assert_eq!(first, second);
        assert!(first.starts_with("ghostclaw-sbx-sess-1-"));
        assert!(first.len() <= 63);
    }

    #[test]
    fn should_sandbox_respects_mode_and_main_session() {
        let mut config = SandboxConfig {
            mode: SandboxMode::NonMain,
            ..Default::default()
        };
        let manager = SandboxManager::new(config.clone(), Arc::new(FakeDocker::new(false)));

        let main_request = SandboxRequest {
            session_id: "main".to_string(),
            main_session_id: "main".to_string(),
            ..Default::default()
        };
        assert!(!manager.should_sandbox(&main_request));

        let sub_request = SandboxRequest {
            session_id: "sub-1".to_string(),
            main_session_id: "main".to_string(),
            ..Default::default()
        };
        assert!(manager.should_sandbox(&sub_request));

        config.mode = SandboxMode::Off;
        manager.set_config(config);
        assert!(!manager.should_sandbox(&sub_request));
    }

    #[test]
    fn is_tool_allowed_honors_configured_deny_group() {
        let config = SandboxConfig::default();
        let manager = SandboxManager::new(config, Arc::new(FakeDocker::new(false)));
        assert!(manager.is_tool_allowed("read"));
        assert!(!manager.is_tool_allowed("browser"));
    }

    #[test]
    fn ensure_runtime_creates_then_starts_container_once() {
        let config = SandboxConfig {
            mode: SandboxMode::All,
            ..Default::default()
        };
        let docker = Arc::new(FakeDocker::new(false));
        let manager = SandboxManager::new(config, docker.clone());

        let dir = tempfile::TempDir::new().unwrap();
        let request = SandboxRequest {
            session_id: "s1".to_string(),
            workspace_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let runtime = manager.ensure_runtime(&request).unwrap();
        assert!(runtime.enabled);
        assert_eq!(docker.create_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn build_docker_create_args_emits_no_new_privileges_once() {
        let config = SandboxConfig::default();
        let request = SandboxRequest::default();
        let runtime = SandboxRuntime {
            enabled: true,
            scope_key: "session:main".to_string(),
            container_name: "ghostclaw-sbx-session-main-deadbeef".to_string(),
            mounted_workspace_dir: PathBuf::from("/tmp/ws"),
            container_workdir: config.workdir.clone(),
        };
        let args = build_docker_create_args(&config, &runtime, &request);
        let count = args.iter().filter(|a| a.as_str() == "no-new-privileges").count();
        assert_eq!(count, 1);
    }
}
