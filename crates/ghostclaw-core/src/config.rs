use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::security::sandbox::{SandboxMode, SandboxScope, WorkspaceAccess};
use crate::security::{
    approval::{ExecAsk, ExecSecurity},
    path_policy::AutonomyLevel,
    ConfigSecrets,
};

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("~/ghostclaw/workspace")
}

fn default_autonomy() -> String {
    "supervised".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AutonomyConfig {
    #[serde(default = "default_autonomy")]
    pub level: String,
    #[serde(default)]
    pub workspace_only: bool,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    #[serde(default)]
    pub max_cost_per_day_cents: Option<u64>,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            level: default_autonomy(),
            workspace_only: false,
            workspace_dir: default_workspace_dir(),
            allowed_commands: Vec::new(),
            forbidden_paths: Vec::new(),
            max_cost_per_day_cents: None,
        }
    }
}

impl AutonomyConfig {
    pub fn autonomy_level(&self) -> AutonomyLevel {
        crate::security::path_policy::autonomy_level_from_str(&self.level)
    }
}

fn default_exec_security() -> String {
    "allowlist".to_string()
}

fn default_exec_ask() -> String {
    "on-miss".to_string()
}

fn default_approval_store_path() -> String {
    "~/.ghostclaw/exec-allowlist.txt".to_string()
}

fn default_approval_socket_path() -> String {
    "~/.ghostclaw/approvals.sock".to_string()
}

fn default_approval_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApprovalConfig {
    #[serde(default = "default_exec_security")]
    pub security: String,
    #[serde(default = "default_exec_ask")]
    pub ask: String,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default = "default_approval_store_path")]
    pub store_path: String,
    #[serde(default = "default_approval_socket_path")]
    pub socket_path: String,
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            security: default_exec_security(),
            ask: default_exec_ask(),
            allowlist: Vec::new(),
            store_path: default_approval_store_path(),
            socket_path: default_approval_socket_path(),
            timeout_secs: default_approval_timeout_secs(),
        }
    }
}

impl ApprovalConfig {
    pub fn exec_security(&self) -> ExecSecurity {
        ExecSecurity::from_str_loose(&self.security).unwrap_or(ExecSecurity::Allowlist)
    }

    pub fn exec_ask(&self) -> ExecAsk {
        ExecAsk::from_str_loose(&self.ask).unwrap_or(ExecAsk::OnMiss)
    }
}

fn default_sandbox_mode() -> String {
    "off".to_string()
}

fn default_sandbox_scope() -> String {
    "session".to_string()
}

fn default_workspace_access() -> String {
    "ro".to_string()
}

fn default_sandbox_image() -> String {
    "ghostclaw-sandbox:bookworm-slim".to_string()
}

fn default_container_prefix() -> String {
    "ghostclaw-sbx-".to_string()
}

fn default_sandbox_workdir() -> String {
    "/workspace".to_string()
}

fn default_network_mode() -> String {
    "none".to_string()
}

fn default_tmpfs() -> Vec<String> {
    vec!["/tmp".to_string(), "/var/tmp".to_string(), "/run".to_string()]
}

fn default_cap_drop() -> Vec<String> {
    vec!["ALL".to_string()]
}

fn default_sandbox_tool_allow() -> Vec<String> {
    vec![
        "group:fs".to_string(),
        "group:runtime".to_string(),
        "group:sessions".to_string(),
        "group:web".to_string(),
    ]
}

fn default_sandbox_tool_deny() -> Vec<String> {
    vec![
        "group:ui".to_string(),
        "group:automation".to_string(),
        "group:messaging".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SandboxConfigSection {
    #[serde(default = "default_sandbox_mode")]
    pub mode: String,
    #[serde(default = "default_sandbox_scope")]
    pub scope: String,
    #[serde(default = "default_workspace_access")]
    pub workspace_access: String,
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    #[serde(default = "default_sandbox_workdir")]
    pub workdir: String,
    #[serde(default = "default_true")]
    pub read_only_root: bool,
    #[serde(default = "default_tmpfs")]
    pub tmpfs: Vec<String>,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default = "default_cap_drop")]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default = "default_sandbox_tool_allow")]
    pub tool_allow: Vec<String>,
    #[serde(default = "default_sandbox_tool_deny")]
    pub tool_deny: Vec<String>,
    #[serde(default)]
    pub pids_limit: Option<u32>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub memory_swap_limit: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

impl Default for SandboxConfigSection {
    fn default() -> Self {
        Self {
            mode: default_sandbox_mode(),
            scope: default_sandbox_scope(),
            workspace_access: default_workspace_access(),
            image: default_sandbox_image(),
            container_prefix: default_container_prefix(),
            workdir: default_sandbox_workdir(),
            read_only_root: true,
            tmpfs: default_tmpfs(),
            network_mode: default_network_mode(),
            cap_drop: default_cap_drop(),
            dns: Vec::new(),
            extra_hosts: Vec::new(),
            binds: Vec::new(),
            tool_allow: default_sandbox_tool_allow(),
            tool_deny: default_sandbox_tool_deny(),
            pids_limit: None,
            memory_limit: None,
            memory_swap_limit: None,
            cpu_limit: None,
        }
    }
}

impl SandboxConfigSection {
    pub fn to_sandbox_config(&self) -> crate::security::sandbox::SandboxConfig {
        crate::security::sandbox::SandboxConfig {
            mode: match self.mode.as_str() {
                "all" => SandboxMode::All,
                "non-main" | "nonmain" => SandboxMode::NonMain,
                _ => SandboxMode::Off,
            },
            scope: match self.scope.as_str() {
                "shared" => SandboxScope::Shared,
                "agent" => SandboxScope::Agent,
                _ => SandboxScope::Session,
            },
            workspace_access: match self.workspace_access.as_str() {
                "none" => WorkspaceAccess::None,
                "rw" => WorkspaceAccess::ReadWrite,
                _ => WorkspaceAccess::ReadOnly,
            },
            image: self.image.clone(),
            container_prefix: self.container_prefix.clone(),
            workdir: self.workdir.clone(),
            read_only_root: self.read_only_root,
            tmpfs: self.tmpfs.clone(),
            network_mode: self.network_mode.clone(),
            cap_drop: self.cap_drop.clone(),
            dns: self.dns.clone(),
            extra_hosts: self.extra_hosts.clone(),
            binds: self.binds.clone(),
            tool_allow: self.tool_allow.clone(),
            tool_deny: self.tool_deny.clone(),
            env: vec![("LANG".to_string(), "C.UTF-8".to_string())],
            pids_limit: self.pids_limit,
            memory_limit: self.memory_limit.clone(),
            memory_swap_limit: self.memory_swap_limit.clone(),
            cpu_limit: self.cpu_limit,
        }
    }
}

fn default_pairing_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PairingConfig {
    #[serde(default = "default_pairing_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_pairing_max_attempts(),
        }
    }
}

/// Channel-bearing secrets. Only the fields `encrypt_config_secrets`/
/// `decrypt_config_secrets` need to walk live here; full channel wiring
/// (message routing, presence, etc.) is out of scope for the security core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelSecretsConfig {
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub discord_bot_token: Option<String>,
    #[serde(default)]
    pub slack_bot_token: Option<String>,
    #[serde(default)]
    pub matrix_access_token: Option<String>,
    #[serde(default)]
    pub whatsapp_access_token: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SecretsConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub composio_api_key: Option<String>,
    #[serde(default)]
    pub channels: ChannelSecretsConfig,
}

/// Top-level configuration for the security & sandboxing core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub sandbox: SandboxConfigSection,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| {
            crate::error::Error::Config(format!("failed to serialize config: {e}"))
        })?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn secrets_mut(&mut self) -> ConfigSecrets<'_> {
        ConfigSecrets {
            api_key: &mut self.secrets.api_key,
            composio_api_key: &mut self.secrets.composio_api_key,
            telegram_bot_token: self.secrets.channels.telegram_bot_token.as_mut(),
            discord_bot_token: self.secrets.channels.discord_bot_token.as_mut(),
            slack_bot_token: self.secrets.channels.slack_bot_token.as_mut(),
            matrix_access_token: self.secrets.channels.matrix_access_token.as_mut(),
            whatsapp_access_token: self.secrets.channels.whatsapp_access_token.as_mut(),
            webhook_secret: self.secrets.channels.webhook_secret.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = AppConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let reloaded: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(reloaded.autonomy.level, config.autonomy.level);
        assert_eq!(reloaded.sandbox.mode, config.sandbox.mode);
    }

    #[test]
    fn sandbox_section_maps_to_runtime_config() {
        let mut section = SandboxConfigSection::default();
        section.mode = "all".to_string();
        section.scope = "shared".to_string();
        let runtime = section.to_sandbox_config();
        assert_eq!(runtime.mode, SandboxMode::All);
        assert_eq!(runtime.scope, SandboxScope::Shared);
    }

    #[test]
    fn load_missing_config_file_errors() {
        let result = AppConfig::load(Path::new("/nonexistent/ghostclaw.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ghostclaw.toml");
        let mut config = AppConfig::default();
        config.autonomy.level = "full".to_string();
        config.save(&path).unwrap();

        let reloaded = AppConfig::load(&path).unwrap();
        assert_eq!(reloaded.autonomy.level, "full");
    }
}
