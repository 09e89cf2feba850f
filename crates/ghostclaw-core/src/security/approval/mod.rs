mod manager;
mod socket;
mod store;

pub use manager::ApprovalManager;
pub use socket::{ApprovalHandler, ApprovalSocketClient, ApprovalSocketServer};
pub use store::ApprovalStore;

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecSecurity {
    Deny,
    Allowlist,
    Full,
}

impl ExecSecurity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Allowlist => "allowlist",
            Self::Full => "full",
        }
    }

    pub fn from_str_loose(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "deny" => Ok(Self::Deny),
            "allowlist" => Ok(Self::Allowlist),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown ExecSecurity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecAsk {
    Off,
    OnMiss,
    Always,
}

impl ExecAsk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::OnMiss => "on-miss",
            Self::Always => "always",
        }
    }

    pub fn from_str_loose(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "on-miss" | "on_miss" | "onmiss" => Ok(Self::OnMiss),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown ExecAsk: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
    Deny,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllowOnce => "allow-once",
            Self::AllowAlways => "allow-always",
            Self::Deny => "deny",
        }
    }

    pub fn from_str_loose(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "allow-once" | "allow_once" => Ok(Self::AllowOnce),
            "allow-always" | "allow_always" => Ok(Self::AllowAlways),
            "deny" => Ok(Self::Deny),
            other => Err(format!("unknown ApprovalDecision: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    pub allowlist: Vec<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            security: ExecSecurity::Allowlist,
            ask: ExecAsk::OnMiss,
            allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub command: String,
    pub session_id: String,
    pub timeout: Duration,
}

impl Default for ApprovalRequest {
    fn default() -> Self {
        Self {
            command: String::new(),
            session_id: String::new(),
            timeout: Duration::from_secs(120),
        }
    }
}
