use std::sync::Mutex;

use regex::Regex;
use tracing::warn;

use super::{ApprovalDecision, ApprovalPolicy, ApprovalRequest, ApprovalSocketClient, ApprovalStore, ExecAsk, ExecSecurity};
use crate::error::Result;

fn normalize_text(value: &str) -> String {
    value.trim().to_lowercase()
}

fn first_token(command: &str) -> String {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let token = trimmed.split(' ').next().unwrap_or(trimmed);
    let base = match token.rfind('/') {
        Some(idx) => &token[idx + 1..],
        None => token,
    };
    normalize_text(base)
}

fn has_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '^' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    out
}

/// Combines policy, the on-disk allowlist, and the approval socket into a
/// single `authorize` decision point for exec-style tool calls.
pub struct ApprovalManager {
    policy: Mutex<ApprovalPolicy>,
    store: ApprovalStore,
    client: ApprovalSocketClient,
}

impl ApprovalManager {
    pub fn new(policy: ApprovalPolicy, store_path: &str, socket_path: &str) -> Result<Self> {
        let store = ApprovalStore::new(store_path);
        store.load()?;
        Ok(Self {
            policy: Mutex::new(policy),
            store,
            client: ApprovalSocketClient::new(socket_path),
        })
    }

    pub fn set_policy(&self, policy: ApprovalPolicy) {
        *self.policy.lock().expect("approval policy mutex poisoned") = policy;
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy.lock().expect("approval policy mutex poisoned").clone()
    }

    pub fn is_allowlisted(&self, command: &str) -> bool {
        let policy = self.policy();
        self.matches_allowlist(command, &policy.allowlist) || self.store.contains(command)
    }

    pub fn needs_approval(&self, request: &ApprovalRequest) -> bool {
        let policy = self.policy();
        let allowlisted = self.is_allowlisted(&request.command);

        if policy.security == ExecSecurity::Deny {
            return false;
        }
        if policy.ask == ExecAsk::Always {
            return true;
        }
        if policy.ask == ExecAsk::Off {
            return false;
        }

        !allowlisted
    }

    pub async fn authorize(&self, request: &ApprovalRequest) -> Result<ApprovalDecision> {
        let policy = self.policy();
        let allowlisted = self.is_allowlisted(&request.command);

        if policy.security == ExecSecurity::Deny {
            return Ok(ApprovalDecision::Deny);
        }

        if policy.security == ExecSecurity::Allowlist && !allowlisted && policy.ask == ExecAsk::Off
        {
            return Ok(ApprovalDecision::Deny);
        }

        if !self.needs_approval(request) {
            if policy.security == ExecSecurity::Allowlist && !allowlisted {
                return Ok(ApprovalDecision::Deny);
            }
            return Ok(ApprovalDecision::AllowOnce);
        }

        let decision = match self.client.request(request).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, command = %request.command, "approval socket round-trip failed, failing closed");
                return Ok(ApprovalDecision::Deny);
            }
        };

        if decision == ApprovalDecision::AllowAlways {
            self.store.add(&request.command);
            self.store.save()?;
        }

        Ok(decision)
    }

    fn matches_allowlist(&self, command: &str, allowlist: &[String]) -> bool {
        let normalized_command = normalize_text(command);
        let executable = first_token(&normalized_command);

        for entry in allowlist {
            let pattern = normalize_text(entry);
            if pattern.is_empty() {
                continue;
            }

            if !has_glob(&pattern) {
                if normalized_command == pattern || executable == pattern {
                    return true;
                }
                continue;
            }

            if let Ok(re) = Regex::new(&glob_to_regex(&pattern)) {
                if re.is_match(&normalized_command) || re.is_match(&executable) {
                    return true;
                }
            }
        }

        false
    }
}
