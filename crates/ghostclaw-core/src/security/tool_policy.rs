use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::debug;

fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

fn has_glob_chars(value: &str) -> bool {
    value.contains('*') || value.contains('?')
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2 + 4);
    out.push('^');
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolProfile {
    Minimal,
    Coding,
    Messaging,
    Full,
}

impl ToolProfile {
    pub fn from_str_loose(value: &str) -> Result<Self, String> {
        match normalize_key(value).as_str() {
            "minimal" => Ok(Self::Minimal),
            "coding" => Ok(Self::Coding),
            "messaging" => Ok(Self::Messaging),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown tool profile: {other}")),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Coding => "coding",
            Self::Messaging => "messaging",
            Self::Full => "full",
        }
    }
}

impl Default for ToolProfile {
    fn default() -> Self {
        Self::Full
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl ToolPolicy {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolPolicyRequest {
    pub tool_name: String,
    pub profile: ToolProfile,
    pub provider: String,
    pub agent_id: String,
    pub channel_id: String,
    pub group_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ToolPolicyDecision {
    pub allowed: bool,
    pub blocked_by: String,
    pub reason: String,
    pub trace: Vec<String>,
}

struct PipelineStep {
    policy: Option<ToolPolicy>,
    label: String,
}

/// Seven-layer allow/deny evaluation over a single tool request. Layers run
/// in order; the first deny match or failed allowlist short-circuits.
#[derive(Default)]
pub struct ToolPolicyPipeline {
    profile_policies: HashMap<ToolProfile, ToolPolicy>,
    provider_profile_policies: HashMap<String, HashMap<ToolProfile, ToolPolicy>>,
    global_policy: Option<ToolPolicy>,
    global_provider_policies: HashMap<String, ToolPolicy>,
    agent_policies: HashMap<String, ToolPolicy>,
    agent_provider_policies: HashMap<String, HashMap<String, ToolPolicy>>,
    group_policies: HashMap<String, ToolPolicy>,
}

impl ToolPolicyPipeline {
    pub fn new() -> Self {
        let mut profile_policies = HashMap::new();
        for profile in [
            ToolProfile::Minimal,
            ToolProfile::Coding,
            ToolProfile::Messaging,
            ToolProfile::Full,
        ] {
            profile_policies.insert(profile, Self::default_profile_policy(profile));
        }
        Self {
            profile_policies,
            ..Default::default()
        }
    }

    pub fn set_profile_policy(&mut self, profile: ToolProfile, policy: ToolPolicy) {
        self.profile_policies.insert(profile, policy);
    }

    pub fn set_provider_profile_policy(
        &mut self,
        provider: &str,
        profile: ToolProfile,
        policy: ToolPolicy,
    ) {
        let key = normalize_key(provider);
        if key.is_empty() {
            return;
        }
        self.provider_profile_policies
            .entry(key)
            .or_default()
            .insert(profile, policy);
    }

    pub fn set_global_policy(&mut self, policy: ToolPolicy) {
        self.global_policy = Some(policy);
    }

    pub fn clear_global_policy(&mut self) {
        self.global_policy = None;
    }

    pub fn set_global_provider_policy(&mut self, provider: &str, policy: ToolPolicy) {
        let key = normalize_key(provider);
        if key.is_empty() {
            return;
        }
        self.global_provider_policies.insert(key, policy);
    }

    pub fn set_agent_policy(&mut self, agent_id: &str, policy: ToolPolicy) {
        let key = normalize_key(agent_id);
        if key.is_empty() {
            return;
        }
        self.agent_policies.insert(key, policy);
    }

    pub fn set_agent_provider_policy(&mut self, agent_id: &str, provider: &str, policy: ToolPolicy) {
        let agent_key = normalize_key(agent_id);
        let provider_key = normalize_key(provider);
        if agent_key.is_empty() || provider_key.is_empty() {
            return;
        }
        self.agent_provider_policies
            .entry(agent_key)
            .or_default()
            .insert(provider_key, policy);
    }

    pub fn set_group_policy(&mut self, channel_id: &str, group_id: &str, policy: ToolPolicy) {
        let key = Self::make_group_key(channel_id, group_id);
        if key.is_empty() {
            return;
        }
        self.group_policies.insert(key, policy);
    }

    pub fn evaluate_tool(&self, request: &ToolPolicyRequest) -> ToolPolicyDecision {
        self.evaluate_named(&request.tool_name, request)
    }

    pub fn evaluate_named(
        &self,
        tool_name: &str,
        request: &ToolPolicyRequest,
    ) -> ToolPolicyDecision {
        let normalized_tool = Self::normalize_tool_name(tool_name);
        if normalized_tool.is_empty() {
            return ToolPolicyDecision {
                allowed: false,
                blocked_by: "tools.profile".to_string(),
                reason: "empty tool name".to_string(),
                trace: vec!["tools.profile: denied (empty tool name)".to_string()],
            };
        }

        let steps = self.build_default_pipeline_steps(request);
        let mut trace = Vec::with_capacity(steps.len() + 1);

        for step in &steps {
            let Some(policy) = &step.policy else {
                continue;
            };

            let deny = Self::expand_entries(&policy.deny);
            for entry in &deny {
                if Self::matches_pattern(&normalized_tool, entry) {
                    let reason = format!("matched deny entry: {entry}");
                    trace.push(format!("{}: denied ({reason})", step.label));
                    debug!(tool = %normalized_tool, layer = %step.label, "tool denied");
                    return ToolPolicyDecision {
                        allowed: false,
                        blocked_by: step.label.clone(),
                        reason,
                        trace,
                    };
                }
            }

            let allow = Self::expand_entries(&policy.allow);
            if !allow.is_empty() {
                let allowed = allow
                    .iter()
                    .any(|entry| Self::matches_pattern(&normalized_tool, entry));
                if !allowed {
                    let reason = "not matched by allowlist".to_string();
                    trace.push(format!("{}: denied ({reason})", step.label));
                    debug!(tool = %normalized_tool, layer = %step.label, "tool not in allowlist");
                    return ToolPolicyDecision {
                        allowed: false,
                        blocked_by: step.label.clone(),
                        reason,
                        trace,
                    };
                }
            }

            trace.push(format!("{}: allow", step.label));
        }

        trace.push("decision: allow".to_string());
        ToolPolicyDecision {
            allowed: true,
            blocked_by: String::new(),
            reason: String::new(),
            trace,
        }
    }

    pub fn filter_tools(&self, tool_names: &[String], request: &ToolPolicyRequest) -> Vec<String> {
        tool_names
            .iter()
            .filter(|name| {
                let mut req = request.clone();
                req.tool_name = (*name).clone();
                self.evaluate_tool(&req).allowed
            })
            .cloned()
            .collect()
    }

    fn build_default_pipeline_steps(&self, request: &ToolPolicyRequest) -> Vec<PipelineStep> {
        let mut steps = Vec::with_capacity(7);

        let provider = normalize_key(&request.provider);
        let agent_id = normalize_key(&request.agent_id);

        steps.push(PipelineStep {
            policy: self.profile_policies.get(&request.profile).cloned(),
            label: format!("tools.profile ({})", request.profile.label()),
        });

        let provider_profile = if provider.is_empty() {
            None
        } else {
            self.provider_profile_policies
                .get(&provider)
                .and_then(|by_profile| by_profile.get(&request.profile))
                .cloned()
        };
        steps.push(PipelineStep {
            policy: provider_profile,
            label: if provider.is_empty() {
                "tools.byProvider.profile".to_string()
            } else {
                format!(
                    "tools.byProvider.profile ({provider}, {})",
                    request.profile.label()
                )
            },
        });

        steps.push(PipelineStep {
            policy: self.global_policy.clone(),
            label: "tools.allow".to_string(),
        });

        let global_provider = if provider.is_empty() {
            None
        } else {
            self.global_provider_policies.get(&provider).cloned()
        };
        steps.push(PipelineStep {
            policy: global_provider,
            label: if provider.is_empty() {
                "tools.byProvider.allow".to_string()
            } else {
                format!("tools.byProvider.allow ({provider})")
            },
        });

        let agent_policy = if agent_id.is_empty() {
            None
        } else {
            self.agent_policies.get(&agent_id).cloned()
        };
        steps.push(PipelineStep {
            policy: agent_policy,
            label: if agent_id.is_empty() {
                "agents.{id}.tools.allow".to_string()
            } else {
                format!("agents.{agent_id}.tools.allow")
            },
        });

        let agent_provider = if agent_id.is_empty() || provider.is_empty() {
            None
        } else {
            self.agent_provider_policies
                .get(&agent_id)
                .and_then(|by_provider| by_provider.get(&provider))
                .cloned()
        };
        steps.push(PipelineStep {
            policy: agent_provider,
            label: if agent_id.is_empty() {
                "agents.{id}.tools.byProvider.allow".to_string()
            } else {
                format!("agents.{agent_id}.tools.byProvider.allow")
            },
        });

        let group_key = Self::make_group_key(&request.channel_id, &request.group_id);
        let group_policy = if group_key.is_empty() {
            None
        } else {
            self.group_policies.get(&group_key).cloned()
        };
        let group_label = if request.channel_id.is_empty() && request.group_id.is_empty() {
            "group/channel tools.allow".to_string()
        } else {
            format!(
                "group/channel tools.allow ({}/{})",
                normalize_key(&request.channel_id),
                normalize_key(&request.group_id)
            )
        };
        steps.push(PipelineStep {
            policy: group_policy,
            label: group_label,
        });

        steps
    }

    pub fn expand_entries(entries: &[String]) -> Vec<String> {
        let mut expanded = Vec::new();
        let mut seen = HashSet::new();

        for raw in entries {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }

            let group = Self::expand_group(trimmed);
            if !group.is_empty() {
                for name in group {
                    if seen.insert(name.clone()) {
                        expanded.push(name);
                    }
                }
                continue;
            }

            let pattern = Self::normalize_pattern(trimmed);
            if pattern.is_empty() {
                continue;
            }
            if seen.insert(pattern.clone()) {
                expanded.push(pattern);
            }
        }

        expanded
    }

    pub fn expand_group(group_name: &str) -> Vec<String> {
        let mut key = normalize_key(group_name);
        if key.is_empty() {
            return Vec::new();
        }

        if !key.starts_with("group:") {
            let alias = match key.as_str() {
                "fs" => Some("group:fs"),
                "runtime" => Some("group:runtime"),
                "memory" => Some("group:memory"),
                "sessions" => Some("group:sessions"),
                "skills" => Some("group:skills"),
                "ui" => Some("group:ui"),
                "automation" => Some("group:automation"),
                "messaging" => Some("group:messaging"),
                "calendar" => Some("group:calendar"),
                "web" => Some("group:web"),
                _ => None,
            };
            if let Some(alias) = alias {
                key = alias.to_string();
            }
        }

        let members: &[&str] = match key.as_str() {
            "group:fs" => &["read", "write", "edit"],
            "group:runtime" => &["exec", "process"],
            "group:memory" => &["memory_store", "memory_recall", "memory_forget"],
            "group:sessions" => &["sessions", "subagents", "skills"],
            "group:skills" => &["skills"],
            "group:ui" => &["browser", "canvas"],
            "group:automation" => &["cron", "gateway"],
            "group:messaging" => &["message", "email", "notify", "reminder"],
            "group:calendar" => &["calendar", "reminder"],
            "group:web" => &["web_search", "web_fetch"],
            _ => &[],
        };
        members.iter().map(|s| s.to_string()).collect()
    }

    pub fn normalize_tool_name(name: &str) -> String {
        let normalized = normalize_key(name);
        if normalized.is_empty() {
            return String::new();
        }

        match normalized.as_str() {
            "file_read" => "read".to_string(),
            "file_write" => "write".to_string(),
            "file_edit" => "edit".to_string(),
            "shell" => "exec".to_string(),
            "bash" => "exec".to_string(),
            "process_bg" => "process".to_string(),
            "sessions_list" => "sessions".to_string(),
            "sessions_history" => "sessions".to_string(),
            "sessions_send" => "sessions".to_string(),
            "sessions_spawn" => "sessions".to_string(),
            "session_list" => "sessions".to_string(),
            "session_fork" => "subagents".to_string(),
            "apply-patch" => "edit".to_string(),
            other => other.to_string(),
        }
    }

    pub fn default_profile_policy(profile: ToolProfile) -> ToolPolicy {
        match profile {
            ToolProfile::Minimal => ToolPolicy {
                allow: vec!["read".to_string()],
                deny: Vec::new(),
            },
            ToolProfile::Coding => ToolPolicy {
                allow: vec![
                    "group:fs".to_string(),
                    "group:runtime".to_string(),
                    "group:sessions".to_string(),
                    "group:web".to_string(),
                ],
                deny: Vec::new(),
            },
            ToolProfile::Messaging => ToolPolicy {
                allow: vec![
                    "group:messaging".to_string(),
                    "group:sessions".to_string(),
                    "group:web".to_string(),
                ],
                deny: Vec::new(),
            },
            ToolProfile::Full => ToolPolicy::default(),
        }
    }

    fn make_group_key(channel_id: &str, group_id: &str) -> String {
        let channel = normalize_key(channel_id);
        let group = normalize_key(group_id);
        if channel.is_empty() && group.is_empty() {
            return String::new();
        }
        format!("{channel}::{group}")
    }

    fn matches_pattern(name: &str, pattern: &str) -> bool {
        let normalized_name = Self::normalize_tool_name(name);
        let normalized_pattern = Self::normalize_pattern(pattern);
        if normalized_name.is_empty() || normalized_pattern.is_empty() {
            return false;
        }
        if normalized_pattern == "*" {
            return true;
        }

        if !has_glob_chars(&normalized_pattern) {
            return normalized_name == Self::normalize_tool_name(&normalized_pattern);
        }

        match Regex::new(&glob_to_regex(&normalized_pattern)) {
            Ok(re) => re.is_match(&normalized_name),
            Err(_) => false,
        }
    }

    fn normalize_pattern(pattern: &str) -> String {
        let normalized = normalize_key(pattern);
        if normalized.is_empty() {
            return String::new();
        }
        if has_glob_chars(&normalized) {
            return normalized;
        }
        Self::normalize_tool_name(&normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tool: &str) -> ToolPolicyRequest {
        ToolPolicyRequest {
            tool_name: tool.to_string(),
            profile: ToolProfile::Full,
            ..Default::default()
        }
    }

    #[test]
    fn empty_tool_name_is_denied_at_profile_layer() {
        let pipeline = ToolPolicyPipeline::new();
        let decision = pipeline.evaluate_tool(&request("  "));
        assert!(!decision.allowed);
        assert_eq!(decision.blocked_by, "tools.profile");
    }

    #[test]
    fn minimal_profile_only_allows_read() {
        let pipeline = ToolPolicyPipeline::new();
        let req = ToolPolicyRequest {
            tool_name: "write".to_string(),
            profile: ToolProfile::Minimal,
            ..Default::default()
        };
        let decision = pipeline.evaluate_tool(&req);
        assert!(!decision.allowed);
        assert!(decision.blocked_by.starts_with("tools.profile"));
    }

    #[test]
    fn global_deny_blocks_even_when_profile_allows() {
        let mut pipeline = ToolPolicyPipeline::new();
        pipeline.set_global_policy(ToolPolicy {
            allow: Vec::new(),
            deny: vec!["exec".to_string()],
        });
        let req = ToolPolicyRequest {
            tool_name: "bash".to_string(),
            profile: ToolProfile::Coding,
            ..Default::default()
        };
        let decision = pipeline.evaluate_tool(&req);
        assert!(!decision.allowed);
        assert_eq!(decision.blocked_by, "tools.allow");
    }

    #[test]
    fn group_layer_can_deny_for_a_specific_channel() {
        let mut pipeline = ToolPolicyPipeline::new();
        pipeline.set_group_policy("telegram", "chat-1", ToolPolicy {
            allow: Vec::new(),
            deny: vec!["group:messaging".to_string()],
        });
        let req = ToolPolicyRequest {
            tool_name: "message".to_string(),
            profile: ToolProfile::Messaging,
            channel_id: "telegram".to_string(),
            group_id: "chat-1".to_string(),
            ..Default::default()
        };
        let decision = pipeline.evaluate_tool(&req);
        assert!(!decision.allowed);
        assert!(decision.blocked_by.starts_with("group/channel"));
    }

    #[test]
    fn glob_pattern_matches_prefix() {
        let mut pipeline = ToolPolicyPipeline::new();
        pipeline.set_global_policy(ToolPolicy {
            allow: vec!["sess*".to_string()],
            deny: Vec::new(),
        });
        let decision = pipeline.evaluate_tool(&request("sessions_list"));
        assert!(decision.allowed);
    }

    #[test]
    fn tool_name_aliases_normalize_before_matching() {
        assert_eq!(ToolPolicyPipeline::normalize_tool_name("FILE_READ"), "read");
        assert_eq!(ToolPolicyPipeline::normalize_tool_name("Bash"), "exec");
    }

    #[test]
    fn filter_tools_keeps_only_allowed() {
        let pipeline = ToolPolicyPipeline::new();
        let req = ToolPolicyRequest {
            profile: ToolProfile::Minimal,
            ..Default::default()
        };
        let names = vec!["read".to_string(), "write".to_string()];
        let filtered = pipeline.filter_tools(&names, &req);
        assert_eq!(filtered, vec!["read".to_string()]);
    }
}
