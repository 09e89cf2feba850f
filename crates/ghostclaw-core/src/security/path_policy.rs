use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::security::action_tracker::ActionTracker;

/// Filesystem prefixes that are always forbidden, regardless of config.
/// The tenth reference-implementation entry (a literal secrets-key path) is
/// deliberately not hardcoded here — `SecurityPolicy::from_config` appends
/// the *actual* secrets-key path instead, since the config directory isn't
/// fixed at compile time in this port. See DESIGN.md.
pub const SYSTEM_FORBIDDEN_PATHS: &[&str] = &[
    "/etc",
    "/var",
    "/root",
    "/proc",
    "/sys",
    "/dev",
    "~/.ssh",
    "~/.gnupg",
    "~/.aws",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutonomyLevel {
    ReadOnly,
    Supervised,
    Full,
}

pub fn autonomy_level_from_str(value: &str) -> Result<AutonomyLevel> {
    match value.trim().to_lowercase().as_str() {
        "readonly" => Ok(AutonomyLevel::ReadOnly),
        "supervised" => Ok(AutonomyLevel::Supervised),
        "full" => Ok(AutonomyLevel::Full),
        other => Err(Error::Config(format!("invalid autonomy level: {other}"))),
    }
}

/// Path & command policy: workspace containment, forbidden paths, allowed
/// base commands, and the action-rate limiter.
pub struct SecurityPolicy {
    pub autonomy: AutonomyLevel,
    pub workspace_dir: PathBuf,
    pub workspace_only: bool,
    pub allowed_commands: Vec<String>,
    pub forbidden_paths: Vec<String>,
    pub max_cost_per_day_cents: u64,
    pub tracker: ActionTracker,
}

impl SecurityPolicy {
    /// Build a policy, merging the system forbidden paths and the live
    /// secrets-key path into whatever `forbidden_paths` the caller supplies.
    pub fn new(
        autonomy: AutonomyLevel,
        workspace_dir: PathBuf,
        workspace_only: bool,
        allowed_commands: Vec<String>,
        mut forbidden_paths: Vec<String>,
        max_actions_per_hour: u32,
        max_cost_per_day_cents: u64,
        secrets_key_path: Option<&Path>,
    ) -> Self {
        for system_path in SYSTEM_FORBIDDEN_PATHS {
            if !forbidden_paths.iter().any(|p| p == system_path) {
                forbidden_paths.push((*system_path).to_string());
            }
        }
        if let Some(key_path) = secrets_key_path {
            let key_path = key_path.to_string_lossy().to_string();
            if !forbidden_paths.iter().any(|p| p == &key_path) {
                forbidden_paths.push(key_path);
            }
        }

        Self {
            autonomy,
            workspace_dir,
            workspace_only,
            allowed_commands,
            forbidden_paths,
            max_cost_per_day_cents,
            tracker: ActionTracker::new(max_actions_per_hour),
        }
    }

    pub fn is_command_allowed(&self, cmd: &str) -> bool {
        if cmd.trim().is_empty() {
            return false;
        }
        let base = base_command(cmd);
        if base.is_empty() {
            return false;
        }
        self.allowed_commands.iter().any(|c| c == &base)
    }

    pub fn is_path_allowed(&self, path: &str) -> bool {
        if path.contains('\0') {
            return false;
        }
        validate_path(path, self).is_ok()
    }

    pub fn check_rate_limit(&self) -> bool {
        self.tracker.check()
    }

    pub fn record_action(&self) {
        self.tracker.record();
    }
}

fn base_command(command: &str) -> String {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let first = match trimmed.split_once(' ') {
        Some((head, _)) => head,
        None => trimmed,
    };
    match first.rfind('/') {
        Some(idx) => first[idx + 1..].to_string(),
        None => first.to_string(),
    }
}

/// Expand a leading `~` (first character only) to the process home
/// directory, then substitute `$VAR` / `${VAR}` from the environment
/// anywhere in the remaining string. Unset variables expand to empty.
pub fn expand_path(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    let mut value = value.to_string();
    if value.starts_with('~') {
        if let Ok(home) = std::env::var("HOME") {
            value.replace_range(0..1, &home);
        }
    }

    let mut out = String::with_capacity(value.len());
    let mut i = 0;
    let v: Vec<char> = value.chars().collect();
    while i < v.len() {
        if v[i] == '$' {
            let mut j = i + 1;
            let braced = j < v.len() && v[j] == '{';
            if braced {
                j += 1;
            }
            let start = j;
            while j < v.len()
                && (v[j].is_ascii_alphanumeric() || v[j] == '_')
                && !(braced && v[j] == '}')
            {
                j += 1;
            }
            if j > start {
                let name: String = v[start..j].iter().collect();
                let mut end = j;
                if braced {
                    if end < v.len() && v[end] == '}' {
                        end += 1;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
                i = end;
                continue;
            }
        }
        out.push(v[i]);
        i += 1;
    }
    out
}

/// True iff `candidate`'s path components start with all of `parent`'s.
pub fn is_subpath(candidate: &Path, parent: &Path) -> bool {
    let mut c = candidate.components();
    for p in parent.components() {
        match c.next() {
            Some(cc) if cc == p => continue,
            _ => return false,
        }
    }
    true
}

fn weakly_canonical(path: &Path) -> std::io::Result<PathBuf> {
    // Mirrors std::filesystem::weakly_canonical: canonicalize the longest
    // existing ancestor, then re-append the non-existent suffix untouched.
    let mut existing = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canon) => {
                let mut result = canon;
                for part in suffix.into_iter().rev() {
                    result.push(part);
                }
                return Ok(result);
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e);
                }
                match existing.file_name() {
                    Some(name) => {
                        suffix.push(name.to_os_string());
                        if !existing.pop() {
                            // No parent left to try; give up cleanly.
                            let mut result = PathBuf::new();
                            for part in suffix.into_iter().rev() {
                                result.push(part);
                            }
                            return Ok(result);
                        }
                    }
                    None => {
                        let mut result = existing;
                        for part in suffix.into_iter().rev() {
                            result.push(part);
                        }
                        return Ok(result);
                    }
                }
            }
        }
    }
}

fn path_matches_forbidden(candidate: &Path, forbidden_paths: &[String]) -> bool {
    for entry in forbidden_paths {
        let expanded = PathBuf::from(expand_path(entry));
        let canonical_forbidden = weakly_canonical(&expanded).unwrap_or(expanded);
        if is_subpath(candidate, &canonical_forbidden) {
            return true;
        }
    }
    false
}

/// Canonicalize and validate a path input against the policy. See
/// `spec.md` section 4.2 for the exact contract.
pub fn validate_path(path: &str, policy: &SecurityPolicy) -> Result<PathBuf> {
    if path.contains('\0') {
        return Err(Error::PathInvalid("Path contains null byte".to_string()));
    }

    let expanded = expand_path(path);
    let expanded = if expanded.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(expanded)
    };

    let candidate = if expanded.is_relative() {
        policy.workspace_dir.join(&expanded)
    } else {
        expanded
    };

    let canonical_candidate = weakly_canonical(&candidate)
        .map_err(|e| Error::PathInvalid(format!("Path canonicalization failed: {e}")))?;
    let canonical_workspace = weakly_canonical(&policy.workspace_dir)
        .map_err(|e| Error::PathInvalid(format!("Workspace canonicalization failed: {e}")))?;

    if policy.workspace_only && !is_subpath(&canonical_candidate, &canonical_workspace) {
        return Err(Error::PathInvalid("Path escapes workspace".to_string()));
    }

    let inside_workspace = is_subpath(&canonical_candidate, &canonical_workspace);
    if !inside_workspace && path_matches_forbidden(&canonical_candidate, &policy.forbidden_paths) {
        return Err(Error::PathInvalid("Path is forbidden by policy".to_string()));
    }

    if !inside_workspace && policy.workspace_only {
        return Err(Error::PathInvalid("Symlink escape detected".to_string()));
    }

    Ok(canonical_candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn policy_for(workspace: &Path) -> SecurityPolicy {
        SecurityPolicy::new(
            AutonomyLevel::Supervised,
            workspace.to_path_buf(),
            true,
            vec!["ls".to_string(), "cat".to_string()],
            Vec::new(),
            100,
            1000,
            None,
        )
    }

    #[test]
    fn rejects_null_byte() {
        let dir = TempDir::new().unwrap();
        let policy = policy_for(dir.path());
        let err = validate_path("foo\0bar", &policy).unwrap_err();
        assert!(matches!(err, Error::PathInvalid(_)));
    }

    #[test]
    fn resolves_relative_paths_inside_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let policy = policy_for(dir.path());
        let resolved = validate_path("a.txt", &policy).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "a.txt");
    }

    #[test]
    fn rejects_escape_outside_workspace() {
        let dir = TempDir::new().unwrap();
        let policy = policy_for(dir.path());
        let err = validate_path("../../etc/passwd", &policy).unwrap_err();
        assert!(matches!(err, Error::PathInvalid(ref m) if m.contains("escapes workspace")));
    }

    #[test]
    fn detects_symlink_escape() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("passwd"), "secret").unwrap();
        symlink(outside.path().join("passwd"), dir.path().join("escape")).unwrap();

        let policy = policy_for(dir.path());
        let err = validate_path("escape", &policy).unwrap_err();
        match err {
            Error::PathInvalid(m) => {
                assert!(m.contains("escapes workspace") || m.contains("Symlink escape"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn is_command_allowed_strips_path_and_args() {
        let dir = TempDir::new().unwrap();
        let policy = policy_for(dir.path());
        assert!(policy.is_command_allowed("/usr/bin/ls -la"));
        assert!(!policy.is_command_allowed("rm -rf /"));
        assert!(!policy.is_command_allowed("  "));
    }

    #[test]
    fn expand_path_handles_tilde_and_env_vars() {
        std::env::set_var("GHOSTCLAW_TEST_VAR", "value");
        let expanded = expand_path("$GHOSTCLAW_TEST_VAR/${GHOSTCLAW_TEST_VAR}");
        assert_eq!(expanded, "value/value");
        std::env::remove_var("GHOSTCLAW_TEST_VAR");
    }
}
