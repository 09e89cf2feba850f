use std::sync::Arc;
use std::time::Duration;

use ghostclaw_core::security::approval::{
    ApprovalHandler, ApprovalManager, ApprovalPolicy, ApprovalRequest, ApprovalSocketServer,
    ExecAsk, ExecSecurity,
};
use ghostclaw_core::security::sandbox::{
    DockerCommandOptions, DockerProcessResult, DockerRunner, SandboxConfig, SandboxMode,
    SandboxRequest,
};
use ghostclaw_core::security::{
    validate_path, AutonomyLevel, SandboxManager, SecurityPolicy, ToolPolicy, ToolPolicyPipeline,
    ToolPolicyRequest, ToolProfile,
};

#[test]
fn tool_deny_at_global_layer_overrides_profile_allow() {
    let mut pipeline = ToolPolicyPipeline::new();
    pipeline.set_global_policy(ToolPolicy {
        allow: Vec::new(),
        deny: vec!["group:messaging".to_string()],
    });

    let decision = pipeline.evaluate_tool(&ToolPolicyRequest {
        tool_name: "message".to_string(),
        profile: ToolProfile::Messaging,
        ..Default::default()
    });

    assert!(!decision.allowed);
    assert_eq!(decision.blocked_by, "global");
}

#[test]
fn tool_deny_at_group_layer_scopes_to_a_single_channel() {
    let mut pipeline = ToolPolicyPipeline::new();
    pipeline.set_group_policy(
        "channel:ops",
        "channel:ops",
        ToolPolicy {
            allow: Vec::new(),
            deny: vec!["group:automation".to_string()],
        },
    );

    let blocked = pipeline.evaluate_tool(&ToolPolicyRequest {
        tool_name: "cron".to_string(),
        profile: ToolProfile::Full,
        channel_id: "channel:ops".to_string(),
        group_id: "channel:ops".to_string(),
        ..Default::default()
    });
    assert!(!blocked.allowed);

    let allowed = pipeline.evaluate_tool(&ToolPolicyRequest {
        tool_name: "cron".to_string(),
        profile: ToolProfile::Full,
        channel_id: "channel:other".to_string(),
        group_id: "channel:other".to_string(),
        ..Default::default()
    });
    assert!(allowed.allowed);
}

#[test]
fn path_validator_rejects_escape_from_workspace() {
    let dir = tempfile::TempDir::new().unwrap();
    let policy = SecurityPolicy::new(
        AutonomyLevel::Supervised,
        dir.path().to_path_buf(),
        true,
        Vec::new(),
        Vec::new(),
        100,
        0,
        None,
    );

    let escape = validate_path("../../etc/passwd", &policy);
    assert!(escape.is_err());

    let inside = validate_path("notes.txt", &policy);
    assert!(inside.is_ok());
}

#[tokio::test]
async fn allowlist_round_trip_persists_across_manager_instances() {
    let dir = tempfile::TempDir::new().unwrap();
    let store_path = dir.path().join("allowlist.txt");
    let socket_path = dir.path().join("approvals.sock");

    struct AllowAlways;
    impl ApprovalHandler for AllowAlways {
        fn handle(&self, _request: &ApprovalRequest) -> ghostclaw_core::security::ApprovalDecision {
            ghostclaw_core::security::ApprovalDecision::AllowAlways
        }
    }

    let server = ApprovalSocketServer::new(
        &socket_path.to_string_lossy().to_string(),
        Arc::new(AllowAlways),
    );
    server.start().await.unwrap();

    let manager = ApprovalManager::new(
        ApprovalPolicy {
            security: ExecSecurity::Allowlist,
            ask: ExecAsk::Always,
            allowlist: Vec::new(),
        },
        &store_path.to_string_lossy(),
        &socket_path.to_string_lossy(),
    )
    .unwrap();

    let decision = manager
        .authorize(&ApprovalRequest {
            command: "deploy staging".to_string(),
            session_id: "s1".to_string(),
            timeout: Duration::from_secs(2),
        })
        .await
        .unwrap();
    assert_eq!(decision, ghostclaw_core::security::ApprovalDecision::AllowAlways);
    server.stop().await;

    // A fresh manager pointed at the same store should see the persisted entry
    // without needing another round-trip through the socket.
    let reopened = ApprovalManager::new(
        ApprovalPolicy {
            security: ExecSecurity::Allowlist,
            ask: ExecAsk::OnMiss,
            allowlist: Vec::new(),
        },
        &store_path.to_string_lossy(),
        &socket_path.to_string_lossy(),
    )
    .unwrap();
    assert!(reopened.is_allowlisted("deploy staging"));
}

#[tokio::test]
async fn approval_request_denies_on_timeout_with_nothing_listening() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = ApprovalManager::new(
        ApprovalPolicy {
            security: ExecSecurity::Allowlist,
            ask: ExecAsk::Always,
            allowlist: Vec::new(),
        },
        &dir.path().join("allowlist.txt").to_string_lossy(),
        &dir.path().join("missing.sock").to_string_lossy(),
    )
    .unwrap();

    let decision = manager
        .authorize(&ApprovalRequest {
            command: "rm -rf /tmp/scratch".to_string(),
            session_id: "s1".to_string(),
            timeout: Duration::from_millis(250),
        })
        .await
        .unwrap();
    assert_eq!(decision, ghostclaw_core::security::ApprovalDecision::Deny);
}

struct FakeDocker {
    exists: std::sync::Mutex<bool>,
}

impl DockerRunner for FakeDocker {
    fn run(&self, args: &[String], _options: &DockerCommandOptions) -> ghostclaw_core::Result<DockerProcessResult> {
        if args.first().map(String::as_str) == Some("inspect") {
            let exists = *self.exists.lock().unwrap();
            return Ok(DockerProcessResult {
                exit_code: if exists { 0 } else { 1 },
                stdout_text: "false".to_string(),
                stderr_text: String::new(),
            });
        }
        if args.first().map(String::as_str) == Some("create") {
            *self.exists.lock().unwrap() = true;
        }
        Ok(DockerProcessResult::default())
    }
}

#[test]
fn sandbox_lifecycle_creates_once_then_reuses_the_container() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = SandboxConfig {
        mode: SandboxMode::All,
        ..Default::default()
    };
    let docker = Arc::new(FakeDocker {
        exists: std::sync::Mutex::new(false),
    });
    let manager = SandboxManager::new(config, docker);

    let request = SandboxRequest {
        session_id: "sess-a".to_string(),
        workspace_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let first = manager.ensure_runtime(&request).unwrap();
    let second = manager.ensure_runtime(&request).unwrap();
    assert_eq!(first.container_name, second.container_name);
    assert!(first.enabled);

    manager.remove_runtime(&request).unwrap();
}
