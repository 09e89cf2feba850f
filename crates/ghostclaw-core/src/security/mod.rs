pub mod action_tracker;
pub mod approval;
pub mod firewall;
pub mod pairing;
pub mod path_policy;
pub mod sandbox;
pub mod secrets;
pub mod tool_policy;

pub use action_tracker::ActionTracker;
pub use approval::{
    ApprovalDecision, ApprovalHandler, ApprovalManager, ApprovalPolicy, ApprovalRequest,
    ApprovalSocketClient, ApprovalSocketServer, ApprovalStore, ExecAsk, ExecSecurity,
};
pub use firewall::{
    detect_suspicious_patterns, external_source_label, normalize_homoglyphs,
    wrap_external_content, ExternalSource, EXTERNAL_END, EXTERNAL_START,
};
pub use pairing::{constant_time_equals, generate_pairing_code, PairingOutcome, PairingState};
pub use path_policy::{
    autonomy_level_from_str, expand_path, is_subpath, validate_path, AutonomyLevel,
    SecurityPolicy, SYSTEM_FORBIDDEN_PATHS,
};
pub use sandbox::{
    build_docker_create_args, resolve_sandbox_container_name, resolve_sandbox_scope_key,
    DockerCliRunner, DockerCommandOptions, DockerProcessResult, DockerRunner, SandboxConfig,
    SandboxManager, SandboxMode, SandboxRequest, SandboxRuntime, SandboxScope, WorkspaceAccess,
};
pub use secrets::{
    decrypt_config_secrets, decrypt_secret, encrypt_config_secrets, encrypt_secret, generate_key,
    load_or_create_key, ConfigSecrets, SecretKey,
};
pub use tool_policy::{
    ToolPolicy, ToolPolicyDecision, ToolPolicyPipeline, ToolPolicyRequest, ToolProfile,
};
