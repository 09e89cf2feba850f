use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ghostclaw_core::config::AppConfig;
use ghostclaw_core::security::approval::{ApprovalHandler, ApprovalSocketServer};
use ghostclaw_core::security::{
    generate_key, generate_pairing_code, load_or_create_key, ApprovalDecision, ApprovalRequest,
    PairingState, ToolPolicyPipeline, ToolPolicyRequest, ToolProfile,
};

#[derive(Parser)]
#[command(name = "ghostclaw", version, about = "GhostClaw security core exercise CLI")]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, default_value = "ghostclaw.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mint a fresh 6-digit pairing code and exercise the verify flow interactively.
    Pair,
    /// Secret-store maintenance.
    Secrets {
        #[command(subcommand)]
        command: SecretsCommand,
    },
    /// Evaluate the tool policy pipeline against a single tool name.
    Policy {
        /// Tool name to check, e.g. "read" or "group:messaging".
        tool: String,
        #[arg(long, default_value = "full")]
        profile: String,
    },
    /// Approval engine maintenance.
    Approve {
        #[command(subcommand)]
        command: ApproveCommand,
    },
}

#[derive(Subcommand)]
enum SecretsCommand {
    /// Generate (or load, if one already exists) the secret-store encryption key.
    GenerateKey {
        #[arg(long, default_value = "~/.ghostclaw/secrets.key")]
        path: String,
    },
}

#[derive(Subcommand)]
enum ApproveCommand {
    /// Run an approval socket server that prompts on stdin for each request.
    Serve {
        #[arg(long, default_value = "~/.ghostclaw/approvals.sock")]
        socket: String,
    },
}

struct StdinApprovalHandler;

impl ApprovalHandler for StdinApprovalHandler {
    fn handle(&self, request: &ApprovalRequest) -> ApprovalDecision {
        print!(
            "approve `{}` (session {})? [y/N/a=always] ",
            request.command, request.session_id
        );
        let _ = io::stdout().flush();

        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            return ApprovalDecision::Deny;
        }

        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => ApprovalDecision::AllowOnce,
            "a" | "always" => ApprovalDecision::AllowAlways,
            _ => ApprovalDecision::Deny,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> ghostclaw_core::Result<()> {
    match cli.command {
        Command::Pair => cmd_pair(),
        Command::Secrets { command } => match command {
            SecretsCommand::GenerateKey { path } => cmd_generate_key(&path),
        },
        Command::Policy { tool, profile } => cmd_policy(&tool, &profile),
        Command::Approve { command } => match command {
            ApproveCommand::Serve { socket } => cmd_approve_serve(&socket).await,
        },
    }
}

fn cmd_pair() -> ghostclaw_core::Result<()> {
    let code = generate_pairing_code();
    let mut state = PairingState::new(code.clone(), 5);
    println!("pairing code: {code}");
    print!("enter the code to confirm pairing: ");
    io::stdout().flush().ok();

    let mut input = String::new();
    io::stdin().read_line(&mut input).ok();

    match state.verify(input.trim()) {
        ghostclaw_core::security::PairingOutcome::Success { bearer_token } => {
            println!("paired. bearer token: {bearer_token}");
        }
        ghostclaw_core::security::PairingOutcome::Failed => {
            warn!("pairing code did not match");
        }
        ghostclaw_core::security::PairingOutcome::LockedOut { retry_after_seconds } => {
            warn!(retry_after_seconds, "pairing locked out");
        }
    }
    Ok(())
}

fn cmd_generate_key(path: &str) -> ghostclaw_core::Result<()> {
    let expanded = ghostclaw_core::security::expand_path(path);
    let key_path = PathBuf::from(expanded);
    let _key = load_or_create_key(&key_path)?;
    info!(path = %key_path.display(), "secret-store key ready");
    let _fresh = generate_key();
    Ok(())
}

fn cmd_policy(tool: &str, profile: &str) -> ghostclaw_core::Result<()> {
    let config = AppConfig::default();
    let mut pipeline = ToolPolicyPipeline::new();
    pipeline.set_global_policy(ghostclaw_core::security::ToolPolicy {
        allow: config.sandbox.tool_allow.clone(),
        deny: config.sandbox.tool_deny.clone(),
    });

    let profile = match profile.to_lowercase().as_str() {
        "minimal" => ToolProfile::Minimal,
        "coding" => ToolProfile::Coding,
        "messaging" => ToolProfile::Messaging,
        _ => ToolProfile::Full,
    };

    let decision = pipeline.evaluate_tool(&ToolPolicyRequest {
        tool_name: tool.to_string(),
        profile,
        ..Default::default()
    });

    println!("allowed: {}", decision.allowed);
    if !decision.allowed {
        println!("blocked by: {}", decision.blocked_by);
        println!("reason: {}", decision.reason);
    }
    for step in &decision.trace {
        println!("trace: {step}");
    }
    Ok(())
}

async fn cmd_approve_serve(socket: &str) -> ghostclaw_core::Result<()> {
    let server = ApprovalSocketServer::new(socket, Arc::new(StdinApprovalHandler));
    server.start().await?;
    info!(socket, "approval socket server listening, ctrl-c to stop");

    tokio::signal::ctrl_c().await.ok();
    server.stop().await;
    Ok(())
}
