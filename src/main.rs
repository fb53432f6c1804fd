use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use cert_rotate::config::{self, Config};
use cert_rotate::error::RotationError;
use cert_rotate::observability;
use cert_rotate::rotation::{
    validate_domain, Collaborators, DeclineForce, Operator, RotationOrchestrator, RotationOutcome,
    RotationRequest,
};
use cert_rotate::system;
use cert_rotate::tls::Expiry;

#[derive(Parser)]
#[command(name = "cert-rotate")]
#[command(about = "Rotate the TLS certificate of a managed service with automatic rollback", long_about = None)]
struct Cli {
    /// Config file path (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace the service certificate for a domain
    Rotate {
        /// Fully-qualified domain name the service is reachable under
        domain: String,
        /// Renew even if the current certificate is not near expiry
        #[arg(long)]
        force: bool,
        /// Skip the domain confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show how long the installed certificate remains valid and whether the service runs
    Status { domain: String },
    /// List backups, newest first
    Backups,
    /// Restore a backup and restart the service
    Restore {
        /// Backup id (defaults to the most recent)
        #[arg(long)]
        id: Option<String>,
    },
}

/// Asks on the terminal; declines when stdin is closed
struct TerminalOperator;

impl Operator for TerminalOperator {
    fn confirm_force_renewal(&self, domain: &str, days_remaining: i64) -> bool {
        confirm(&format!(
            "Certificate for {} is still valid for {} days. Force renewal?",
            domain, days_remaining
        ))
    }
}

fn confirm(question: &str) -> bool {
    print!("{} [y/N] ", question);
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => false,
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit with 1, not clap's default of 2
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Malformed arguments fail before any side effect, logging setup included
    if let Commands::Rotate { domain, .. } | Commands::Status { domain } = &cli.command {
        if let Err(e) = validate_domain(domain) {
            eprintln!("Error: {}", e);
            return ExitCode::from(1);
        }
    }

    let config = match &cli.config {
        Some(path) => match config::load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                return ExitCode::from(1);
            }
        },
        None => Config::default(),
    };

    let _guard = match observability::logging::init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(command: Commands, config: &Config) -> Result<ExitCode> {
    match command {
        Commands::Rotate { domain, force, yes } => rotate(config, domain, force, yes).await,
        Commands::Status { domain } => status(config, &domain).await,
        Commands::Backups => list_backups(config),
        Commands::Restore { id } => restore(config, id).await,
    }
}

async fn rotate(config: &Config, domain: String, force: bool, yes: bool) -> Result<ExitCode> {
    let request = match RotationRequest::new(domain, force) {
        Ok(request) => request,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::from(1));
        }
    };

    if config.rotation.require_root && !system::running_as_root() {
        error!("{}", RotationError::Validation("must be run as root".to_string()));
        return Ok(ExitCode::from(1));
    }

    if !yes && !confirm(&format!("Rotate the certificate for {}?", request.domain())) {
        info!(domain = request.domain(), "{}", RotationError::Cancelled);
        return Ok(ExitCode::SUCCESS);
    }

    let operator: Arc<dyn Operator> = if yes {
        Arc::new(DeclineForce)
    } else {
        Arc::new(TerminalOperator)
    };
    let orchestrator = RotationOrchestrator::new(config, Collaborators::system(config, operator));

    info!(domain = request.domain(), force, "Starting certificate rotation");
    let result = orchestrator.rotate(&request).await;

    for warning in &result.warnings {
        warn!("{}", warning);
    }
    match (&result.outcome, &result.reason) {
        (RotationOutcome::Success, _) => info!(
            domain = request.domain(),
            backup_id = ?result.backup_id,
            "Rotation succeeded"
        ),
        (outcome, Some(reason)) => error!(
            domain = request.domain(),
            outcome = ?outcome,
            failed_at = ?result.failed_at,
            "Rotation did not complete: {}",
            reason
        ),
        (outcome, None) => error!(domain = request.domain(), outcome = ?outcome, "Rotation did not complete"),
    }

    let code = u8::try_from(result.exit_code()).unwrap_or(1);
    Ok(ExitCode::from(code))
}

async fn status(config: &Config, domain: &str) -> Result<ExitCode> {
    validate_domain(domain)?;
    let orchestrator = RotationOrchestrator::new(
        config,
        Collaborators::system(config, Arc::new(DeclineForce)),
    );

    match orchestrator.check_expiry(domain) {
        Expiry::NeedsRenewal => println!(
            "{}: renewal due (no valid certificate, or {} days or fewer remaining)",
            domain, config.rotation.threshold_days
        ),
        Expiry::StillValid { days_remaining } => {
            println!("{}: valid for {} more days", domain, days_remaining)
        }
    }
    println!(
        "{}: {:?}",
        config.service.unit,
        orchestrator.service_state().await
    );
    Ok(ExitCode::SUCCESS)
}

fn list_backups(config: &Config) -> Result<ExitCode> {
    let orchestrator = RotationOrchestrator::new(
        config,
        Collaborators::system(config, Arc::new(DeclineForce)),
    );
    let backups = orchestrator
        .backups()
        .list()
        .context("Failed to list backups")?;

    if backups.is_empty() {
        println!("No backups in {}", orchestrator.backups().backup_dir().display());
    }
    for backup in backups {
        println!("{}  {}  {}", backup.id, backup.domain, backup.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

async fn restore(config: &Config, id: Option<String>) -> Result<ExitCode> {
    if config.rotation.require_root && !system::running_as_root() {
        anyhow::bail!("must be run as root");
    }

    let orchestrator = RotationOrchestrator::new(
        config,
        Collaborators::system(config, Arc::new(DeclineForce)),
    );
    let backup = orchestrator
        .restore_and_restart(id.as_deref())
        .await
        .context("Restore failed")?;

    info!(backup_id = %backup.id, "Backup restored");
    Ok(ExitCode::SUCCESS)
}
