use clap::{Parser, Subcommand};
use tracing::info;

use crate::orchestrator::CycleOutcome;
use crate::output;

#[derive(Parser)]
#[command(
    name = "forkloop",
    version = env!("CARGO_PKG_VERSION"),
    about = "Forkloop - fork exploration, evaluation and selection loop"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one fork cycle (default)
    Run {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show cooldown, lease and current directive
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List recent audit records, newest first
    Audit {
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: i64,
    },
    /// Print the effective policy
    Policy,
}

pub async fn dispatch(cmd: Commands) -> anyhow::Result<()> {
    let app = crate::App::from_env().await?;

    match cmd {
        Commands::Run { json } => {
            let outcome = app.orchestrator.run_cycle(chrono::Utc::now()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }
            match outcome {
                CycleOutcome::Completed(report) => {
                    output::print_run_report(&report, app.orchestrator.policy());
                }
                CycleOutcome::Rejected(rejection) => output::print_rejection(&rejection),
            }
            Ok(())
        }
        Commands::Status { json } => {
            let status = app.orchestrator.status(chrono::Utc::now()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                output::print_status(&status);
            }
            Ok(())
        }
        Commands::Audit { limit } => {
            if !(1..=1000).contains(&limit) {
                anyhow::bail!("--limit must be between 1 and 1000 (got {})", limit);
            }
            info!(limit, "📜 Querying audit log");
            let entries = crate::db::query_audit_logs(&app.pool, limit).await?;
            output::print_audit_table(&entries);
            Ok(())
        }
        Commands::Policy => {
            output::print_policy(app.orchestrator.policy());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["forkloop", "run", "--json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run { json: true })));

        let cli = Cli::try_parse_from(["forkloop", "audit", "-n", "5"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Audit { limit: 5 })));

        let cli = Cli::try_parse_from(["forkloop"]).unwrap();
        assert!(cli.command.is_none());
    }
}
