use std::env;
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::time::Duration;

use mbox_desk_core::{
    Classifier, Config, Database, FreshdeskClient, ImportEngine, MboxSource, ProgressStore,
    RetryingClient, RunReport, init_telemetry, migrations,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const USAGE: &str = "usage: mbox-desk [run] [--purge | --keep]

Imports an mbox archive into Freshdesk tickets, resuming where the last run stopped.

  --purge   forget recorded progress and import everything again
  --keep    keep recorded progress without asking

Configuration is read from $CONFIG_PATH (default: mbox-desk.toml).";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PurgeChoice {
    Purge,
    Keep,
    Ask,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run(PurgeChoice),
    Help,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let command = match parse_args(env::args().skip(1)) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{message}\n\n{USAGE}");
            return Ok(ExitCode::from(2));
        }
    };
    let choice = match command {
        Command::Help => {
            println!("{USAGE}");
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run(choice) => choice,
    };

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "mbox-desk.toml".to_string());
    let config = Config::load(&config_path)?;
    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let shutdown = CancellationToken::new();
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.freshdesk.request_timeout_secs))
        .user_agent(concat!("mbox-desk/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let mut freshdesk = FreshdeskClient::new(
        http,
        &config.freshdesk.domain,
        config.freshdesk.api_key.clone(),
    )
    .with_ticket_defaults(config.freshdesk.ticket_status, config.freshdesk.ticket_priority);
    if let Some(base) = &config.freshdesk.api_base {
        freshdesk = freshdesk.with_api_base(base.clone());
    }
    let client = RetryingClient::new(freshdesk, config.retry.policy())
        .with_cancellation(shutdown.clone());

    let source = MboxSource::open(&config.paths.mbox)?;
    let classifier = Classifier::new(&config.import.spam_labels, &config.import.trash_labels);
    let engine = ImportEngine::new(
        client,
        source,
        ProgressStore::new(db),
        classifier,
        config.import.settings(),
    )
    .with_cancellation(shutdown.clone());

    let purge = match choice {
        PurgeChoice::Purge => true,
        PurgeChoice::Keep => false,
        PurgeChoice::Ask => prompt_purge(&mut io::stdin().lock(), &mut io::stdout())?,
    };
    if purge {
        let removed = engine.purge().await?;
        println!("Progress database purged ({removed} threads forgotten).");
    }

    info!(mbox = %config.paths.mbox.display(), "import starting");
    tokio::spawn(shutdown_signal(shutdown.clone()));
    let report = engine.run().await?;
    print_summary(&report);

    if report.cancelled {
        println!("Interrupted, progress saved. Re-run to resume.");
        return Ok(ExitCode::FAILURE);
    }
    if !report.is_clean() {
        println!("Some threads failed; re-run to retry them.");
        return Ok(ExitCode::FAILURE);
    }
    if report.completed == 0 {
        println!("Nothing new to import.");
    } else {
        println!("Import complete without duplicates.");
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_args<I>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = String>,
{
    let mut choice = PurgeChoice::Ask;
    let mut seen_command = false;
    for arg in args {
        match arg.as_str() {
            "-h" | "--help" | "help" => return Ok(Command::Help),
            "run" if !seen_command => seen_command = true,
            "--purge" | "--keep" if choice != PurgeChoice::Ask => {
                return Err("--purge and --keep can only be given once".to_string());
            }
            "--purge" => choice = PurgeChoice::Purge,
            "--keep" => choice = PurgeChoice::Keep,
            other => return Err(format!("unexpected argument: {other}")),
        }
    }
    Ok(Command::Run(choice))
}

fn prompt_purge(input: &mut impl BufRead, output: &mut impl Write) -> io::Result<bool> {
    write!(output, "Purge progress database? [y/N]: ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_summary(report: &RunReport) {
    println!(
        "{} messages read ({} malformed, {} duplicates), skipped {} spam, {} trash, {} auto-responses",
        report.messages_seen,
        report.malformed,
        report.duplicates,
        report.skipped_spam,
        report.skipped_trash,
        report.skipped_auto_response,
    );
    println!(
        "{} threads: {} imported, {} already done, {} failed ({} tickets, {} replies created)",
        report.threads_total,
        report.completed,
        report.already_complete,
        report.failed(),
        report.tickets_created,
        report.replies_appended,
    );
    for failure in &report.failures {
        println!(
            "  thread {} failed while {}: {}",
            failure.thread_id, failure.during, failure.reason
        );
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, stopping after the current step");
        }
        _ = terminate => {
            warn!("received terminate signal, stopping after the current step");
        }
    }

    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_run_flags() {
        assert_eq!(parse_args(args(&[])), Ok(Command::Run(PurgeChoice::Ask)));
        assert_eq!(parse_args(args(&["run"])), Ok(Command::Run(PurgeChoice::Ask)));
        assert_eq!(
            parse_args(args(&["run", "--purge"])),
            Ok(Command::Run(PurgeChoice::Purge))
        );
        assert_eq!(parse_args(args(&["--keep"])), Ok(Command::Run(PurgeChoice::Keep)));
        assert_eq!(parse_args(args(&["--help"])), Ok(Command::Help));
    }

    #[test]
    fn rejects_conflicting_or_unknown_arguments() {
        assert!(parse_args(args(&["--purge", "--keep"])).is_err());
        assert!(parse_args(args(&["run", "run"])).is_err());
        assert!(parse_args(args(&["--force"])).is_err());
    }

    #[test]
    fn purge_prompt_defaults_to_no() {
        let mut output = Vec::new();
        assert!(prompt_purge(&mut "y\n".as_bytes(), &mut output).expect("prompt"));
        assert!(prompt_purge(&mut "YES\n".as_bytes(), &mut output).expect("prompt"));
        assert!(!prompt_purge(&mut "\n".as_bytes(), &mut output).expect("prompt"));
        assert!(!prompt_purge(&mut "".as_bytes(), &mut output).expect("prompt"));
        assert!(!prompt_purge(&mut "nope\n".as_bytes(), &mut output).expect("prompt"));

        let shown = String::from_utf8(output).expect("utf8");
        assert!(shown.starts_with("Purge progress database? [y/N]: "));
    }
}
