use std::env;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use vault_ledger::clock::SystemClock;
use vault_ledger::csv::{read_commands, write_vaults};
use vault_ledger::signals::StaticSignals;
use vault_ledger::store::{LedgerStore, MemoryStore, SqliteStore};
use vault_ledger::{Collaborators, LedgerConfig, Treasury};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::WARN.into()))
        .with_writer(io::stderr)
        .init();

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: vault-ledger <commands.csv> [ledger.sqlite]");
        eprintln!("set LEDGER_CONFIG to load settings from a TOML file");
        return ExitCode::from(2);
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let loaded = match env::var("LEDGER_CONFIG") {
        Ok(file) => LedgerConfig::from_file(&file).and_then(LedgerConfig::with_env),
        Err(_) => LedgerConfig::from_env(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(db) = env::args().nth(2) {
        config.store.path = Some(db.into());
    }

    let store: Arc<dyn LedgerStore> = match &config.store.path {
        Some(db) => match SqliteStore::open(db) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(path = %db.display(), "{e}");
                return ExitCode::FAILURE;
            }
        },
        None => Arc::new(MemoryStore::new()),
    };

    let commands = match read_commands(path) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let treasury = Treasury::new(
        config,
        store,
        Arc::new(SystemClock),
        Collaborators::from_static(Arc::new(StaticSignals::permissive())),
    );
    match treasury.resume_stalled_payouts() {
        Ok(0) => {}
        Ok(stalled) => warn!(stalled, "resumed payouts left in REQUESTED"),
        Err(e) => warn!(reason = %e, "could not resume stalled payouts"),
    }

    let (command_sender, command_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if command_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    treasury.run(ReceiverStream::new(command_receiver)).await;

    match treasury.run_reconciliation(None) {
        Ok(report) if !report.is_clean() => {
            error!(violations = report.violations.len(), "ledger failed reconciliation");
        }
        Ok(_) => {}
        Err(e) => warn!(reason = %e, "reconciliation could not run"),
    }

    let vaults = match treasury.vaults() {
        Ok(vaults) => vaults,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = write_vaults(&vaults, io::stdout().lock()) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
