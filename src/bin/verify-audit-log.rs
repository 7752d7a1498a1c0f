use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, ArgGroup, Command};
use std::path::Path;
use tracing::{error, info};

use audit_ledger::audit::{verify_snapshot, AuditLedger, ExportSnapshot, VerificationResult};
use audit_ledger::config::AppConfig;
use audit_ledger::database::Database;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("verify-audit-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify audit ledger hash chain integrity")
        .arg(
            Arg::new("snapshot")
                .short('s')
                .long("snapshot")
                .value_name("PATH")
                .help("Exported snapshot file to verify offline"),
        )
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .help("Ledger database to verify"),
        )
        .group(
            ArgGroup::new("source")
                .args(["snapshot", "database-url"])
                .required(true),
        )
        .arg(
            Arg::new("start-id")
                .long("start-id")
                .value_name("ID")
                .value_parser(clap::value_parser!(i64))
                .requires("database-url")
                .help("First entry to verify (defaults to the first entry)"),
        )
        .arg(
            Arg::new("end-id")
                .long("end-id")
                .value_name("ID")
                .value_parser(clap::value_parser!(i64))
                .requires("database-url")
                .help("Last entry to verify (defaults to the last entry)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .conflicts_with("verbose")
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    // Set log level based on flags
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let result = if let Some(path) = matches.get_one::<String>("snapshot") {
        verify_snapshot_file(path, verbose)?
    } else if let Some(url) = matches.get_one::<String>("database-url") {
        let start_id = matches.get_one::<i64>("start-id").copied();
        let end_id = matches.get_one::<i64>("end-id").copied();
        verify_database(url, start_id, end_id).await?
    } else {
        return Err(anyhow!("Either --snapshot or --database-url is required"));
    };

    if verbose {
        println!("{}", result.detailed_status());
    }

    if !result.valid {
        error!("{}", result.message);
        if !quiet {
            println!("{}", result.summary());
        }
        std::process::exit(1);
    }

    if !quiet {
        println!("{}", result.summary());
    }

    Ok(())
}

fn verify_snapshot_file(path: &str, verbose: bool) -> Result<VerificationResult> {
    info!("Verifying exported snapshot: {}", path);

    if !Path::new(path).exists() {
        return Err(anyhow!("Snapshot file not found: {}", path));
    }

    let raw = std::fs::read_to_string(path)?;
    let snapshot: ExportSnapshot = serde_json::from_str(&raw)?;

    if verbose {
        println!("Export {} by {}", snapshot.export_id, snapshot.exported_by.id);
        println!("  Exported at: {}", snapshot.export_date);
        println!("  Records: {}", snapshot.total_records);
        println!("  Protocol: {}", snapshot.protocol);
        if let Some(preceding) = &snapshot.preceding_digest {
            println!("  Preceding digest: {}", preceding);
        }
    }

    Ok(verify_snapshot(&snapshot)?)
}

async fn verify_database(url: &str, start_id: Option<i64>, end_id: Option<i64>) -> Result<VerificationResult> {
    info!("Verifying ledger database: {}", url);

    let config = AppConfig {
        database_url: url.to_string(),
        ..AppConfig::default()
    };
    let database = Database::open_read_only(&config.database_url).await?;
    let ledger = AuditLedger::open(database, &config).await?;

    Ok(ledger.verifier.verify_range(start_id, end_id).await?)
}
