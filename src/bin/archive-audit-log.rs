use anyhow::Result;
use clap::{Arg, ArgAction, ArgGroup, Command};
use tracing::info;

use audit_ledger::api::params::ArchiveRequest;
use audit_ledger::audit::AuditLedger;
use audit_ledger::config::AppConfig;
use audit_ledger::database::Database;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("archive-audit-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Move old audit ledger entries into yearly archive partitions")
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .help("Ledger database (defaults to the configured database_url)"),
        )
        .arg(
            Arg::new("before-id")
                .long("before-id")
                .value_name("ID")
                .value_parser(clap::value_parser!(i64))
                .help("Archive entries with id up to and including ID"),
        )
        .arg(
            Arg::new("before-date")
                .long("before-date")
                .value_name("DATE")
                .help("Archive entries created on or before DATE (RFC 3339 or YYYY-MM-DD)"),
        )
        .arg(
            Arg::new("retention-days")
                .long("retention-days")
                .value_name("DAYS")
                .value_parser(clap::value_parser!(i64))
                .help("Archive entries older than DAYS (defaults to archive.retention_days)"),
        )
        .group(ArgGroup::new("cutoff").args(["before-id", "before-date", "retention-days"]))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .get_matches();

    let level = if matches.get_flag("verbose") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = AppConfig::load()?;
    if let Some(url) = matches.get_one::<String>("database-url") {
        config.database_url = url.clone();
    }

    let request = ArchiveRequest {
        before_id: matches.get_one::<i64>("before-id").copied(),
        before_date: matches.get_one::<String>("before-date").cloned(),
        retention_days: matches.get_one::<i64>("retention-days").copied(),
    };

    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;
    let ledger = AuditLedger::open(database, &config).await?;

    let recovered = ledger.partitioner.recover().await?;
    for meta in &recovered {
        println!("Recovered: {}", meta.summary());
    }

    let now = ledger.writer.clock().now();
    let cutoff = request.cutoff(config.archive.retention_days, now)?;
    info!(?cutoff, "Starting archive run");

    let moved = ledger.partitioner.archive_all_up_to(cutoff).await?;
    if moved.is_empty() {
        println!("No entries eligible for archival");
    }
    for meta in &moved {
        println!("Archived: {}", meta.summary());
    }

    Ok(())
}
