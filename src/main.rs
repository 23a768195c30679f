use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use notes_guard_lib::data_governance::{NOTES_MIGRATION_SET, NOTES_SCHEMA_VERSION};
use notes_guard_lib::{DatabaseProvider, GuardConfig, MigrationGuard};

const USAGE: &str = "usage: notes-guard [status|reconcile|open] [--json]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Reconcile,
    Open,
}

#[derive(Debug, Serialize)]
struct BackupSummary {
    from: u32,
    to: u32,
    created_at: Option<String>,
    path: String,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    database: String,
    disk_version: Option<u32>,
    target_version: u32,
    backup_dir: String,
    backups: Vec<BackupSummary>,
}

fn parse_args() -> anyhow::Result<(Command, bool)> {
    let mut command = Command::Open;
    let mut json = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "status" => command = Command::Status,
            "reconcile" => command = Command::Reconcile,
            "open" => command = Command::Open,
            "--json" => json = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument '{}'\n{}", other, USAGE),
        }
    }
    Ok((command, json))
}

fn status(cfg: GuardConfig, json: bool) -> anyhow::Result<()> {
    let guard = MigrationGuard::new(cfg, NOTES_SCHEMA_VERSION);
    let report = StatusReport {
        database: guard.config().database_path().display().to_string(),
        disk_version: guard.disk_version().get(),
        target_version: guard.target_version(),
        backup_dir: guard.backups().backup_dir().display().to_string(),
        backups: guard
            .backups()
            .catalog()
            .records()
            .iter()
            .map(|r| BackupSummary {
                from: r.from,
                to: r.to,
                created_at: r.created_at().map(|t| t.to_rfc3339()),
                path: r.path.display().to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let disk = report
        .disk_version
        .map(|v| format!("v{}", v))
        .unwrap_or_else(|| "absent".to_string());
    println!("database:   {}", report.database);
    println!("disk:       {}", disk);
    println!("target:     v{}", report.target_version);
    println!("backups:    {} ({})", report.backups.len(), report.backup_dir);
    for b in &report.backups {
        println!(
            "  v{} -> v{}  {}  {}",
            b.from,
            b.to,
            b.created_at.as_deref().unwrap_or("-"),
            b.path
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let (command, json) = parse_args()?;
    let cfg = GuardConfig::from_env_and_file().context("加载配置失败")?;

    match command {
        Command::Status => status(cfg, json),
        Command::Reconcile => {
            let guard = MigrationGuard::new(cfg, NOTES_SCHEMA_VERSION);
            if !guard.reconcile() {
                anyhow::bail!("数据库版本对账未通过，拒绝继续");
            }
            Ok(())
        }
        Command::Open => {
            let provider = DatabaseProvider::new(cfg, Arc::new(NOTES_MIGRATION_SET));
            let db = provider.acquire().context("打开数据库失败")?;
            let conn = db.get_conn()?;
            let notes: i64 = conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?;
            tracing::info!(
                "[Main] 数据库已就绪: {} (v{}, {} notes)",
                db.db_path().display(),
                provider.target_version(),
                notes
            );
            Ok(())
        }
    }
}
