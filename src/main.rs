use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDateTime, TimeZone};
use clap::{Parser, Subcommand};

use virtbak::backup::CompleteBackup;
use virtbak::core::config::{self, Config, GroupConfig};
use virtbak::core::error::Error;
use virtbak::groups::{BackupGroup, CompleteBackupGroup};
use virtbak::hypervisor::{self, VirtConnection};
use virtbak::snapshot::BlockJobRegistrar;
use virtbak::{CancelToken, logging};

#[derive(Parser)]
#[command(
    name = "virtbak",
    version,
    about = "Backup and restore live libvirt-managed VM disk images"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the given groups (all autostart groups when none named)
    Backup { groups: Vec<String> },
    /// Restore a backup of a domain into a directory
    Restore {
        group: String,
        domain: String,
        /// Backup date "YYYY-MM-DD HH:MM:SS" (local); latest when omitted
        #[arg(long)]
        date: Option<String>,
        target_dir: PathBuf,
    },
    /// Apply retention to the given groups and clean broken backups
    Clean {
        /// Only clean broken backups
        #[arg(long, conflicts_with = "no_broken")]
        broken_only: bool,
        /// Keep broken backups untouched
        #[arg(long)]
        no_broken: bool,
        groups: Vec<String>,
    },
    /// List stored backups per group and domain
    List {
        /// Also list broken backups
        #[arg(long)]
        all: bool,
        /// Only print backup counts
        #[arg(long)]
        short: bool,
        /// Limit the listing to these domains
        #[arg(short = 'D', long = "domain")]
        domains: Vec<String>,
        groups: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("virtbak: {e:#}");
            return ExitCode::from(1);
        }
    };
    logging::init(cli.debug || config.debug);

    let result = match cli.command {
        Commands::Backup { ref groups } => cmd_backup(&config, groups),
        Commands::Restore {
            ref group,
            ref domain,
            ref date,
            ref target_dir,
        } => cmd_restore(&config, group, domain, date.as_deref(), target_dir),
        Commands::Clean {
            broken_only,
            no_broken,
            ref groups,
        } => cmd_clean(&config, groups, broken_only, no_broken),
        Commands::List {
            all,
            short,
            ref domains,
            ref groups,
        } => cmd_list(&config, groups, domains, all, short),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("virtbak: {e:#}");
            match e.downcast_ref::<Error>() {
                Some(Error::BackupsFailureInGroup(_)) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let path = match custom_path {
        Some(path) => path.to_path_buf(),
        None => config::find_config().with_context(|| {
            format!(
                "no configuration file found; create {} in one of: {}",
                config::CONFIG_FILENAME,
                config::default_config_paths()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })?,
    };

    let (config, warnings) = Config::load(&path)
        .with_context(|| format!("cannot load configuration from {}", path.display()))?;
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    Ok(config)
}

/// Groups selected on the command line, or every group when none was named.
/// Naming an unknown group is an error.
fn selected_groups<'a>(
    config: &'a Config,
    names: &[String],
) -> Result<Vec<(&'a String, &'a GroupConfig)>> {
    if names.is_empty() {
        return Ok(config.groups.iter().collect());
    }
    let mut selected = Vec::new();
    for name in names {
        match config.groups.get_key_value(name) {
            Some(group) => selected.push(group),
            None => bail!("group {name:?} is not configured"),
        }
    }
    Ok(selected)
}

fn connect(config: &Config) -> Result<Arc<dyn VirtConnection>> {
    let uri = config
        .uri
        .as_deref()
        .context("no hypervisor uri configured")?;
    Ok(hypervisor::connect(uri)?)
}

fn cmd_backup(config: &Config, group_names: &[String]) -> Result<()> {
    let conn = connect(config)?;
    let event_loop = conn.start_event_loop()?;
    let registrar = BlockJobRegistrar::new(conn.clone());
    registrar.open()?;

    let mut groups = Vec::new();
    for (name, group_config) in selected_groups(config, group_names)? {
        let group = BackupGroup::from_config(name, group_config, conn.clone(), registrar.clone())?;
        // unnamed invocations only run autostart groups
        if group_names.is_empty() && !group.autostart {
            continue;
        }
        groups.push(group);
    }

    let tokens: Vec<CancelToken> = groups.iter().flat_map(|g| g.cancel_tokens()).collect();
    ctrlc::set_handler(move || {
        eprintln!("virtbak: cancelling, waiting for running backups to stop");
        for token in &tokens {
            token.cancel();
        }
    })
    .context("cannot install the interrupt handler")?;

    let threads = config.threads.unwrap_or(1);
    let mut first_failure: Option<Error> = None;
    for mut group in groups {
        println!("[virtbak] Starting backup group {}", group.name);
        group.propagate_defaults();
        let result = if threads > 1 {
            group.start_multithread(threads)
        } else {
            group.start()
        };
        if let Err(e) = result {
            eprintln!("virtbak: group {} failed: {e}", group.name);
            first_failure.get_or_insert(e);
        }
    }

    registrar.close()?;
    event_loop.stop();

    match first_failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn complete_group(
    name: &str,
    group_config: &GroupConfig,
    conn: Option<Arc<dyn VirtConnection>>,
    registrar: Option<Arc<BlockJobRegistrar>>,
) -> Result<CompleteBackupGroup> {
    let backup_dir = group_config
        .target
        .as_deref()
        .with_context(|| format!("group {name:?} has no target directory"))?;
    let mut group = CompleteBackupGroup::new(
        name,
        backup_dir,
        group_config.host_patterns(),
        conn,
        registrar,
    );
    group.scan()?;
    Ok(group)
}

fn parse_backup_date(date: &str) -> Result<i64> {
    let parsed = NaiveDateTime::parse_from_str(date, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S"))
        .with_context(|| format!("cannot parse date {date:?}"))?;
    Local
        .from_local_datetime(&parsed)
        .single()
        .map(|d| d.timestamp())
        .with_context(|| format!("ambiguous local date {date:?}"))
}

fn cmd_restore(
    config: &Config,
    group_name: &str,
    domain: &str,
    date: Option<&str>,
    target_dir: &Path,
) -> Result<()> {
    let group_config = config
        .groups
        .get(group_name)
        .with_context(|| format!("group {group_name:?} is not configured"))?;
    let group = complete_group(group_name, group_config, None, None)?;

    let backup: &CompleteBackup = match date {
        Some(date) => group.get_backup_at_date(domain, parse_backup_date(date)?)?,
        None => group
            .backups
            .get(domain)
            .and_then(|backups| backups.last())
            .ok_or_else(|| Error::DomainNotFound(domain.to_string()))?,
    };

    println!(
        "[virtbak] Restoring backup {} of domain {} to {}",
        backup.name,
        domain,
        target_dir.display()
    );
    backup.restore_to(target_dir, &CancelToken::new())?;
    println!("[virtbak] Restore complete.");
    Ok(())
}

fn cmd_clean(
    config: &Config,
    group_names: &[String],
    broken_only: bool,
    no_broken: bool,
) -> Result<()> {
    // broken backups need the hypervisor; retention alone does not
    let conn = if no_broken { None } else { connect(config).ok() };
    let registrar = conn.clone().map(BlockJobRegistrar::new);
    if let Some(registrar) = &registrar {
        registrar.open()?;
    }
    if conn.is_none() && !no_broken {
        tracing::warn!("no hypervisor connection, broken backups are left untouched");
    }

    let cancel = CancelToken::new();
    for (name, group_config) in selected_groups(config, group_names)? {
        let mut group = complete_group(name, group_config, conn.clone(), registrar.clone())?;

        if !no_broken && conn.is_some() {
            let cleaned = group.clean_broken_backups()?;
            if !cleaned.is_empty() {
                println!(
                    "[virtbak] Group {name}: cleaned {} broken backup(s)",
                    cleaned.len()
                );
            }
        }
        if !broken_only {
            let removed = group.clean(&group_config.retention_policy(), &cancel)?;
            println!(
                "[virtbak] Group {name}: removed {} expired backup(s)",
                removed.len()
            );
        }
    }

    if let Some(registrar) = &registrar {
        registrar.close()?;
    }
    Ok(())
}

fn cmd_list(
    config: &Config,
    group_names: &[String],
    domains: &[String],
    all: bool,
    short: bool,
) -> Result<()> {
    // broken backups are only visible with a hypervisor at hand
    let conn = if all { connect(config).ok() } else { None };
    let registrar = conn.clone().map(BlockJobRegistrar::new);
    if let Some(registrar) = &registrar {
        registrar.open()?;
    }

    for (name, group_config) in selected_groups(config, group_names)? {
        let group = complete_group(name, group_config, conn.clone(), registrar.clone())?;
        println!(" {name}");
        println!("=========================");

        for (domain, backups) in &group.backups {
            if !domains.is_empty() && !domains.contains(domain) {
                continue;
            }
            let broken = group
                .broken_backups
                .get(domain)
                .map(Vec::len)
                .unwrap_or(0);
            if all && broken > 0 {
                println!("{domain}: {} backup(s), {broken} broken", backups.len());
            } else {
                println!("{domain}: {} backup(s)", backups.len());
            }
            if short {
                continue;
            }
            for backup in backups.iter().rev() {
                let date = backup
                    .date_time()
                    .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|_| backup.date.to_string());
                println!("\t{date}: {}", backup.name);
            }
        }
        println!();
    }

    if let Some(registrar) = &registrar {
        registrar.close()?;
    }
    Ok(())
}
