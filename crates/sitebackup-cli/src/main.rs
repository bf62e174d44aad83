mod cli;
mod signal;
mod summary;
mod table;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sitebackup_core::config::{self, BackupConfig, FileConfig};
use sitebackup_core::mail::Sendmail;
use sitebackup_core::report::Reporter;
use sitebackup_core::run::BackupRun;

use cli::{Cli, Commands};
use table::CliTableTheme;

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn,sitebackup=info,sitebackup_core=info,sitebackup_storage=info",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if let Some(Commands::ConfigTemplate) = &cli.command {
        print!("{}", config::minimal_config_template());
        return;
    }

    std::process::exit(run_backup(&cli));
}

fn load_file_config(cli: &Cli) -> Result<FileConfig, String> {
    match config::resolve_config_path(cli.config.as_deref()) {
        Some(source) => {
            tracing::info!("Using config: {source}");
            config::load_config(source.path()).map_err(|e| e.to_string())
        }
        None => {
            tracing::debug!("no configuration file found; using command-line values only");
            Ok(FileConfig::default())
        }
    }
}

/// Resolve configuration, run one backup and return the process exit code.
fn run_backup(cli: &Cli) -> i32 {
    let resolved = load_file_config(cli).and_then(|file| {
        let overrides = cli.backup.to_overrides()?;
        BackupConfig::resolve(file, overrides).map_err(|e| e.to_string())
    });
    let config = match resolved {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };

    if config.target_names().is_empty() {
        tracing::warn!("no targets configured (use --attic or --s3); the archive will be discarded");
    }

    let reporter = match &config.mail {
        Some(mail) => Reporter::with_mail(
            mail.clone(),
            Box::new(Sendmail::new(mail.sendmail.clone())),
        ),
        None => Reporter::new(),
    };

    let run = match BackupRun::from_config(&config) {
        Ok(run) => run,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };

    signal::install_signal_handlers();
    let report = run
        .with_abort_flag(&signal::SHUTDOWN)
        .execute(&reporter, chrono::Utc::now());

    if let Some(fatal) = &report.fatal {
        eprintln!("Error: {fatal}");
    }
    if !cli.quiet {
        print!("{}", summary::render_summary(&report, CliTableTheme::detect()));
        if cli.verbose > 0 {
            println!();
            print!("{}", Reporter::format(&report).body);
        }
    }

    report.exit_code()
}
