use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use sitebackup_core::archive::ArchiveCompression;
use sitebackup_core::config::{DatabaseOverrides, Overrides, S3Override};

#[derive(Parser)]
#[command(
    name = "sitebackup",
    version,
    about = "Back up a website's database and files to local and S3 targets",
    args_conflicts_with_subcommands = true,
    after_help = "\
Configuration file lookup order:
  1. --config <path>                     (explicit flag)
  2. $SITEBACKUP_CONFIG                  (environment variable)
  3. ./sitebackup.yaml                   (project)
  4. ~/.config/sitebackup/config.yaml    (user)
  5. /etc/sitebackup/config.yaml         (system)
No file is required; every setting can be given on the command line.

Thinning strategies (--thinning):
  none                      keep everything (default)
  L<n>                      keep the n most recent archives
  <d>D<w>W<m>M              e.g. 7D4W12M: daily, then weekly, then monthly
  keep-<rule>-<n>,...       keep-last, keep-hourly, keep-daily, keep-weekly,
                            keep-monthly, keep-yearly, keep-within-<dur>
Without --database and --filesystem, a --thinning strategy other than none
thins the existing archives on every target without building a new one.

Exit status is 0 when every target succeeded, 1 otherwise."
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides SITEBACKUP_CONFIG and default search)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub backup: BackupArgs,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Print a starter configuration file
    ConfigTemplate,
}

#[derive(Args)]
pub(crate) struct BackupArgs {
    /// Site root directory
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Include the database dump
    #[arg(short, long)]
    pub database: bool,

    /// Include the site's files
    #[arg(short, long)]
    pub filesystem: bool,

    /// Simulate: build the archive but store and delete nothing
    #[arg(short = 'n', long, alias = "dry-run")]
    pub dry: bool,

    /// Thinning strategy for remote targets
    #[arg(long, value_name = "STRATEGY")]
    pub thinning: Option<String>,

    /// Keep a copy in a local directory (default: the current directory)
    #[arg(long, value_name = "DIR", num_args = 0..=1, default_missing_value = ".")]
    pub attic: Option<String>,

    /// Instance identifier used in archive names
    #[arg(short, long)]
    pub label: Option<String>,

    /// Archive compression (gzip, zstd)
    #[arg(long)]
    pub compression: Option<String>,

    /// Directory for the temporary archive
    #[arg(long, value_name = "DIR")]
    pub scratch_dir: Option<String>,

    /// Database name
    #[arg(long = "db", value_name = "NAME")]
    pub db_name: Option<String>,

    /// Database host, optionally host:port
    #[arg(long = "dbhost", value_name = "HOST")]
    pub db_host: Option<String>,

    #[arg(long = "dbport", value_name = "PORT")]
    pub db_port: Option<u16>,

    #[arg(long = "dbuser", value_name = "USER")]
    pub db_user: Option<String>,

    #[arg(long = "dbpass", value_name = "PASSWORD")]
    pub db_pass: Option<String>,

    /// Only dump tables with this prefix
    #[arg(long = "dbprefix", value_name = "PREFIX")]
    pub db_prefix: Option<String>,

    /// Shell command whose stdout is the database dump
    #[arg(long = "dbcommand", value_name = "COMMAND")]
    pub db_command: Option<String>,

    /// S3 endpoint host or URL
    #[arg(long = "s3", value_name = "HOST")]
    pub s3_host: Option<String>,

    #[arg(long = "s3accesskey", value_name = "KEY", requires = "s3_host")]
    pub s3_access_key: Option<String>,

    #[arg(long = "s3secretkey", value_name = "SECRET", requires = "s3_host")]
    pub s3_secret_key: Option<String>,

    /// Bucket name (default: the instance identifier)
    #[arg(long = "s3bucket", value_name = "BUCKET", requires = "s3_host")]
    pub s3_bucket: Option<String>,

    #[arg(long = "s3region", value_name = "REGION", requires = "s3_host")]
    pub s3_region: Option<String>,

    /// Sender address of the report
    #[arg(long, value_name = "ADDRESS")]
    pub mail_from: Option<String>,

    /// Report recipient (repeatable)
    #[arg(long, value_name = "ADDRESS")]
    pub mail_to: Vec<String>,

    /// Also mail the report to the site's admin address
    #[arg(long)]
    pub mail_to_admin: bool,
}

impl BackupArgs {
    pub(crate) fn to_overrides(&self) -> Result<Overrides, String> {
        let compression = self
            .compression
            .as_deref()
            .map(str::parse::<ArchiveCompression>)
            .transpose()
            .map_err(|e| e.to_string())?;

        let s3 = self.s3_host.as_ref().map(|host| S3Override {
            host: host.clone(),
            access_key: self.s3_access_key.clone(),
            secret_key: self.s3_secret_key.clone(),
            bucket: self.s3_bucket.clone(),
            region: self.s3_region.clone(),
        });

        Ok(Overrides {
            path: self.path.clone(),
            include_database: self.database,
            include_filesystem: self.filesystem,
            dry_run: self.dry,
            label: self.label.clone(),
            thinning: self.thinning.clone(),
            attic: self.attic.clone(),
            compression,
            scratch_dir: self.scratch_dir.clone(),
            database: DatabaseOverrides {
                name: self.db_name.clone(),
                host: self.db_host.clone(),
                port: self.db_port,
                user: self.db_user.clone(),
                password: self.db_pass.clone(),
                prefix: self.db_prefix.clone(),
                command: self.db_command.clone(),
            },
            s3,
            mail_from: self.mail_from.clone(),
            mail_to: self.mail_to.clone(),
            mail_to_admin: self.mail_to_admin,
        })
    }
}
