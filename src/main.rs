use clap::Parser;
use hardlink_backup::config::{system_host_name, FileConfig, Overrides, SessionConfig};
use hardlink_backup::error::exit;
use hardlink_backup::filter::FilterRules;
use hardlink_backup::providers::Provider;
use hardlink_backup::session::{Session, StdinConfirm};
use hardlink_backup::sink::{LogSink, SyslogSink, TracingSink};
use hardlink_backup::transfer::{find_ionice, ProcessEngine};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hardlink-backup")]
#[command(about = "Incremental hard-link chained system backups over rsync")]
#[command(version)]
struct Cli {
    /// Directory holding the backup generations (local, or on --remote-host)
    destination: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Back up to this host over ssh
    #[arg(short = 'r', long)]
    remote_host: Option<String>,

    /// User to log in as on the remote host
    #[arg(short = 'u', long, requires = "remote_host")]
    remote_user: Option<String>,

    /// ssh port on the remote host
    #[arg(short, long, requires = "remote_host")]
    port: Option<u16>,

    /// Name the generations after this host instead of the system host name
    #[arg(long)]
    host_name: Option<String>,

    /// Previous generation to hard-link against, instead of detecting it
    #[arg(long)]
    prior: Option<PathBuf>,

    /// Update today's generation without asking if it already exists
    #[arg(short = 'y', long)]
    yes: bool,

    /// Let rsync report what it would do without changing anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Skip files larger than this (rsync size syntax, e.g. 2G)
    #[arg(short = 's', long)]
    max_size: Option<String>,

    /// Exit non-zero when rsync reports a failure
    #[arg(long)]
    strict: bool,

    /// Log to stderr only, not to syslog
    #[arg(long)]
    no_syslog: bool,

    /// Print the filter rules and exit
    #[arg(long)]
    print_rules: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            destination: self.destination.clone(),
            host_name: self.host_name.clone(),
            remote_host: self.remote_host.clone(),
            remote_user: self.remote_user.clone(),
            port: self.port,
            prior: self.prior.clone(),
            assume_yes: self.yes,
            dry_run: self.dry_run,
            max_size: self.max_size.clone(),
            strict: self.strict,
            no_syslog: self.no_syslog,
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("hardlink_backup={level}")))
        .unwrap_or_else(|_| EnvFilter::new("hardlink_backup=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> i32 {
    let file = match &cli.config {
        Some(path) => match FileConfig::load(path) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("{e:#}");
                return exit::CONFIG;
            }
        },
        None => FileConfig::default(),
    };

    if cli.print_rules {
        return match file.extra_rules() {
            Ok(extra) => {
                print!("{}", FilterRules::with_extra(extra).render());
                exit::OK
            }
            Err(e) => {
                eprintln!("{e:#}");
                exit::CONFIG
            }
        };
    }

    let config = match SessionConfig::merge(file, cli.overrides(), system_host_name) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return exit::CONFIG;
        }
    };

    init_tracing(&config.log_level);

    let sink: Box<dyn LogSink> = if config.syslog {
        match SyslogSink::new(&config.log_tag) {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                error!("{}", e);
                return e.exit_code();
            }
        }
    } else {
        Box::new(TracingSink)
    };

    let provider = Provider::for_destination(config.remote.as_ref());
    let ionice = if config.ionice { find_ionice() } else { None };

    let session = Session::new(
        &config,
        &provider,
        &ProcessEngine,
        &StdinConfirm,
        sink.as_ref(),
    )
    .ionice(ionice);

    match session.run().await {
        Ok(report) => {
            info!(
                "Session finished: {} (rsync status {:?}, rules in {})",
                report.today.display(),
                report.outcome.code,
                report.rules_file.display()
            );
            exit::OK
        }
        Err(e) => e.exit_code(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let code = run(cli).await;
    process::exit(code);
}
