// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Args as ClapArgs;
use clap::Parser;
use clap::Subcommand;
use dump_offload::bus::InMemoryBus;
use dump_offload::classify_dump;
use dump_offload::read_host_eid;
use dump_offload::CompletionStatus;
use dump_offload::DumpCategory;
use dump_offload::DumpEntry;
use dump_offload::DumpNotifier;
use dump_offload::Eid;
use dump_offload::HostWatches;
use dump_offload::NotifierConfig;
use dump_offload::Notify;
use dump_offload::OffloadCoordinator;
use dump_offload::OffloadService;
use dump_offload::Shutdown;
use dump_offload::DEFAULT_HOST_EID_PATH;
use slog::info;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use slog_async::AsyncGuard;
use std::convert::Infallible;
use std::fs::File;
use std::mem;
use std::path::Path;
use std::path::PathBuf;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;

mod dry_run;
mod scenario;

use dry_run::DryRunTransport;
use dry_run::LocalInstanceDb;
use scenario::Scenario;

/// Depth of the queue between the stdin script and the offload service.
const EVENT_QUEUE_DEPTH: usize = 32;

/// Command line program that offloads dumps to a host over PLDM.
#[derive(Parser, Debug)]
struct Args {
    #[clap(
        short,
        long,
        default_value = "info",
        value_parser = level_from_str,
        help = "Log level: {off,critical,error,warn,info,debug,trace}",
    )]
    log_level: Level,

    /// Write logs to a file instead of stderr.
    #[clap(long)]
    logfile: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

fn level_from_str(s: &str) -> Result<Level> {
    if let Ok(level) = s.parse() {
        Ok(level)
    } else {
        bail!(format!("Invalid log level: {}", s))
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print the file type advertised to the host for a dump.
    Classify {
        #[clap(long)]
        category: DumpCategory,
        #[clap(value_parser = parse_int::parse::<u32>)]
        id: u32,
    },

    /// Send a single "new file available" notification.
    Notify {
        #[clap(long)]
        category: DumpCategory,
        /// Size of the dump in bytes.
        #[clap(long)]
        size: u64,
        #[clap(value_parser = parse_int::parse::<u32>)]
        id: u32,
        #[clap(flatten)]
        notifier: NotifierArgs,
    },

    /// Run the offload service against a scripted system.
    ///
    /// The scenario file gives the initial management mode, boot progress
    /// and dump entries. Each line on stdin is then a JSON change to apply,
    /// e.g. `{"boot_progress": "OSRunning"}` or `"sweep_requested"`. The
    /// service stops once stdin ends or the system becomes HMC managed.
    Run {
        #[clap(long)]
        scenario: PathBuf,
        #[clap(flatten)]
        notifier: NotifierArgs,
    },
}

#[derive(ClapArgs, Debug, Clone)]
struct NotifierArgs {
    /// Log messages instead of sending them.
    #[clap(long)]
    dry_run: bool,

    /// Host endpoint id; overrides `--eid-file`.
    #[clap(long)]
    eid: Option<u8>,

    /// File holding the host endpoint id.
    #[clap(long, default_value = DEFAULT_HOST_EID_PATH)]
    eid_file: PathBuf,

    /// Shared PLDM instance id database [default: the system database].
    #[clap(long)]
    instance_db: Option<PathBuf>,

    /// How long to wait before retrying when every instance id is in use.
    #[clap(long, default_value = "100ms")]
    alloc_retry_delay: humantime::Duration,
}

impl NotifierArgs {
    fn config(&self) -> Result<NotifierConfig> {
        let endpoint = match self.eid {
            Some(eid) => Eid(eid),
            None => read_host_eid(&self.eid_file).with_context(|| {
                format!(
                    "failed to read host EID from {}",
                    self.eid_file.display()
                )
            })?,
        };
        Ok(NotifierConfig {
            endpoint,
            alloc_retry_delay: self.alloc_retry_delay.into(),
        })
    }

    fn check_platform(&self) -> Result<()> {
        if !self.dry_run && !cfg!(target_os = "linux") {
            bail!("the MCTP transport is only available on Linux; try --dry-run");
        }
        Ok(())
    }

    fn build_notifier(
        &self,
        config: NotifierConfig,
        log: &Logger,
    ) -> Box<dyn Notify> {
        #[cfg(target_os = "linux")]
        if !self.dry_run {
            use dump_offload::backend::FileInstanceDb;
            use dump_offload::backend::MctpTransport;
            use dump_offload::backend::DEFAULT_INSTANCE_DB_PATH;

            let path = self
                .instance_db
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTANCE_DB_PATH));
            return Box::new(DumpNotifier::with_config(
                config,
                move || FileInstanceDb::open(&path),
                MctpTransport,
                log,
            ));
        }

        if let Some(path) = &self.instance_db {
            info!(
                log, "ignoring instance id database in dry run";
                "path" => %path.display(),
            );
        }
        Box::new(DumpNotifier::with_config(
            config,
            || Ok::<_, Infallible>(LocalInstanceDb::default()),
            DryRunTransport::new(log),
            log,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (log, log_guard) =
        build_logger(args.log_level, args.logfile.as_deref())?;

    match args.command {
        Command::Classify { category, id } => {
            let file_type = classify_dump(category, id).with_context(|| {
                format!("cannot classify {category} dump {id:#010x}")
            })?;
            println!("{file_type}");
        }
        Command::Notify { category, size, id, notifier } => {
            notifier.check_platform()?;
            let config = notifier.config()?;
            let entry = DumpEntry {
                id,
                category,
                size,
                status: CompletionStatus::Complete,
            };
            notifier
                .build_notifier(config, &log)
                .notify(&entry)
                .with_context(|| {
                    format!("failed to notify host of {category} dump {id}")
                })?;
            println!("notified host (EID {}) of dump {id}", config.endpoint);
        }
        Command::Run { scenario, notifier } => {
            notifier.check_platform()?;
            let shutdown = run(&scenario, &notifier, &log).await?;
            info!(
                log, "offload service stopped";
                "reason" => %shutdown,
            );

            // The script reader may still be blocked reading stdin, which
            // would keep the runtime from shutting down; exit directly
            // instead of returning.
            mem::drop(log_guard);
            std::process::exit(shutdown.exit_code());
        }
    }

    Ok(())
}

async fn run(
    scenario: &Path,
    notifier: &NotifierArgs,
    log: &Logger,
) -> Result<Shutdown> {
    let bus = InMemoryBus::default();
    Scenario::load(scenario)?.install(&bus);

    let config = notifier.config()?;
    Ok(serve(
        bus,
        || notifier.build_notifier(config, log),
        tokio::io::BufReader::new(tokio::io::stdin()),
        log,
    )
    .await)
}

/// Run the offload service against `bus` while `script` drives it.
async fn serve<N, F, R>(
    bus: InMemoryBus,
    make_notifier: F,
    script: R,
    log: &Logger,
) -> Shutdown
where
    N: Notify,
    F: FnOnce() -> N,
    R: AsyncBufRead + Unpin + Send + 'static,
{
    // The script must not start changing the bus until we are subscribed
    // and the coordinator has read its starting state.
    let watches = HostWatches::subscribe(&bus);
    let coordinator = match OffloadCoordinator::new(
        bus.clone(),
        bus.clone(),
        make_notifier,
        log,
    ) {
        Ok(coordinator) => coordinator,
        Err(shutdown) => return shutdown,
    };
    let mut service = OffloadService::new(coordinator, log);

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    tokio::spawn(scenario::replay(
        script,
        bus,
        events_tx,
        log.new(o!("task" => "script")),
    ));

    service.run(watches, events_rx).await
}

fn build_logger(
    level: Level,
    path: Option<&Path>,
) -> Result<(Logger, AsyncGuard)> {
    fn make_drain<D: slog_term::Decorator + Send + 'static>(
        level: Level,
        decorator: D,
    ) -> (slog::Fuse<slog_async::Async>, AsyncGuard) {
        let drain = slog_term::FullFormat::new(decorator)
            .build()
            .filter_level(level)
            .fuse();
        let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
        (drain.fuse(), guard)
    }

    let (drain, guard) = if let Some(path) = path {
        let file = File::create(path).with_context(|| {
            format!("failed to create logfile {}", path.display())
        })?;
        make_drain(level, slog_term::PlainDecorator::new(file))
    } else {
        make_drain(level, slog_term::TermDecorator::new().build())
    };

    Ok((Logger::root(drain, o!("component" => "faux-offload")), guard))
}
