use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use unitd::{HandshakeReport, PoolDefinition, SupervisorContext, supervise};
use unitd_unix::{Fork, HandshakeReader, daemonize};

/// Start a pipeline of processes in order and keep it running until one exits
#[derive(Parser, Debug)]
#[command(name = "unitd", version)]
struct Cli {
    /// JSON pool definition
    pool_file: PathBuf,

    /// Detach into the background once startup succeeded or failed
    #[arg(long)]
    daemon: bool,

    /// URL reported once every process is running
    #[arg(long)]
    url: Option<String>,

    /// Program run with the reported URL after a successful background start
    #[arg(long, value_name = "PROGRAM", requires = "daemon")]
    open_with: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    info!("unitd {} on {}", env!("CARGO_PKG_VERSION"), unitd_unix::platform_name());

    let mut definition = match PoolDefinition::from_path(&cli.pool_file) {
        Ok(definition) => definition,
        Err(e) => {
            error!("{}", e);
            if cli.daemon {
                println!("{}", HandshakeReport::failed(e.to_string()).to_line()?);
            }
            return Ok(ExitCode::from(1));
        }
    };
    if let Some(url) = cli.url {
        definition.url = Some(url);
    }

    let mut writer = None;
    if cli.daemon {
        // SAFETY: no runtime has been built and no thread spawned yet.
        match unsafe { daemonize() }? {
            Fork::Parent(reader) => return Ok(relay_handshake(reader, cli.open_with.as_deref())),
            Fork::Child(child) => writer = Some(child),
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build the async runtime")?;

    let ctx = SupervisorContext::new();
    let result = runtime.block_on(supervise(definition, &ctx, move |handshake| {
        if let Some(mut writer) = writer {
            if let Err(e) = writer.report(handshake) {
                warn!("Cannot report startup: {}", e);
            }
        }
    }));

    match result {
        Ok(report) => {
            match serde_json::to_string(&report) {
                Ok(json) => info!("Pool finished: {}", json),
                Err(e) => warn!("Cannot encode pool report: {}", e),
            }
            Ok(if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Err(e) if e.is_user_facing() => {
            error!("{}", e);
            Ok(ExitCode::from(1))
        }
        Err(e) => Err(e).context("supervision failed"),
    }
}

fn relay_handshake(reader: HandshakeReader, open_with: Option<&str>) -> ExitCode {
    let child = reader.child();
    match reader.read() {
        Ok((line, report)) => {
            println!("{line}");
            if !report.started {
                return ExitCode::from(1);
            }
            if let (Some(program), Some(url)) = (open_with, report.url.as_deref()) {
                if let Err(e) = std::process::Command::new(program).arg(url).spawn() {
                    warn!("Cannot run {} {}: {}", program, url, e);
                }
            }
            info!("Supervisor running in background as {}", child);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            match HandshakeReport::failed(e.to_string()).to_line() {
                Ok(line) => println!("{line}"),
                Err(e) => error!("{}", e),
            }
            ExitCode::from(1)
        }
    }
}
