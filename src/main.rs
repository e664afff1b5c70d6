use anyhow::Context;
use ash_warden::config::Config;
use ash_warden::{
    AggregatedStatus, CommandControl, StatusReporter, SupervisorHandle, SystemProbe, logging,
    sweep,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "ash-warden")]
#[command(version)]
#[command(about = "Starts services in dependency order and keeps them healthy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise the configured services until interrupted
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "ash-warden.toml")]
        config: PathBuf,

        /// Rewrite this file with the JSON status after every change
        #[arg(long)]
        status_file: Option<PathBuf>,
    },
    /// Probe every service once and report the result
    Status {
        /// Configuration file path
        #[arg(short, long, default_value = "ash-warden.toml")]
        config: PathBuf,

        /// Read a status file written by `run --status-file` instead of probing
        #[arg(long)]
        from: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        /// Also write the JSON status to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print nothing, only set the exit code
        #[arg(short, long)]
        quiet: bool,
    },
    /// Validate a configuration file and print the start order
    CheckConfig {
        /// Configuration file path
        #[arg(short, long, default_value = "ash-warden.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = logging::init(logging::level_for(cli.verbose));

    let outcome = match cli.command {
        Commands::Run {
            config,
            status_file,
        } => run(&config, status_file).await,
        Commands::Status {
            config,
            from,
            format,
            output,
            quiet,
        } => status(&config, from.as_deref(), format, output.as_deref(), quiet).await,
        Commands::CheckConfig { config } => check_config(&config),
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(64)
        }
    }
}

async fn run(config_path: &Path, status_file: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = Config::from_file(config_path)?;
    let spec = config
        .supervisor_spec()
        .with_context(|| format!("loading {}", config_path.display()))?;

    let handle = SupervisorHandle::start(spec, SystemProbe::new()?, CommandControl);
    let writer = status_file.map(|path| tokio::spawn(write_status_file(handle.reporter(), path)));

    let halted = tokio::select! {
        _ = shutdown_signal() => {
            slog::info!(slog_scope::logger(), "shutdown requested"; "supervisor" => handle.name());
            handle.shutdown().await?;
            false
        }
        _ = handle.closed() => true,
    };

    let status = handle.status();
    drop(handle);
    if let Some(writer) = writer {
        writer.await?;
    }

    if halted {
        let reason = status.halted.as_deref().unwrap_or("supervisor stopped unexpectedly");
        eprintln!("supervisor halted: {}", reason);
        return Ok(ExitCode::from(status.exit_code()));
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(
    config_path: &Path,
    from: Option<&Path>,
    format: Format,
    output: Option<&Path>,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    let status = match from {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            AggregatedStatus::from_json(&json)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => {
            let config = Config::from_file(config_path)?;
            let registry = config
                .registry()
                .with_context(|| format!("loading {}", config_path.display()))?;
            sweep(&config.supervisor.name, &registry, Arc::new(SystemProbe::new()?)).await
        }
    };

    if let Some(path) = output {
        write_atomically(path, &status.to_json()?)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    if !quiet {
        match format {
            Format::Text => print!("{}", status.render_text()),
            Format::Json => println!("{}", status.to_json()?),
        }
    }

    Ok(ExitCode::from(status.exit_code()))
}

fn check_config(config_path: &Path) -> anyhow::Result<ExitCode> {
    let config = Config::from_file(config_path)?;
    let registry = config
        .registry()
        .with_context(|| format!("loading {}", config_path.display()))?;

    println!(
        "{}: {} services",
        config_path.display(),
        registry.len()
    );
    for (level, names) in registry.graph().levels().iter().enumerate() {
        println!("  {}: {}", level, names.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

async fn write_status_file(mut reporter: StatusReporter, path: PathBuf) {
    loop {
        let status = reporter.snapshot();
        let written = status
            .to_json()
            .map_err(anyhow::Error::from)
            .and_then(|json| write_atomically(&path, &json).map_err(anyhow::Error::from));
        if let Err(err) = written {
            slog::warn!(slog_scope::logger(), "failed to write status file";
                "path" => %path.display(),
                "error" => %err
            );
        }
        if !reporter.changed().await {
            break;
        }
    }
}

fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
