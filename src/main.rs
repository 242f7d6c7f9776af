mod cli;

use webmforge::{
    app::{self, Services},
    config,
    conversion::{JobOutcome, SubmitRequest},
    server,
};
use webmforge_common::{media, CallerId};
use webmforge_engine::{Backend, ToolRegistry};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Caller key used for conversions started from the command line.
const CLI_CALLER: &str = "cli";

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;
    config.server.host = host.unwrap_or(config.server.host);
    config.server.port = port.unwrap_or(config.server.port);

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        backend = %config.engine.backend,
        "Launching webmforge"
    );

    let Services { config, controller } = app::build_services(config)?;
    server::start_server(config, controller).await
}

/// One conversion, run on a single-threaded runtime.
fn convert_file(
    input: &Path,
    output: Option<PathBuf>,
    backend: Option<Backend>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;
    if let Some(backend) = backend {
        config.engine.backend = backend;
    }

    if !input.exists() {
        anyhow::bail!("No such input: {}", input.display());
    }
    let output = output.unwrap_or_else(|| input.with_extension(media::MP4_EXTENSION.trim_start_matches('.')));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let Services { controller, .. } = app::build_services(config)?;

        let bytes = tokio::fs::read(input)
            .await
            .with_context(|| format!("Failed to read {:?}", input))?;
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let handle = controller
            .submit(SubmitRequest::new(bytes, name, CallerId::new(CLI_CALLER)))
            .await?;
        println!("Job {}", handle.id);

        let outcome = {
            let result = controller.await_result(handle.id);
            tokio::pin!(result);
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            let mut last_phase = String::new();

            loop {
                tokio::select! {
                    outcome = &mut result => break outcome?,
                    _ = tokio::signal::ctrl_c() => {
                        println!("Cancelling...");
                        controller.cancel(handle.id)?;
                    }
                    _ = ticker.tick() => {
                        let progress = controller.progress(handle.id)?;
                        if progress.phase != last_phase {
                            println!("{}", progress.phase);
                            last_phase = progress.phase.clone();
                        }
                        tracing::debug!(percent = progress.percent(), "Progress");
                    }
                }
            }
        };

        match outcome {
            JobOutcome::Succeeded {
                artifact,
                strategy_used,
            } => {
                let resolved = controller
                    .store()
                    .resolve(artifact.id)
                    .context("Converted output expired before it could be copied")?;
                tokio::fs::copy(&resolved.path, &output)
                    .await
                    .with_context(|| format!("Failed to write {:?}", output))?;
                controller.store().release(artifact.id);
                println!(
                    "Converted with {} -> {} ({} bytes)",
                    strategy_used,
                    output.display(),
                    artifact.size
                );
                Ok(())
            }
            JobOutcome::Failed { reason, detail } => {
                anyhow::bail!("Conversion failed ({reason}): {detail}")
            }
        }
    })
}

fn sweep(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let Services { controller, .. } = app::build_services(config)?;

    let summary = controller.sweep(chrono::Utc::now());
    println!(
        "Swept {} expired and {} orphaned artifacts ({} could not be removed)",
        summary.artifacts.expired, summary.artifacts.orphaned, summary.artifacts.failed
    );
    Ok(())
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let registry = ToolRegistry::discover(config.engine.ffmpeg_path.as_deref());
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let tools = rt.block_on(registry.check_all());

    println!("Conversion backends:");
    for tool in &tools {
        let version = tool.version.as_deref().unwrap_or("unknown version");
        match &tool.path {
            Some(path) => println!(
                "  {} {} [{}] at {}",
                mark(tool.available),
                tool.name,
                version,
                path.display()
            ),
            None => println!("  {} {} not found", mark(false), tool.name),
        }
    }

    let module = &config.engine.wasm_module;
    println!(
        "  {} sandbox module at {}",
        mark(module.exists()),
        module.display()
    );

    if tools.iter().all(|t| t.available) {
        println!("Process backend ready.");
    } else {
        println!("Process backend unavailable: install ffmpeg or set engine.ffmpeg_path.");
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            let config = config::load_config(p)
                .with_context(|| format!("{} is not a usable configuration", p.display()))?;
            println!("{} is valid", p.display());
            config
        }
        None => {
            println!("No configuration file given; showing built-in defaults");
            config::Config::default()
        }
    };

    println!(
        "listen={}:{} backend={} max_upload={}B",
        config.server.host, config.server.port, config.engine.backend, config.upload.max_file_size
    );
    println!("strategy chain ({}):", config.strategies.len());
    for (i, strategy) in config.strategies.iter().enumerate() {
        println!("  {}. {}", i + 1, strategy.name);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose.
    let default_filter = if cli.verbose {
        "webmforge=trace,webmforge_engine=trace,webmforge_common=debug,tower_http=debug"
    } else {
        "webmforge=info,webmforge_engine=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Start { host, port } => tokio::runtime::Runtime::new()?
            .block_on(start_server(host, port, cli.config.as_deref())),
        Commands::Convert {
            input,
            output,
            backend,
        } => convert_file(&input, output, backend, cli.config.as_deref()),
        Commands::Sweep => sweep(cli.config.as_deref()),
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate { config } => validate_config(config.or(cli.config).as_deref()),
        Commands::Version => {
            println!("webmforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
