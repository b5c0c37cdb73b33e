mod cli;

use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, TunnelCommands};
use homeport::tunnel::{provider_from_name, TunnelManager, TunnelRecord, TunnelStatus};
use homeport::{
    Config, ConnectivityAggregator, ConnectivityRecord, DockerEngine, Error as HomeportError,
    LocalNameDiscovery, Orchestrator, ProgressReceiver, ProxyBuilder, ServiceStatus,
};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(err) = e.downcast_ref::<HomeportError>() {
            eprintln!("Error: {}", err);
            if let Some(suggestion) = err.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let work_dir = match cli.workdir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let config = load_config(&cli, &work_dir)?;
    let state_dir = config.state_dir(&work_dir);

    match cli.command {
        Commands::Start { services, expose } => {
            let orchestrator = build_orchestrator(&config)?;
            if let Err(e) = orchestrator.adopt_running_containers().await {
                tracing::debug!("Container adoption skipped: {}", e);
            }

            let (rx, handle) = orchestrator
                .start_streaming(&services, config.operation_deadline())
                .await?;
            render_progress(rx).await;
            let outcome = handle
                .await
                .map_err(|e| HomeportError::Config(format!("operation worker panicked: {}", e)))?;

            for name in &outcome.succeeded {
                println!("✓ {} running", name);
            }
            for (name, error) in &outcome.failed {
                println!("✗ {} failed: {}", name, error);
            }

            let result = outcome.into_result();
            if expose || config.connectivity.enabled {
                if result.is_err() {
                    eprintln!("Some services failed; exposing the ones that are running.");
                }
                expose_and_wait(&config, &orchestrator, &state_dir, &[]).await?;
            }
            result?;
            Ok(())
        }

        Commands::Stop { services } => {
            let orchestrator = build_orchestrator(&config)?;
            if let Err(e) = orchestrator.adopt_running_containers().await {
                tracing::debug!("Container adoption skipped: {}", e);
            }
            let (rx, handle) = orchestrator
                .stop_streaming(&services, config.operation_deadline())
                .await?;
            render_progress(rx).await;
            let outcome = handle
                .await
                .map_err(|e| HomeportError::Config(format!("operation worker panicked: {}", e)))?;
            outcome.into_result()?;
            Ok(())
        }

        Commands::Restart { services } => {
            let orchestrator = build_orchestrator(&config)?;
            if let Err(e) = orchestrator.adopt_running_containers().await {
                tracing::debug!("Container adoption skipped: {}", e);
            }
            let (rx, handle) = orchestrator
                .restart_streaming(&services, config.operation_deadline())
                .await?;
            render_progress(rx).await;
            let outcome = handle
                .await
                .map_err(|e| HomeportError::Config(format!("operation worker panicked: {}", e)))?;
            outcome.into_result()?;
            Ok(())
        }

        Commands::Status { services, json } => {
            let orchestrator = build_orchestrator(&config)?;
            if let Err(e) = orchestrator.adopt_running_containers().await {
                tracing::debug!("Container adoption skipped: {}", e);
            }
            let names = if services.is_empty() {
                None
            } else {
                Some(services.as_slice())
            };
            let statuses = orchestrator.status(names).await?;
            let report = build_report(&config, &orchestrator, &state_dir, statuses).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }

        Commands::Tunnel(tunnel_cmd) => match tunnel_cmd {
            TunnelCommands::Start { services } => {
                let orchestrator = build_orchestrator(&config)?;
                if let Err(e) = orchestrator.adopt_running_containers().await {
                    tracing::debug!("Container adoption skipped: {}", e);
                }
                expose_and_wait(&config, &orchestrator, &state_dir, &services).await
            }
            TunnelCommands::Stop => {
                if TunnelRecord::forget(&state_dir)? {
                    println!("Forgot the persisted tunnel record.");
                } else {
                    println!("No tunnel record to forget.");
                }
                Ok(())
            }
            TunnelCommands::Status { json } => {
                match TunnelManager::status_from_dir(&state_dir).await? {
                    Some(status) => {
                        if json {
                            println!("{}", serde_json::to_string_pretty(&status)?);
                        } else {
                            print_tunnel_status(&status);
                        }
                    }
                    None => println!("No tunnel has been established for this project."),
                }
                Ok(())
            }
        },
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(cli: &Cli, work_dir: &Path) -> anyhow::Result<Config> {
    if let Some(path) = &cli.config {
        return Ok(Config::load(path)?);
    }
    match Config::find_config_file(work_dir) {
        Ok(path) => Ok(Config::load(&path)?),
        Err(_) => {
            tracing::debug!("No homeport.yaml found, using the built-in catalog only");
            Ok(Config::default())
        }
    }
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let registry = config.registry()?;
    Ok(
        Orchestrator::new(&config.project, registry, Arc::new(DockerEngine::new()))
            .with_poller(config.health_poller())
            .with_port_allocator(config.port_allocator()),
    )
}

/// Render the progress stream; the single consumer loop for one operation.
async fn render_progress(mut rx: ProgressReceiver) {
    while let Some(event) = rx.recv().await {
        match &event.error {
            Some(error) => println!("  {:<12} {} ({})", event.service, event.phase, error),
            None => println!("  {:<12} {}", event.service, event.phase),
        }
    }
}

/// Build the proxy over the running services, open the tunnel at it, print
/// the public URLs, and keep serving until Ctrl-C.
async fn expose_and_wait(
    config: &Config,
    orchestrator: &Orchestrator,
    state_dir: &Path,
    only: &[String],
) -> anyhow::Result<()> {
    let running = orchestrator.running_services().await;

    let selection: Vec<String> = if !only.is_empty() {
        only.to_vec()
    } else {
        config.connectivity.tunnel.services.clone()
    };
    let exposed: Vec<(String, u16)> = if selection.is_empty() {
        running
    } else {
        let mut wanted = Vec::new();
        for requested in &selection {
            let descriptor = orchestrator.registry().resolve(requested)?;
            match running.iter().find(|(name, _)| *name == descriptor.name) {
                Some(entry) => wanted.push(entry.clone()),
                None => {
                    return Err(HomeportError::ServiceNotRunning(descriptor.name.clone()).into())
                }
            }
        }
        wanted
    };
    if exposed.is_empty() {
        return Err(HomeportError::Config(
            "no running services to expose; start some first".to_string(),
        )
        .into());
    }

    let mut builder = ProxyBuilder::new()
        .with_prefix(&config.project)
        .with_listen_port(config.connectivity.tunnel.proxy_port)
        .with_drain_grace(config.proxy_drain_grace());
    for (name, port) in &exposed {
        builder = builder.add_service(name.clone(), *port)?;
    }
    let mut proxy = builder.build();
    let proxy_addr = proxy.start().await?;

    let provider = provider_from_name(&config.connectivity.tunnel.provider)?;
    let mut tunnel = TunnelManager::new(provider, state_dir)
        .with_domain(config.connectivity.tunnel.domain.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let urls = match tunnel.start(&cancel, &proxy_addr.to_string()).await {
        Ok(urls) => urls,
        Err(e) => {
            proxy.stop().await;
            return Err(e.into());
        }
    };

    println!("Tunnel established:");
    let service_urls = proxy.service_urls(&urls[0]);
    let mut names: Vec<&String> = service_urls.keys().collect();
    names.sort();
    for name in names {
        println!("  {:<12} {}", name, service_urls[name]);
    }
    println!("\nPress Ctrl-C to close the tunnel.");

    cancel.cancelled().await;
    println!("Closing tunnel...");
    if let Err(e) = tunnel.stop().await {
        tracing::warn!("Tunnel shutdown error: {}", e);
    }
    proxy.stop().await;
    Ok(())
}

#[derive(Serialize)]
struct ServiceReport {
    #[serde(flatten)]
    status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    connectivity: Option<ConnectivityRecord>,
}

#[derive(Serialize)]
struct FullReport {
    project: String,
    services: Vec<ServiceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tunnel: Option<TunnelStatus>,
}

async fn build_report(
    config: &Config,
    orchestrator: &Orchestrator,
    state_dir: &Path,
    statuses: Vec<ServiceStatus>,
) -> anyhow::Result<FullReport> {
    let running = orchestrator.running_services().await;
    let tunnel = TunnelManager::status_from_dir(state_dir).await?;

    let mut aggregator = ConnectivityAggregator::new(running.clone());
    if config.connectivity.mdns {
        aggregator = aggregator.with_discovery(&LocalNameDiscovery, &config.project);
    }
    if let Some(status) = tunnel.as_ref().filter(|s| s.active) {
        if let Some(base) = status.record.urls.first() {
            // Rebuild the route derivation over the same running set to map
            // services to their public URLs.
            let mut builder = ProxyBuilder::new().with_prefix(&config.project);
            for (name, port) in &running {
                builder = builder.add_service(name.clone(), *port)?;
            }
            aggregator = aggregator.with_tunnel_urls(builder.build().service_urls(base));
        }
    }

    let services = statuses
        .into_iter()
        .map(|status| {
            let connectivity = aggregator.compute(&status.state.name).ok();
            ServiceReport {
                status,
                connectivity,
            }
        })
        .collect();

    Ok(FullReport {
        project: config.project.clone(),
        services,
        tunnel,
    })
}

fn print_report(report: &FullReport) {
    println!("Project: {}\n", report.project);
    for service in &report.services {
        let state = &service.status.state;
        let port = state
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<9} port {:<6} health {}",
            state.name, state.status, port, state.health
        );
        if let Some(error) = &state.last_error {
            println!("             last error: {}", error);
        }
        if let Some(connectivity) = &service.connectivity {
            println!("             local   {}", connectivity.loopback);
            for lan in &connectivity.lan {
                println!("             lan     {}", lan);
            }
            if let Some(discovery) = &connectivity.discovery {
                println!("             mdns    {}", discovery);
            }
            if let Some(tunnel) = &connectivity.tunnel {
                println!("             public  {}", tunnel);
            }
        }
    }
    match &report.tunnel {
        Some(status) => print_tunnel_status(status),
        None => println!("\nTunnel: none"),
    }
}

fn print_tunnel_status(status: &TunnelStatus) {
    let liveness = if status.active {
        "active"
    } else {
        "last known (not verified live)"
    };
    println!(
        "\nTunnel: {} via {} ({})",
        status.record.urls.join(", "),
        status.record.provider,
        liveness
    );
    println!(
        "  created {}  last started {}",
        status.record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        status.record.last_started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}
