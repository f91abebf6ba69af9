use std::{
    error::Error,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};
use tracing::{error, info, warn};

use subsys::{
    cli::{Commands, parse_args},
    config::{Config, load_config},
    echo::EchoService,
    logs::init_logging,
    server::ShutdownHandle,
    timeout::Timeout,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(args.log_level);

    match args.command {
        Commands::Serve { config } => {
            let config = load_config(Some(config.as_str()))?;
            serve(&config)?;
        }
        Commands::Check { config: path } => {
            let config = load_config(Some(path.as_str()))?;
            print_summary(&path, &config);
        }
    }

    Ok(())
}

fn serve(config: &Config) -> Result<(), Box<dyn Error>> {
    let service = EchoService::build(config)?;
    register_signal_handler(service.shutdown_handle(), config.shutdown_grace)?;

    info!(
        "Starting '{}' with {} workers",
        config.server.name, config.dispatcher.workers
    );
    service.run()?;
    Ok(())
}

fn print_summary(path: &str, config: &Config) {
    let capacity = config
        .dispatcher
        .queue_capacity
        .map_or_else(|| "unbounded".to_string(), |c| c.to_string());
    println!("config: {path}");
    println!("version: {}", config.version);
    println!("server: {} on {}", config.server.name, config.server.listen);
    println!("accept_poll: {}", config.server.accept_poll);
    println!("connection_timeout: {}", config.server.connection_timeout);
    println!("workers: {}", config.dispatcher.workers);
    println!("queue_capacity: {capacity}");
    println!("stop_policy: {}", config.dispatcher.stop_policy);
    println!("poll_interval: {}", config.dispatcher.poll_interval);
    println!("shutdown_grace: {}", config.shutdown_grace);
}

/// First signal requests an orderly stop bounded by `grace`; a second one exits at once.
fn register_signal_handler(handle: ShutdownHandle, grace: Timeout) -> Result<(), Box<dyn Error>> {
    let requested = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if requested.swap(true, Ordering::SeqCst) {
            warn!("Second interrupt; exiting without waiting for shutdown");
            std::process::exit(130);
        }

        println!("subsysd is shutting down...");
        if let Err(err) = handle.shutdown() {
            error!("Shutdown request failed: {err}");
            std::process::exit(1);
        }

        let watchdog = handle.clone();
        let spawned = thread::Builder::new()
            .name("shutdown-watchdog".into())
            .spawn(move || {
                if !watchdog.wait_stopped(grace) {
                    error!("Shutdown did not complete within {grace}; exiting");
                    std::process::exit(1);
                }
            });
        if let Err(err) = spawned {
            error!("Failed to start shutdown watchdog: {err}");
        }
    })?;

    Ok(())
}
