//! # ivshmem Server Binary
//!
//! Brokers a shared memory region and doorbell eventfds between clients
//! connecting on a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: /tmp/ivshmem_socket, POSIX shm "ivshmem", 4 MiB, 1 vector
//! ivshmem_server
//!
//! # Hugepage-backed region with 4 vectors per peer
//! ivshmem_server -m /dev/hugepages/ivshmem -l 2M -n 4
//!
//! # File configuration with a CLI override, verbose JSON logs
//! ivshmem_server -c /etc/ivshmem/server.toml -S /run/ivshmem.sock -v --json
//! ```

#![deny(warnings)]

use clap::Parser;
use ivshmem_common::config::{ConfigLoader, ServerConfig, parse_size};
use ivshmem_server::region::{RegionError, remove_region};
use ivshmem_server::{IvshmemServer, ReadySet, TracingSink, poll_ready};
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

/// Wake-up interval so a shutdown signal is noticed without traffic.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// ivshmem server - shared memory and doorbell broker
#[derive(Parser, Debug)]
#[command(name = "ivshmem_server")]
#[command(version)]
#[command(about = "Shares a memory region and eventfd doorbells between ivshmem clients")]
#[command(long_about = None)]
struct Args {
    /// TOML configuration file; command line flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path of the listening Unix socket
    #[arg(short = 'S', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// POSIX shm name, or a file path (e.g. on hugetlbfs)
    #[arg(short = 'm', long, value_name = "PATH")]
    shm_path: Option<PathBuf>,

    /// Region size, e.g. 4096, 64K, 4M, 1G
    #[arg(short = 'l', long, value_name = "SIZE", value_parser = parse_size)]
    shm_size: Option<u64>,

    /// Number of vectors per peer
    #[arg(short = 'n', long = "vectors", value_name = "COUNT")]
    n_vectors: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Unlink the shared memory object or backing file on exit
    #[arg(long)]
    remove_shm: bool,
}

impl Args {
    /// File (or default) configuration with command line overrides applied.
    fn server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .map_err(|e| format!("{}: {e}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(path) = &self.socket_path {
            config.socket_path = path.clone();
        }
        if let Some(path) = &self.shm_path {
            config.shm_path = path.clone();
        }
        if let Some(size) = self.shm_size {
            config.shm_size = size;
        }
        if let Some(count) = self.n_vectors {
            config.n_vectors = count;
        }
        config.verbose |= self.verbose;
        Ok(config)
    }
}

fn main() {
    if let Err(e) = run() {
        error!("ivshmem server failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // The subscriber level follows the merged verbosity, so a config file
    // with `verbose = true` gets debug output too.
    let config = match args.server_config() {
        Ok(config) => config,
        Err(e) => {
            setup_tracing(args.verbose, args.json);
            return Err(e);
        }
    };
    setup_tracing(config.verbose, args.json);

    info!("ivshmem server v{} starting...", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &args.config {
        info!("Loaded config from {}", path.display());
    }

    let verbose = config.verbose;
    let mut server = IvshmemServer::start(config, Box::new(TracingSink::new(verbose)))?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    let served = serve(&mut server, &running, args.json, |fds| {
        poll_ready(fds, Some(POLL_INTERVAL))
    });
    stop(server, args.remove_shm)?;
    served?;

    info!("ivshmem server shutdown complete");
    Ok(())
}

/// Wait/dispatch loop. Runs until `running` is cleared or `wait` fails.
fn serve<W>(
    server: &mut IvshmemServer,
    running: &AtomicBool,
    json: bool,
    mut wait: W,
) -> std::io::Result<()>
where
    W: FnMut(&[BorrowedFd<'_>]) -> std::io::Result<ReadySet>,
{
    let verbose = server.config().verbose;
    while running.load(Ordering::SeqCst) {
        let ready = wait(&server.watch_set()).inspect_err(|e| error!("poll failed: {}", e))?;
        if ready.is_empty() {
            continue;
        }

        let summary = server.dispatch(&ready);
        if verbose && summary.changed() {
            log_dump(server, json);
        }
    }
    Ok(())
}

/// Shut the server down, then unlink the backing store if asked to.
fn stop(server: IvshmemServer, remove_shm: bool) -> Result<(), RegionError> {
    let shm_path = server.config().shm_path.clone();
    server.shutdown();
    if remove_shm {
        remove_region(&shm_path)?;
        info!("Removed {}", shm_path.display());
    }
    Ok(())
}

/// Log the current peer listing at debug level.
fn log_dump(server: &IvshmemServer, json: bool) {
    let dump = server.dump();
    if json {
        match dump.to_json() {
            Ok(line) => debug!("{}", line),
            Err(e) => debug!("cannot serialize dump: {}", e),
        }
    } else {
        for line in dump.to_string().lines() {
            debug!("{}", line);
        }
    }
}

/// Log level for the merged verbosity setting.
fn log_level(verbose: bool) -> Level {
    if verbose { Level::DEBUG } else { Level::INFO }
}

/// Setup tracing subscriber.
fn setup_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(log_level(verbose).into());

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
