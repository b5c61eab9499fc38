use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::thread::spawn;

use kvnode::command_core::CommandCore;
use kvnode::config::{Config, DEFAULT_HTTP_PORT, DEFAULT_PORT};
use kvnode::hub::Hub;
use kvnode::store::spawn_expiration_thread;
use kvnode::transport::{http_ws, tcp};
use logger::Logger;

struct Cli {
    port: u16,
    http_port: u16,
    config_path: Option<String>,
}

/// Parses `--port <u16>`, `--http-port <u16>`, and `--config <path>`, all
/// optional. Unknown flags and malformed values are reported to stderr;
/// the caller treats that as a fatal startup error.
fn parse_cli(args: &[String]) -> Result<Cli, String> {
    let mut port = DEFAULT_PORT;
    let mut http_port = DEFAULT_HTTP_PORT;
    let mut config_path = None;

    let mut iter = args.iter().skip(1);
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--port" => {
                let value = iter.next().ok_or("--port requires a value")?;
                port = value.parse().map_err(|_| format!("invalid --port value '{value}'"))?;
            }
            "--http-port" => {
                let value = iter.next().ok_or("--http-port requires a value")?;
                http_port = value
                    .parse()
                    .map_err(|_| format!("invalid --http-port value '{value}'"))?;
            }
            "--config" => {
                let value = iter.next().ok_or("--config requires a path")?;
                config_path = Some(value.clone());
            }
            other => return Err(format!("unrecognized flag '{other}'")),
        }
    }

    Ok(Cli {
        port,
        http_port,
        config_path,
    })
}

/// Entry point for a single cluster node.
///
/// Usage:
/// ```text
/// kvnode [--port 6379] [--http-port 8080] [--config /path/to/node.conf]
/// ```
fn main() {
    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_cli(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let config = match Config::from_args(cli.port, cli.http_port, cli.config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error loading config: {e}");
            std::process::exit(1);
        }
    };

    let logger = Logger::new(config.log_file());
    let hub = Hub::new(logger.clone());

    let core = match CommandCore::open(
        Path::new(config.wal_file()),
        kvnode::store::MAX_SIZE,
        config.address().ip().to_string(),
        config.address().port(),
        logger.clone(),
        hub.clone(),
    ) {
        Ok(core) => Arc::new(core),
        Err(e) => {
            logger.error(&format!("failed to open command core: {e}"), "main");
            std::process::exit(1);
        }
    };

    if let Some(seed) = config.node_seed() {
        if let Err(e) = core.cluster_meet(seed.ip().to_string(), seed.port()) {
            logger.error(&format!("failed to meet seed node {seed}: {e}"), "main");
        }
    }

    let tcp_listener = match TcpListener::bind(config.address()) {
        Ok(listener) => listener,
        Err(e) => {
            logger.error(&format!("failed to bind {}: {e}", config.address()), "main");
            std::process::exit(1);
        }
    };
    let http_listener = match TcpListener::bind(config.http_address()) {
        Ok(listener) => listener,
        Err(e) => {
            logger.error(
                &format!("failed to bind {}: {e}", config.http_address()),
                "main",
            );
            std::process::exit(1);
        }
    };

    println!("kvnode listening on {} (redis-line)", config.address());
    println!("kvnode listening on {} (http/websocket)", config.http_address());
    println!("node id: {}", core.cluster().self_id());

    let expiry_thread = spawn_expiration_thread(core.store_handle(), Arc::new(logger.clone()));

    let tcp_thread = {
        let core = core.clone();
        let logger = logger.clone();
        let max_clients = config.max_clients();
        spawn(move || tcp::serve(tcp_listener, core, max_clients, logger))
    };

    let http_thread = {
        let core = core.clone();
        let hub = hub.clone();
        let logger = logger.clone();
        spawn(move || http_ws::serve(http_listener, core, hub, logger))
    };

    let _ = tcp_thread.join();
    let _ = http_thread.join();
    let _ = expiry_thread.join();
}
