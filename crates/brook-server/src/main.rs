//! brook - A single-threaded MQTT 3.1.1 broker.

use log::{error, info, warn};

use brook_server::broker::{Broker, BrokerOptions};
use brook_server::config::Config;
use brook_server::persistence;
use brook_server::server::Server;
use brook_server::signals;

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "brook.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("brook - MQTT 3.1.1 broker");
                println!();
                println!("Usage: brook [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: brook.toml)");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format. All settings can be overridden");
                println!("  with environment variables using BROOK__ prefix:");
                println!();
                println!("  BROOK__SERVER__BIND=0.0.0.0:1884");
                println!("  BROOK__MQTT__MAX_QOS=1");
                println!("  BROOK__PERSISTENCE__ENABLED=true");
                println!("  BROOK__LOG__LEVEL=debug");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    // Load configuration from file + environment variables
    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let env = env_logger::Env::default().default_filter_or(config.log.level.as_str());
    env_logger::Builder::from_env(env).init();

    info!("Loaded configuration from {}", args.config_path);
    info!(
        "Starting brook (max_qos={}, max_packet_size={}KB, persistence={})",
        config.mqtt.max_qos,
        config.limits.max_packet_size / 1024,
        config.persistence.enabled
    );

    let options = BrokerOptions::from(&config);
    let broker = if config.persistence.enabled {
        match persistence::load(&config.persistence.path) {
            Ok(store) => Broker::restore(options, store),
            Err(e) => {
                warn!(
                    "Could not read session store {}: {}",
                    config.persistence.path.display(),
                    e
                );
                Broker::new(options)
            }
        }
    } else {
        Broker::new(options)
    };

    let mut server = match Server::new(config, broker) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    // SIGINT/SIGTERM make run() return so the store below gets written
    if let Err(e) = signals::shutdown_on_signal(server.handle()) {
        error!("Failed to install signal handler: {}", e);
        std::process::exit(1);
    }

    let result = server.run();
    server.save_store();
    if let Err(e) = result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
