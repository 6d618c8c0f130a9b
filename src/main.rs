use std::{process, sync::OnceLock};

use relaybee::{config::Config, demo, logger::LoggerManager, print_error};
use tracing::{debug, error, info};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

#[tokio::main]
async fn main() {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting relaybee version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.transport);

    let mut session = demo::build_session(cfg).unwrap_or_else(|e| {
        error!("Failed to create MQTT session: {}", e);
        process::exit(1);
    });
    demo::watch_state(session.subscribe_state());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = demo::run(&mut session, &cfg.demo, shutdown).await {
        error!("relaybee stopped: {}", e);
        process::exit(1);
    }
    info!("Shutdown complete");
}
