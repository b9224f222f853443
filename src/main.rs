mod backup;
mod config;
mod database;
mod error;
mod log;
mod storage;
#[cfg(test)]
mod testing;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    log::init();

    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Backup failed: {}", e);
            std::process::exit(1);
        }
    };

    match backup::run(&config).await {
        Ok(summary) => {
            info!(
                "Backup successful ({} databases, {} bytes uploaded)",
                summary.found, summary.bytes_uploaded
            );
        }
        Err(e) => {
            error!("Backup failed: {}", e);
            std::process::exit(1);
        }
    }
}
