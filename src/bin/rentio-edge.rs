use rentio::logger;
use rentio::modules::edge::run_edge;
use rentio::shared::config::EdgeConfigs;

#[tokio::main]
async fn main() {
    let configs = match EdgeConfigs::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configurations: {}", e);
            std::process::exit(1);
        }
    };
    logger::start_log(&configs.log_level);
    log::info!("Configurations loaded");

    if let Err(e) = run_edge(configs).await {
        log::error!("Edge agent failed: {}", e);
        std::process::exit(1);
    }
}
