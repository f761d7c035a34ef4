//! Log collector process

use hscomp::config::{AppConfig, DEFAULT_LOG_CONFIG};
use hscomp::host::{self, ServerOptions};
use hscomp::remote::LogCollector;

#[tokio::main]
async fn main() {
    let options = ServerOptions::parse_args("logcollector");
    let config = match AppConfig::load_or_default(options.config_path(DEFAULT_LOG_CONFIG)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("logcollector: {err}");
            std::process::exit(1);
        }
    };
    let code = host::run_server(
        "logcollector",
        options,
        config.logger.clone(),
        &config.logging,
        LogCollector::new(),
    )
    .await;
    std::process::exit(code);
}
