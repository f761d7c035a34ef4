//! Message router process

use hscomp::config::{AppConfig, DEFAULT_ROUTER_CONFIG};
use hscomp::host::{self, ServerOptions};
use hscomp::remote::ServiceRouter;

#[tokio::main]
async fn main() {
    let options = ServerOptions::parse_args("mtrouter");
    let config = match AppConfig::load_or_default(options.config_path(DEFAULT_ROUTER_CONFIG)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("mtrouter: {err}");
            std::process::exit(1);
        }
    };
    let code = host::run_server(
        "mtrouter",
        options,
        config.router.clone(),
        &config.logging,
        ServiceRouter::new(),
    )
    .await;
    std::process::exit(code);
}
