//! Blockflow API server
//!
//! Run with: cargo run --bin blockflowd
//! Configuration is read from blockflow.config.json when present.

#[tokio::main]
async fn main() {
    blockflow::init_logging();

    let config = match blockflow::config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = blockflow::http::start_server(config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
