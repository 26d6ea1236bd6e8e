use std::sync::Arc;
use anyhow::{Context, Result};
use parley::config::ServerConfig;
use parley::server::ServerState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/server.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: parley_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            other => eprintln!("Warning: ignoring unknown argument {}", other),
        }
        i += 1;
    }

    let config = ServerConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {}", conf_file))?;

    let bind = config.bind_addr();
    let state = Arc::new(ServerState::new(config).await?);
    tracing::info!("[parley] [started] data_dir={}", state.config.data_dir);

    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("[parley] [signal_failed] error={}", e);
            return;
        }
        tracing::info!("[parley] [shutdown] signal received");
        signal_state.shutdown();
    });

    ServerState::run(state, &bind).await?;
    Ok(())
}
