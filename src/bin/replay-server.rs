//! Replay API Server Binary
//!
//! Run with: `cargo run --bin replay-server`

use bar_replay::{run_server, ReplayConfig, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Tracing is initialized in run_server(); RUST_LOG controls the level:
    //   RUST_LOG=debug cargo run --bin replay-server
    //   RUST_LOG=bar_replay::window=debug cargo run --bin replay-server  (window reloads only)

    let replay = match std::env::var("REPLAY_CONFIG") {
        Ok(path) => ReplayConfig::from_json_file(path)?,
        Err(_) => ReplayConfig::from_env(),
    };
    replay.validate()?;
    let config = ServerConfig::from_env();

    println!("Starting Replay API Server...");
    println!("   Host: {}", config.host);
    println!("   Port: {}", config.port);
    println!("   Data: {} ({} bars)", replay.data_dir.display(), replay.timeframe);
    if let Some(path) = &config.state_file {
        println!("   State file: {}", path.display());
    }
    println!();
    println!("Available endpoints:");
    println!("  GET  /health                    - Health check");
    println!("  GET  /symbols                   - Available and loaded symbols");
    println!("  POST /session                   - Start session {{symbol, start_index}}");
    println!("  POST /session/restore           - Restore persisted session");
    println!("  GET  /session/state             - Snapshot session state");
    println!("  POST /session/symbol/:symbol    - Switch active symbol");
    println!("  POST /playback/play|pause|toggle");
    println!("  POST /playback/speed            - Set speed {{ms}}");
    println!("  POST /playback/next             - Step one bar");
    println!("  POST /playback/jump-next-day    - Seek to next session open");
    println!("  GET  /status                    - Playback status");
    println!("  GET  /bars?from=&count=         - Bar range");
    println!("  GET  /stream                    - SSE event stream");
    println!();

    run_server(config, replay).await?;

    Ok(())
}
