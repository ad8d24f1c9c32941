use std::time::Duration;

use clap::Parser;
use git_room::server::{RoomServer, ServerConfig};

#[derive(Parser)]
#[command(name = "git-room-server", about = "Presence server for Git Room")]
struct Args {
    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 4100)]
    port: u16,

    /// Frames buffered per connection
    #[arg(long, default_value_t = 64)]
    broadcast_capacity: usize,

    /// Remove participants silent for this many seconds (0 disables)
    #[arg(long, env = "GIT_ROOM_STALE_SECS", default_value_t = 0)]
    stale_secs: u64,

    /// Seconds between staleness sweeps
    #[arg(long, default_value_t = 60)]
    sweep_secs: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            broadcast_capacity: self.broadcast_capacity.max(1),
            stale_after: (self.stale_secs > 0).then(|| Duration::from_secs(self.stale_secs)),
            sweep_interval: Duration::from_secs(self.sweep_secs.max(1)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config();
    if let Some(stale_after) = config.stale_after {
        log::info!("Staleness sweep enabled ({}s)", stale_after.as_secs());
    }

    let server = RoomServer::new(config);
    server.run().await?;
    Ok(())
}
