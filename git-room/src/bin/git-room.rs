use std::path::PathBuf;

use clap::Parser;
use git_room::changes::ChangeTracker;
use git_room::client::RoomClient;
use git_room::config::Settings;
use git_room::view::render_room;

#[derive(Parser)]
#[command(name = "git-room", about = "Share which files you are changing with your team")]
struct Args {
    /// Settings file
    #[arg(long, short, env = "GIT_ROOM_CONFIG", default_value = "git-room.toml")]
    config: PathBuf,

    /// Working copy to watch
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Room to join (overrides the settings file)
    #[arg(long)]
    room: Option<String>,

    /// Display name (overrides the settings file)
    #[arg(long)]
    username: Option<String>,

    /// Server URL (overrides the settings file)
    #[arg(long)]
    server: Option<String>,

    /// Branch to diff against (overrides the settings file)
    #[arg(long)]
    branch: Option<String>,

    /// Seconds between publications (overrides the settings file)
    #[arg(long)]
    refresh: Option<u64>,

    /// Hide your name from other participants
    #[arg(long)]
    anonymous: bool,
}

impl Args {
    fn settings(&self) -> Settings {
        let mut settings = Settings::load_or_default(&self.config);
        if let Some(room) = &self.room {
            settings.room_name = room.clone();
        }
        if let Some(username) = &self.username {
            settings.username = username.clone();
        }
        if let Some(server) = &self.server {
            settings.server_url = server.clone();
        }
        if let Some(branch) = &self.branch {
            settings.git_branch = branch.clone();
        }
        if let Some(refresh) = self.refresh {
            settings.refresh_interval = refresh;
        }
        settings.anonymous_mode |= self.anonymous;
        settings.normalized()
    }
}

fn init_logging() {
    let default_level = if std::env::var("GIT_ROOM_DEBUG").is_ok_and(|v| v == "1") {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args = Args::parse();
    let mut settings = args.settings();
    if !settings.is_configured() {
        log::warn!("No room configured; set room_name in {} or pass --room", args.config.display());
    }

    let mut tracker = ChangeTracker::new(Some(args.workspace.clone()), settings.git_branch.clone());
    let client = RoomClient::new(settings.client_options());
    let mut views = client.subscribe_state().await;
    let mut connection = client.subscribe_connection().await;

    client.connect().await;

    let mut participants = client.latest_state().await;
    let mut state = client.connection_state().await;
    print!("{}", render_room(&participants, state));

    let mut ticker = tokio::time::interval(settings.refresh_period());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reloaded = args.settings();
                if reloaded != settings {
                    log::info!("Settings changed; applying");
                    apply_settings(&client, &mut tracker, &settings, &reloaded).await;
                    if reloaded.refresh_period() != settings.refresh_period() {
                        ticker = tokio::time::interval(reloaded.refresh_period());
                        ticker.tick().await;
                    }
                    settings = reloaded;
                }
                let files = tracker.changed_files().await;
                log::debug!("Publishing {} changed files", files.len());
                client.publish_local_changes(files).await;
            }
            Some(view) = views.recv() => {
                participants = view;
                println!();
                print!("{}", render_room(&participants, state));
            }
            Some(next) = connection.recv() => {
                state = next;
                println!();
                print!("{}", render_room(&participants, state));
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("Failed to listen for Ctrl-C: {e}");
                }
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Push changed settings into the running tracker and client.
async fn apply_settings(
    client: &RoomClient,
    tracker: &mut ChangeTracker,
    current: &Settings,
    reloaded: &Settings,
) {
    if reloaded.git_branch != current.git_branch {
        tracker.set_branch(reloaded.git_branch.clone());
    }
    let options = reloaded.client_options();
    if options != current.client_options() {
        if reloaded.is_configured() {
            client.update_options(options).await;
        } else {
            log::warn!("Room name removed from settings; disconnecting");
            client.disconnect().await;
        }
    }
}
