use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use akatsuki::ai::GroqClient;
use akatsuki::chat::{ChatHub, ConnectionManager, ManagerSettings};
use akatsuki::datetime::{Clock, SystemClock};
use akatsuki::moderation::ModerationStore;
use akatsuki::web::WebServer;
use akatsuki::Config;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = akatsuki::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        akatsuki::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!("{} - real-time chat relay", config.server.app_name);
    info!(
        "Server configured on {}:{}",
        config.server.host, config.server.port
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(ModerationStore::load(&config.moderation.state_file, Arc::clone(&clock)).await);
    let hub = Arc::new(ChatHub::new(&config.admin.username, store, clock));

    let completion = match GroqClient::new(&config.ai) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create completion client: {e}");
            return ExitCode::FAILURE;
        }
    };
    if !completion.is_live() {
        info!("GROQ_API_KEY not set; AI responses will be simulated");
    }

    let manager = Arc::new(ConnectionManager::new(
        hub,
        Arc::new(completion),
        ManagerSettings::from_config(&config),
    ));

    let server = match WebServer::new(&config, manager) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Web server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
