//! Main Entrypoint for the Assessor API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Loading prompts, the question bank and the competency map.
//! 4. Building the session orchestrator and the Axum router.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use assessor_api::{config::Config, db::Db, router::create_router, state::AppState};
use assessor_core::{
    llm_client::OpenAICompatibleClient,
    media::{MediaLoader, PublicUrlResolver},
    orchestrator::{OrchestratorParts, SessionOrchestrator},
    prompt::PromptSet,
    question_bank::QuestionBank,
    verdict::CompetencyTable,
};
use async_openai::config::OpenAIConfig;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        return;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    let entries = fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts directory {}", prompts_path.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let db = Arc::new(Db::connect(&config.database_url).await?);
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Load Assessment Content ---
    let prompts = PromptSet::from_map(&load_prompts(&config.prompts_path)?)?;
    let bank = QuestionBank::load(&config.data_path)?;
    let competency = CompetencyTable::load(&config.data_path.join("competency_map.json"))?;
    info!(
        roles = competency.role_names().count(),
        data_path = %config.data_path.display(),
        "Assessment content loaded."
    );

    // --- 5. Build the Orchestrator ---
    let api_key = config
        .api_key()
        .context("No API key configured for the selected provider")?;
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(config.provider.api_base());
    info!(provider = ?config.provider, "Using OpenAI-compatible chat client.");
    let llm = Arc::new(OpenAICompatibleClient::new(
        openai_config,
        config.chat_model.clone(),
    ));

    let orchestrator = SessionOrchestrator::new(
        OrchestratorParts {
            llm,
            sessions: db.clone(),
            profiles: db,
            resolver: Arc::new(PublicUrlResolver::new(config.public_base_url.clone())),
            bank: Arc::new(bank),
            competency: Arc::new(competency),
            prompts: Arc::new(prompts),
        },
        config.orchestrator_config(),
    )
    .with_media_loader(MediaLoader::default().with_local_root(config.data_path.clone()));

    let app_state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        config: Arc::new(config.clone()),
    });

    // --- 6. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 7. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        public_base_url = %config.public_base_url,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
