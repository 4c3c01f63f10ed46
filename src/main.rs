use conduit::config::Config;
use conduit::message::{QualityRequirement, TaskType};
use conduit::selection::ModelSelectionRequest;
use conduit::ModelSelectionService;

/// Thin demo binary: wires a `Config::from_env()`-built service, connects
/// whatever transports are reachable, and runs one selection request
/// end-to-end for manual smoke-testing (SPEC_FULL §11 "Demo binary"). Not a
/// host integration — the editor plugin embeds [`conduit::ModelSelectionService`]
/// directly rather than shelling out to this binary.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("conduit starting");

    let config = Config::from_env();
    let service = ModelSelectionService::new(config);

    if let Err(e) = service.initialize().await {
        tracing::error!("no transport could be reached: {e}");
        return Err(e.into());
    }

    let request = ModelSelectionRequest {
        task_type: TaskType::Chat,
        quality_requirement: QualityRequirement::Medium,
        max_cost: None,
        context_length: None,
        preferred_providers: None,
        timeout_ms: None,
        user_preferences: None,
    };

    match service.select_model(request).await {
        Ok(response) => {
            tracing::info!(
                model = %response.selected_model.id,
                confidence = response.selection_metadata.confidence_score,
                "selection complete"
            );
        }
        Err(e) => tracing::error!("selection failed: {e}"),
    }

    service.disconnect().await?;
    tracing::info!("conduit shutting down");
    Ok(())
}
