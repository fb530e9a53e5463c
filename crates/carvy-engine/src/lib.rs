pub mod config;
pub mod error;
pub mod generation;
pub mod orchestrator;
pub mod refine;
pub mod store;
mod support;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use carvy_contracts::RequestJournal;
use tracing::info;

pub use config::EngineConfig;
pub use error::{GenerateError, PipelineError, RefineError, StoreError};
pub use generation::{GenerationClient, ImageGenerator};
pub use orchestrator::Orchestrator;
pub use refine::{init_shared_refiner, BackgroundRefiner, MattingBackend, MattingParams};
pub use store::{ArtifactStore, ArtifactStoreClient};

use generation::{DryrunGenerator, GeminiGenerator};
use refine::{CornerKeyMatting, RembgHttpBackend};
use store::{FsArtifactStore, SupabaseStore};

/// Gemini generation, rembg matting and Supabase storage.
pub fn live_orchestrator(config: &EngineConfig) -> Result<Orchestrator> {
    let generator = GeminiGenerator::new(config.require_gemini()?.clone())?;
    let store = SupabaseStore::new(config.require_supabase()?)?;
    let rembg = config.rembg.clone();
    let refiner = init_shared_refiner(move || {
        Ok(BackgroundRefiner::new(Box::new(RembgHttpBackend::new(&rembg)?)))
    })?;
    info!(
        generator = "gemini",
        matting = refiner.backend_name(),
        matting_model = %config.rembg.model_name,
        store = "supabase",
        "pipeline backends ready"
    );
    attach_journal(
        Orchestrator::new(
            GenerationClient::new(Arc::new(generator)),
            refiner,
            ArtifactStoreClient::new(Arc::new(store)),
        ),
        config,
    )
}

/// Offline pipeline writing refined images under `out_dir`.
pub fn dryrun_orchestrator(config: &EngineConfig, out_dir: &Path) -> Result<Orchestrator> {
    let store = FsArtifactStore::new(out_dir, None)?;
    let refiner = init_shared_refiner(|| Ok(BackgroundRefiner::new(Box::new(CornerKeyMatting))))?;
    info!(out_dir = %out_dir.display(), "dryrun pipeline backends ready");
    attach_journal(
        Orchestrator::new(
            GenerationClient::new(Arc::new(DryrunGenerator::new())),
            refiner,
            ArtifactStoreClient::new(Arc::new(store)),
        ),
        config,
    )
}

fn attach_journal(orchestrator: Orchestrator, config: &EngineConfig) -> Result<Orchestrator> {
    let Some(path) = &config.events_path else {
        return Ok(orchestrator);
    };
    let session_id = uuid::Uuid::new_v4().to_string();
    let journal = RequestJournal::open(path, session_id.clone())?;
    info!(path = %path.display(), %session_id, "request journal enabled");
    Ok(orchestrator.with_journal(journal))
}
