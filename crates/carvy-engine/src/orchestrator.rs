//! Request pipeline: cache check, then generate or read, refine, publish.
//!
//! Each call runs its stages strictly in sequence and stops at the first
//! failure. Nothing is retried. Concurrent calls for the same key are not
//! coordinated; the store's write-once publish decides which one wins.

use std::io::Read;
use std::sync::Arc;

use carvy_contracts::prompts::STUDIO_PROMPT_TEMPLATE_VERSION;
use carvy_contracts::{
    JournalEvent, PipelineOutcome, RequestJournal, Stage, VehicleImageRequest, Workflow,
};
use tracing::{error, info, info_span, warn};

use crate::error::{PipelineError, Result};
use crate::generation::GenerationClient;
use crate::refine::BackgroundRefiner;
use crate::store::ArtifactStoreClient;
use crate::support::sha256_hex;

#[derive(Clone)]
pub struct Orchestrator {
    generation: GenerationClient,
    refiner: Arc<BackgroundRefiner>,
    store: ArtifactStoreClient,
    journal: Option<RequestJournal>,
}

impl Orchestrator {
    pub fn new(
        generation: GenerationClient,
        refiner: Arc<BackgroundRefiner>,
        store: ArtifactStoreClient,
    ) -> Self {
        Self {
            generation,
            refiner,
            store,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: RequestJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn generate_and_process(&self, request: &VehicleImageRequest) -> Result<PipelineOutcome> {
        let request_id = new_request_id();
        let key = request.cache_key();
        let span = info_span!("generate_and_process", %request_id, %key);
        let _entered = span.enter();

        info!("cache key derived");
        self.journal(
            &request_id,
            &key,
            JournalEvent::RequestStarted {
                workflow: Workflow::Generate,
                prompt_template_version: Some(STUDIO_PROMPT_TEMPLATE_VERSION),
                vehicle: Some(request.clone()),
            },
        );

        if let Some(url) = self.store.exists(&key) {
            info!(%url, "cache hit; skipping generation");
            self.journal(&request_id, &key, JournalEvent::CacheHit { url: url.clone() });
            return Ok(PipelineOutcome::Cached { url });
        }
        info!(backend = self.generation.backend_name(), "cache miss; generating");

        let result = self
            .generation
            .generate(request)
            .map_err(PipelineError::from)
            .and_then(|raw| {
                self.stage_completed(&request_id, &key, Stage::Generating, raw.len());
                self.refine_and_publish(&request_id, &key, &raw, None)
            });
        self.finish(&request_id, &key, result)
    }

    /// Processes caller-supplied bytes under an explicit name. An existing
    /// object with that name is reported as a conflict, never replaced.
    pub fn upload_and_process<R: Read>(
        &self,
        file_name: &str,
        mut source: R,
    ) -> Result<PipelineOutcome> {
        let request_id = new_request_id();
        let key = file_name.to_string();
        let span = info_span!("upload_and_process", %request_id, %key);
        let _entered = span.enter();

        self.journal(
            &request_id,
            &key,
            JournalEvent::RequestStarted {
                workflow: Workflow::Upload,
                prompt_template_version: None,
                vehicle: None,
            },
        );
        if key.trim().is_empty() {
            let err = PipelineError::Input("file_name is required".to_string());
            return self.finish(&request_id, &key, Err(err));
        }

        if let Some(url) = self.store.exists(&key) {
            warn!(%url, "target name already exists");
            self.journal(&request_id, &key, JournalEvent::Conflict { url: url.clone() });
            return Ok(PipelineOutcome::conflict(url));
        }

        let result = read_payload(&mut source).and_then(|raw| {
            self.stage_completed(&request_id, &key, Stage::Reading, raw.len());
            self.refine_and_publish(&request_id, &key, &raw, Some(key.clone()))
        });
        self.finish(&request_id, &key, result)
    }

    fn refine_and_publish(
        &self,
        request_id: &str,
        key: &str,
        raw: &[u8],
        file_name: Option<String>,
    ) -> Result<PipelineOutcome> {
        info!(backend = self.refiner.backend_name(), "removing background");
        let refined = self.refiner.refine(raw)?;
        self.stage_completed(request_id, key, Stage::Refining, refined.len());

        info!(store = self.store.backend_name(), "publishing refined png");
        let url = self.store.publish(key, &refined)?;
        self.journal(
            request_id,
            key,
            JournalEvent::ArtifactCreated {
                url: url.clone(),
                bytes: refined.len(),
                sha256: sha256_hex(&refined),
            },
        );
        Ok(PipelineOutcome::Created { file_name, url })
    }

    fn finish(
        &self,
        request_id: &str,
        key: &str,
        result: Result<PipelineOutcome>,
    ) -> Result<PipelineOutcome> {
        match &result {
            Ok(outcome) => {
                info!(status = outcome.status(), url = outcome.url(), "request complete")
            }
            Err(err) => {
                error!(stage = %err.stage(), code = err.code(), error = %err, "request failed");
                self.journal(
                    request_id,
                    key,
                    JournalEvent::RequestFailed {
                        stage: err.stage(),
                        code: err.code().to_string(),
                        message: err.to_string(),
                    },
                );
            }
        }
        result
    }

    fn stage_completed(&self, request_id: &str, key: &str, stage: Stage, bytes: usize) {
        info!(%stage, bytes, "stage completed");
        self.journal(request_id, key, JournalEvent::StageCompleted { stage, bytes });
    }

    fn journal(&self, request_id: &str, key: &str, event: JournalEvent) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal.record(request_id, key, event) {
            warn!(error = %err, "failed to append journal entry");
        }
    }
}

fn read_payload<R: Read>(source: &mut R) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    source
        .read_to_end(&mut raw)
        .map_err(|err| PipelineError::Input(format!("could not read image payload: {err}")))?;
    if raw.is_empty() {
        return Err(PipelineError::Input("image payload is empty".to_string()));
    }
    Ok(raw)
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}
