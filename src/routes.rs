use axum::{
    Json,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    models::{
        Dimensions, GenerationRequest, GenerationResult, Job, JobStatus, Model,
        PanelGenerateRequest, PanelSettings, Preset, Sampler, SizePreset, SubmitError,
        SubmitResponse, RANDOM_SEED,
    },
    pipeline::{Pipeline, QueueSnapshot},
    store::{PresetBook, SettingsBook, StoreError},
};

const PANEL_STEPS: u32 = 28;
const PANEL_CFG: f64 = 5.0;

/// How long finished jobs stay fetchable.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

struct JobEntry {
    job: Job,
    image: Option<Bytes>,
}

/// In-memory job records. Finished jobs older than the retention window are
/// swept whenever a new job is recorded.
#[derive(Clone)]
pub struct JobStore {
    entries: Arc<RwLock<HashMap<Uuid, JobEntry>>>,
    retention: Duration,
}

impl JobStore {
    pub fn new(retention: Duration) -> Self {
        Self { entries: Arc::default(), retention }
    }

    pub fn insert(&self, job: Job) {
        self.sweep(Utc::now());
        self.entries.write().insert(job.id, JobEntry { job, image: None });
    }

    pub fn remove(&self, id: &Uuid) {
        self.entries.write().remove(id);
    }

    pub fn complete(&self, id: &Uuid, result: GenerationResult) {
        let mut guard = self.entries.write();
        let Some(entry) = guard.get_mut(id) else { return };
        entry.job.completed_at = Some(Utc::now());
        match result {
            GenerationResult::Success { image, seed } => {
                entry.job.status = JobStatus::Succeeded;
                entry.job.seed = Some(seed);
                entry.image = Some(image);
            }
            GenerationResult::Failure { reason } => {
                entry.job.status = JobStatus::Failed;
                entry.job.error = Some(reason);
            }
        }
    }

    /// The JSON view, with the image inlined as base64.
    pub fn job(&self, id: &Uuid) -> Option<Job> {
        let guard = self.entries.read();
        let entry = guard.get(id)?;
        let mut job = entry.job.clone();
        job.image_base64 = entry.image.as_ref().map(|image| STANDARD.encode(image));
        Some(job)
    }

    /// Raw image and seed of a succeeded job.
    pub fn image(&self, id: &Uuid) -> Option<(Bytes, u32)> {
        let guard = self.entries.read();
        let entry = guard.get(id)?;
        Some((entry.image.clone()?, entry.job.seed?))
    }

    /// Drops finished jobs completed at least `retention` before `now`.
    /// Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention = self.retention;
        let mut guard = self.entries.write();
        let before = guard.len();
        guard.retain(|_, entry| match entry.job.completed_at {
            Some(done) => (now - done).to_std().map_or(true, |age| age < retention),
            None => true,
        });
        let evicted = before - guard.len();
        if evicted > 0 {
            tracing::info!("🧹 Evicted {} finished jobs", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub jobs: JobStore,
    pub presets: PresetBook,
    pub settings: SettingsBook,
}

impl AppState {
    pub fn new(pipeline: Pipeline, presets: PresetBook, settings: SettingsBook) -> Self {
        Self { pipeline, jobs: JobStore::new(DEFAULT_JOB_RETENTION), presets, settings }
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.jobs = JobStore::new(retention);
        self
    }
}

pub enum ApiError {
    Submit(SubmitError),
    Store(StoreError),
    NotFound(String),
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self { ApiError::Submit(e) }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self { ApiError::Store(e) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Submit(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Store(e) => {
                tracing::error!("❌ Storage failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
            }
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Queue a request and record a job whose outcome is filled in by the sink.
fn enqueue(state: &AppState, request: GenerationRequest) -> Result<SubmitResponse, ApiError> {
    let dims = request.dimensions();
    let job_id = Uuid::new_v4();

    // Insert before submitting so a fast sink always finds the record.
    state.jobs.insert(Job {
        id: job_id,
        status: JobStatus::Queued,
        model: request.model,
        width: dims.width,
        height: dims.height,
        metadata_removed: request.strip_metadata,
        seed: None,
        error: None,
        image_base64: None,
        created_at: Utc::now(),
        completed_at: None,
    });

    let jobs = state.jobs.clone();
    let sink = move |result: GenerationResult| jobs.complete(&job_id, result);
    match state.pipeline.submit(request, sink) {
        Ok((_, queue_position)) => {
            tracing::info!("✅ Job {} queued at position {}", job_id, queue_position);
            Ok(SubmitResponse { job_id, queue_position })
        }
        Err(e) => {
            state.jobs.remove(&job_id);
            tracing::info!("⚠️ Rejected request: {}", e);
            Err(e.into())
        }
    }
}

pub async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    tracing::info!("🚀 Generation requested with model {}", body.model.id());
    let queued = enqueue(&state, body)?;
    Ok((StatusCode::ACCEPTED, Json(queued)))
}

pub async fn get_job(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Job>, ApiError> {
    state.jobs.job(&id).map(Json).ok_or_else(|| ApiError::NotFound(format!("job {id}")))
}

pub async fn get_job_image(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let (image, seed) = state
        .jobs
        .image(&id)
        .ok_or_else(|| ApiError::NotFound(format!("image for job {id}")))?;
    let headers = [
        (header::CONTENT_TYPE, "image/png".to_string()),
        (header::CONTENT_DISPOSITION, format!("attachment; filename=\"nai_{seed}.png\"")),
    ];
    Ok((StatusCode::OK, headers, image).into_response())
}

pub async fn get_queue(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.pipeline.snapshot())
}

#[derive(Debug, Serialize)]
pub struct CatalogItem {
    pub value: &'static str,
    pub label: &'static str,
}

pub async fn list_models() -> Json<Vec<CatalogItem>> {
    Json(Model::ALL.iter().map(|m| CatalogItem { value: m.id(), label: m.label() }).collect())
}

pub async fn list_samplers() -> Json<Vec<CatalogItem>> {
    Json(Sampler::ALL.iter().map(|s| CatalogItem { value: s.id(), label: s.label() }).collect())
}

#[derive(Debug, Serialize)]
pub struct SizeItem {
    pub preset: SizePreset,
    pub label: &'static str,
    #[serde(flatten)]
    pub dimensions: Dimensions,
}

pub async fn list_sizes() -> Json<Vec<SizeItem>> {
    Json(
        SizePreset::ALL
            .iter()
            .map(|p| SizeItem { preset: *p, label: p.label(), dimensions: p.dimensions() })
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
pub struct PresetQuery {
    #[serde(default)]
    pub q: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamedPreset {
    pub name: String,
    #[serde(flatten)]
    pub preset: Preset,
}

pub async fn list_presets(
    Path(user): Path<String>,
    Query(query): Query<PresetQuery>,
    State(state): State<AppState>,
) -> Json<Vec<NamedPreset>> {
    let presets = state.presets.list(&user);
    let named = match query.q {
        Some(q) => {
            let matching = state.presets.search(&user, &q);
            presets
                .into_iter()
                .filter(|(name, _)| matching.contains(name))
                .map(|(name, preset)| NamedPreset { name, preset })
                .collect()
        }
        None => presets.into_iter().map(|(name, preset)| NamedPreset { name, preset }).collect(),
    };
    Json(named)
}

pub async fn save_preset(
    Path((user, name)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<Preset>,
) -> Result<StatusCode, ApiError> {
    state.presets.save(&user, &name, &body)?;
    tracing::info!("💾 Saved preset '{}' for user {}", name, user);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_preset(
    Path((user, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    if state.presets.delete(&user, &name)? {
        tracing::info!("🗑️ Deleted preset '{}' for user {}", name, user);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("preset '{name}'")))
    }
}

pub async fn get_settings(
    Path(user): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PanelSettings>, ApiError> {
    Ok(Json(state.settings.get_or_create(&user)?))
}

pub async fn put_settings(
    Path(user): Path<String>,
    State(state): State<AppState>,
    Json(mut body): Json<PanelSettings>,
) -> Result<Json<PanelSettings>, ApiError> {
    let limits = state.pipeline.limits();
    let custom = Dimensions::custom(body.custom_width, body.custom_height, limits)?;
    body.custom_width = custom.width;
    body.custom_height = custom.height;
    state.settings.save(&user, &body)?;
    Ok(Json(body))
}

/// Combine a saved preset with the prompts typed into the panel.
fn merge_preset(
    preset: Option<&Preset>,
    prompt: String,
    negative: Option<String>,
) -> (String, Option<String>) {
    let negative = negative.filter(|n| !n.trim().is_empty());
    let Some(preset) = preset else { return (prompt, negative) };
    let prompt = format!("{}, {}", preset.prompt, prompt);
    let negative = match (preset.negative.is_empty(), negative) {
        (true, negative) => negative,
        (false, Some(n)) => Some(format!("{}, {}", preset.negative, n)),
        (false, None) => Some(preset.negative.clone()),
    };
    (prompt, negative)
}

pub async fn panel_generate(
    Path(user): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<PanelGenerateRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let settings = state.settings.get_or_create(&user)?;
    let preset = settings.preset.as_deref().and_then(|name| state.presets.get(&user, name));
    let (prompt, negative_prompt) = merge_preset(preset.as_ref(), body.prompt, body.negative);
    let dims = settings.dimensions();

    let request = GenerationRequest {
        negative_prompt,
        width: Some(dims.width),
        height: Some(dims.height),
        steps: Some(PANEL_STEPS),
        cfg_scale: Some(PANEL_CFG),
        sampler: Some(settings.sampler),
        seed: RANDOM_SEED,
        smea: Some(false),
        smea_dyn: Some(false),
        strip_metadata: settings.remove_metadata,
        ..GenerationRequest::new(prompt, settings.model)
    };
    tracing::info!("🎨 Panel generation for user {} with model {}", user, settings.model.id());
    let queued = enqueue(&state, request)?;
    Ok((StatusCode::ACCEPTED, Json(queued)))
}
