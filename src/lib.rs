//! Queue prompts for the NovelAI image API, generate them one at a time, and
//! optionally scrub metadata from the returned images.

pub mod config;
pub mod image_processor;
pub mod models;
pub mod nai;
pub mod payload;
pub mod pipeline;
pub mod routes;
pub mod store;

use axum::{Router, routing::{get, post, put}};
use tower_http::cors::{CorsLayer, Any};

use crate::routes::{
    AppState, delete_preset, generate, get_job, get_job_image, get_queue, get_settings, list_models,
    list_presets, list_samplers, list_sizes, panel_generate, put_settings, save_preset,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/image", get(get_job_image))
        .route("/api/queue", get(get_queue))
        .route("/api/models", get(list_models))
        .route("/api/samplers", get(list_samplers))
        .route("/api/sizes", get(list_sizes))
        .route("/api/users/:user/presets", get(list_presets))
        .route("/api/users/:user/presets/:name", put(save_preset).delete(delete_preset))
        .route("/api/users/:user/settings", get(get_settings).put(put_settings))
        .route("/api/users/:user/generate", post(panel_generate))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}
