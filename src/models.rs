use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Sizes are snapped to this grid when a user picks a custom size.
pub const SIZE_STEP: u32 = 64;
/// Smallest side accepted for a custom panel size.
pub const MIN_CUSTOM_SIDE: u32 = 320;
/// Seed value that asks for a random seed. Any negative seed is treated the same way.
pub const RANDOM_SEED: i64 = -1;
/// Largest seed the generation API accepts.
pub const MAX_SEED: u32 = 2_147_483_647;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Model {
    #[serde(rename = "nai-diffusion-4-5-full")]
    V45Full,
    #[serde(rename = "nai-diffusion-4-5-curated")]
    V45Curated,
    #[serde(rename = "nai-diffusion-4-full")]
    V4Full,
    #[serde(rename = "nai-diffusion-4-curated")]
    V4Curated,
    #[serde(rename = "nai-diffusion-4-curated-preview")]
    V4CuratedPreview,
    #[default]
    #[serde(rename = "nai-diffusion-3")]
    V3,
    #[serde(rename = "nai-diffusion-3-inpainting")]
    V3Inpainting,
    #[serde(rename = "nai-diffusion-2")]
    V2,
    #[serde(rename = "nai-diffusion")]
    V1,
    #[serde(rename = "safe-diffusion")]
    V1Curated,
    #[serde(rename = "nai-diffusion-furry")]
    V1Furry,
    #[serde(rename = "nai-diffusion-furry-v3")]
    V3Furry,
}

/// The two request shapes the generation API accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Structured captions, no SMEA, fixed noise schedule.
    V4,
    /// Plain string prompts, SMEA on by default.
    Legacy,
}

impl Model {
    pub const ALL: [Model; 12] = [
        Model::V45Full,
        Model::V45Curated,
        Model::V4Full,
        Model::V4Curated,
        Model::V4CuratedPreview,
        Model::V3,
        Model::V3Inpainting,
        Model::V2,
        Model::V1,
        Model::V1Curated,
        Model::V1Furry,
        Model::V3Furry,
    ];

    /// Identifier sent to the API.
    pub fn id(self) -> &'static str {
        match self {
            Model::V45Full => "nai-diffusion-4-5-full",
            Model::V45Curated => "nai-diffusion-4-5-curated",
            Model::V4Full => "nai-diffusion-4-full",
            Model::V4Curated => "nai-diffusion-4-curated",
            Model::V4CuratedPreview => "nai-diffusion-4-curated-preview",
            Model::V3 => "nai-diffusion-3",
            Model::V3Inpainting => "nai-diffusion-3-inpainting",
            Model::V2 => "nai-diffusion-2",
            Model::V1 => "nai-diffusion",
            Model::V1Curated => "safe-diffusion",
            Model::V1Furry => "nai-diffusion-furry",
            Model::V3Furry => "nai-diffusion-furry-v3",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Model::V45Full => "🌟 V4.5 Full",
            Model::V45Curated => "✨ V4.5 Curated",
            Model::V4Full => "🎯 V4 Full",
            Model::V4Curated => "📌 V4 Curated",
            Model::V4CuratedPreview => "👁️ V4 Preview",
            Model::V3 => "🎨 V3 Anime",
            Model::V3Inpainting => "🔧 V3 Inpainting",
            Model::V2 => "🌸 V2 Anime",
            Model::V1 => "🎯 V1 Anime",
            Model::V1Curated => "✅ V1 Curated",
            Model::V1Furry => "🦊 V1 Furry",
            Model::V3Furry => "🐺 V3 Furry",
        }
    }

    /// Single place where the payload family is decided.
    pub fn family(self) -> ModelFamily {
        if self.id().starts_with("nai-diffusion-4") { ModelFamily::V4 } else { ModelFamily::Legacy }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sampler {
    #[default]
    #[serde(rename = "k_euler_ancestral")]
    KEulerAncestral,
    #[serde(rename = "k_euler")]
    KEuler,
    #[serde(rename = "k_dpmpp_2m")]
    KDpmpp2m,
    #[serde(rename = "k_dpmpp_2s_ancestral")]
    KDpmpp2sAncestral,
    #[serde(rename = "k_dpmpp_sde")]
    KDpmppSde,
    #[serde(rename = "ddim_v3")]
    DdimV3,
}

impl Sampler {
    pub const ALL: [Sampler; 6] = [
        Sampler::KEulerAncestral,
        Sampler::KEuler,
        Sampler::KDpmpp2m,
        Sampler::KDpmpp2sAncestral,
        Sampler::KDpmppSde,
        Sampler::DdimV3,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Sampler::KEulerAncestral => "k_euler_ancestral",
            Sampler::KEuler => "k_euler",
            Sampler::KDpmpp2m => "k_dpmpp_2m",
            Sampler::KDpmpp2sAncestral => "k_dpmpp_2s_ancestral",
            Sampler::KDpmppSde => "k_dpmpp_sde",
            Sampler::DdimV3 => "ddim_v3",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Sampler::KEulerAncestral => "Euler Ancestral",
            Sampler::KEuler => "Euler",
            Sampler::KDpmpp2m => "DPM++ 2M",
            Sampler::KDpmpp2sAncestral => "DPM++ 2S Ancestral",
            Sampler::KDpmppSde => "DPM++ SDE",
            Sampler::DdimV3 => "DDIM V3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self { Self { width, height } }

    pub fn pixels(self) -> u64 { u64::from(self.width) * u64::from(self.height) }

    /// Validate a user-entered custom size and floor both sides to [`SIZE_STEP`].
    pub fn custom(width: u32, height: u32, limits: &SizeLimits) -> Result<Self, SubmitError> {
        if !(MIN_CUSTOM_SIDE..=limits.max_width).contains(&width)
            || !(MIN_CUSTOM_SIDE..=limits.max_height).contains(&height)
        {
            return Err(SubmitError::InvalidDimensions { width, height });
        }
        let requested = Self::new(width, height);
        limits.check(requested)?;
        Ok(Self::new(width / SIZE_STEP * SIZE_STEP, height / SIZE_STEP * SIZE_STEP))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizePreset {
    PortraitS,
    PortraitM,
    LandscapeS,
    LandscapeM,
    SquareS,
    SquareM,
    SquareL,
}

impl SizePreset {
    pub const ALL: [SizePreset; 7] = [
        SizePreset::PortraitM,
        SizePreset::PortraitS,
        SizePreset::LandscapeM,
        SizePreset::LandscapeS,
        SizePreset::SquareS,
        SizePreset::SquareM,
        SizePreset::SquareL,
    ];

    pub fn dimensions(self) -> Dimensions {
        match self {
            SizePreset::PortraitS => Dimensions::new(512, 768),
            SizePreset::PortraitM => Dimensions::new(832, 1216),
            SizePreset::LandscapeS => Dimensions::new(768, 512),
            SizePreset::LandscapeM => Dimensions::new(1216, 832),
            SizePreset::SquareS => Dimensions::new(512, 512),
            SizePreset::SquareM => Dimensions::new(768, 768),
            SizePreset::SquareL => Dimensions::new(832, 832),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SizePreset::PortraitS => "📱 Portrait small 512×768",
            SizePreset::PortraitM => "📱 Portrait 832×1216",
            SizePreset::LandscapeS => "🖼️ Landscape small 768×512",
            SizePreset::LandscapeM => "🖼️ Landscape 1216×832",
            SizePreset::SquareS => "⬜ Square 512×512",
            SizePreset::SquareM => "◻️ Square 768×768",
            SizePreset::SquareL => "◼ Square 832×832",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeLimits {
    pub max_pixels: u64,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self { max_pixels: 832 * 1216, max_width: 1216, max_height: 1216 }
    }
}

impl SizeLimits {
    pub fn check(&self, dims: Dimensions) -> Result<(), SubmitError> {
        if dims.width == 0 || dims.height == 0 {
            return Err(SubmitError::InvalidDimensions { width: dims.width, height: dims.height });
        }
        if dims.pixels() > self.max_pixels
            || dims.width > self.max_width
            || dims.height > self.max_height
        {
            return Err(SubmitError::SizeLimitExceeded {
                width: dims.width,
                height: dims.height,
                limits: *self,
            });
        }
        Ok(())
    }
}

/// Rejections raised by `submit` before anything is queued.
#[derive(Debug, Error, PartialEq)]
pub enum SubmitError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("invalid size {width}×{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error(
        "size {width}×{height} exceeds the limit (max {} pixels, {}×{} per side)",
        .limits.max_pixels,
        .limits.max_width,
        .limits.max_height
    )]
    SizeLimitExceeded { width: u32, height: u32, limits: SizeLimits },
    #[error("seed {0} is out of range (0..={}, or negative for random)", MAX_SEED)]
    SeedOutOfRange(i64),
}

fn random_seed() -> i64 { RANDOM_SEED }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub model: Model,
    #[serde(default)]
    pub size_preset: Option<SizePreset>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub cfg_scale: Option<f64>,
    #[serde(default)]
    pub sampler: Option<Sampler>,
    #[serde(default = "random_seed")]
    pub seed: i64,
    #[serde(default)]
    pub smea: Option<bool>,
    #[serde(default)]
    pub smea_dyn: Option<bool>,
    #[serde(default)]
    pub strip_metadata: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model: Model) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            model,
            size_preset: None,
            width: None,
            height: None,
            steps: None,
            cfg_scale: None,
            sampler: None,
            seed: RANDOM_SEED,
            smea: None,
            smea_dyn: None,
            strip_metadata: false,
        }
    }

    /// Preset first, then an explicit width *and* height, then the model default.
    pub fn dimensions(&self) -> Dimensions {
        if let Some(preset) = self.size_preset {
            return preset.dimensions();
        }
        match (self.width, self.height) {
            (Some(width), Some(height)) => Dimensions::new(width, height),
            _ => {
                let defaults = crate::payload::ModelDefaults::for_model(self.model);
                Dimensions::new(defaults.width, defaults.height)
            }
        }
    }

    pub fn validate(&self, limits: &SizeLimits) -> Result<Dimensions, SubmitError> {
        if self.prompt.trim().is_empty() {
            return Err(SubmitError::EmptyPrompt);
        }
        if self.seed > i64::from(MAX_SEED) {
            return Err(SubmitError::SeedOutOfRange(self.seed));
        }
        let dims = self.dimensions();
        limits.check(dims)?;
        Ok(dims)
    }
}

/// Outcome handed to a submission's sink, exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationResult {
    Success { image: bytes::Bytes, seed: u32 },
    Failure { reason: String },
}

impl GenerationResult {
    pub fn is_success(&self) -> bool { matches!(self, GenerationResult::Success { .. }) }
}

// --- HTTP bodies ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Preset {
    pub prompt: String,
    #[serde(default)]
    pub negative: String,
}

/// Per-user panel state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PanelSettings {
    #[serde(default)]
    pub model: Model,
    /// `None` selects the custom dimensions below.
    #[serde(default = "default_panel_size")]
    pub size_preset: Option<SizePreset>,
    #[serde(default)]
    pub sampler: Sampler,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub remove_metadata: bool,
    #[serde(default = "default_custom_width")]
    pub custom_width: u32,
    #[serde(default = "default_custom_height")]
    pub custom_height: u32,
}

fn default_panel_size() -> Option<SizePreset> { Some(SizePreset::PortraitS) }
fn default_custom_width() -> u32 { 512 }
fn default_custom_height() -> u32 { 768 }

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            model: Model::default(),
            size_preset: default_panel_size(),
            sampler: Sampler::default(),
            preset: None,
            remove_metadata: false,
            custom_width: default_custom_width(),
            custom_height: default_custom_height(),
        }
    }
}

impl PanelSettings {
    pub fn dimensions(&self) -> Dimensions {
        match self.size_preset {
            Some(preset) => preset.dimensions(),
            None => Dimensions::new(self.custom_width, self.custom_height),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PanelGenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub queue_position: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Succeeded,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub model: Model,
    pub width: u32,
    pub height: u32,
    pub metadata_removed: bool,
    pub seed: Option<u32>,
    pub error: Option<String>,
    pub image_base64: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
