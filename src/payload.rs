//! Request bodies for the `/ai/generate-image` endpoint.
//!
//! Everything here is pure: given a [`GenerationRequest`] and an already
//! resolved seed, [`build_payload`] always produces the same document.

use rand::Rng;
use serde::Serialize;
use serde_with::skip_serializing_none;

use crate::models::{GenerationRequest, Model, ModelFamily, Sampler, MAX_SEED};

const QUALITY_PREFIX: &str = "masterpiece, best quality, ";
const DEFAULT_NEGATIVE_PROMPT: &str = "lowres, bad anatomy, bad hands, text, error, missing fingers, extra digit, fewer digits, cropped, worst quality, low quality, normal quality, jpeg artifacts, signature, watermark, username, blurry";

/// Per-model defaults, derived from the model family.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDefaults {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    pub sampler: Sampler,
    pub steps: u32,
    pub negative_prompt: &'static str,
    pub smea: bool,
    pub smea_dyn: bool,
    pub params_version: Option<u8>,
    pub use_coords: Option<bool>,
    pub noise_schedule: Option<&'static str>,
}

impl ModelDefaults {
    pub fn for_model(model: Model) -> Self {
        let base = Self {
            width: 832,
            height: 1216,
            scale: 5.0,
            sampler: Sampler::KEulerAncestral,
            steps: 28,
            negative_prompt: DEFAULT_NEGATIVE_PROMPT,
            smea: true,
            smea_dyn: true,
            params_version: None,
            use_coords: None,
            noise_schedule: None,
        };
        match model.family() {
            ModelFamily::V4 => Self {
                scale: 7.0,
                smea: false,
                smea_dyn: false,
                params_version: Some(3),
                use_coords: Some(true),
                noise_schedule: Some("karras"),
                ..base
            },
            ModelFamily::Legacy => base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Caption {
    pub base_caption: String,
    pub char_captions: Vec<serde_json::Value>,
}

/// Structured prompt used by the V4 family.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct V4Prompt {
    pub caption: Caption,
    pub use_coords: bool,
    pub use_order: bool,
}

impl V4Prompt {
    pub fn new(text: &str) -> Self {
        Self {
            caption: Caption { base_caption: text.to_string(), char_captions: Vec::new() },
            use_coords: true,
            use_order: true,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameters {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    pub sampler: Sampler,
    pub steps: u32,
    pub seed: u32,
    pub n_samples: u32,
    #[serde(rename = "ucPreset")]
    pub uc_preset: u32,
    #[serde(rename = "qualityToggle")]
    pub quality_toggle: bool,
    pub dynamic_thresholding: bool,
    pub controlnet_strength: u32,
    pub legacy: bool,
    pub add_original_image: bool,
    pub negative_prompt: String,
    pub sm: bool,
    pub sm_dyn: bool,
    pub params_version: Option<u8>,
    pub use_coords: Option<bool>,
    pub noise_schedule: Option<&'static str>,
    pub v4_prompt: Option<V4Prompt>,
    pub v4_negative_prompt: Option<V4Prompt>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadDocument {
    pub input: String,
    pub model: Model,
    pub action: &'static str,
    pub parameters: Parameters,
}

impl PayloadDocument {
    pub fn has_v4_captions(&self) -> bool {
        self.parameters.v4_prompt.is_some() || self.parameters.v4_negative_prompt.is_some()
    }

    /// Copy of this document with the structured captions dropped, leaving the
    /// plain `input`/`negative_prompt` strings as the only prompt fields.
    pub fn without_v4_captions(&self) -> Self {
        let mut degraded = self.clone();
        degraded.parameters.v4_prompt = None;
        degraded.parameters.v4_negative_prompt = None;
        degraded
    }
}

/// Negative seeds draw a fresh random seed, anything else is used verbatim.
/// `GenerationRequest::validate` keeps explicit seeds within `0..=MAX_SEED`.
pub fn resolve_seed<R: Rng + ?Sized>(requested: i64, rng: &mut R) -> u32 {
    if requested < 0 {
        return rng.gen_range(0..=MAX_SEED);
    }
    u32::try_from(requested).unwrap_or(u32::MAX)
}

pub fn build_payload(req: &GenerationRequest, seed: u32) -> PayloadDocument {
    let defaults = ModelDefaults::for_model(req.model);
    let family = req.model.family();
    let dims = req.dimensions();

    let negative = match req.negative_prompt.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => defaults.negative_prompt.to_string(),
    };
    let prompt = match family {
        ModelFamily::Legacy => format!("{QUALITY_PREFIX}{}", req.prompt),
        ModelFamily::V4 => req.prompt.clone(),
    };

    let (sm, sm_dyn, v4_prompt, v4_negative_prompt) = match family {
        ModelFamily::V4 => {
            (false, false, Some(V4Prompt::new(&prompt)), Some(V4Prompt::new(&negative)))
        }
        ModelFamily::Legacy => (
            req.smea.unwrap_or(defaults.smea),
            req.smea_dyn.unwrap_or(defaults.smea_dyn),
            None,
            None,
        ),
    };

    let parameters = Parameters {
        width: dims.width,
        height: dims.height,
        scale: req.cfg_scale.filter(|s| *s > 0.0).unwrap_or(defaults.scale),
        sampler: req.sampler.unwrap_or(defaults.sampler),
        steps: req.steps.filter(|s| *s > 0).unwrap_or(defaults.steps),
        seed,
        n_samples: 1,
        uc_preset: 0,
        quality_toggle: false,
        dynamic_thresholding: false,
        controlnet_strength: 1,
        legacy: false,
        add_original_image: false,
        negative_prompt: negative,
        sm,
        sm_dyn,
        params_version: defaults.params_version,
        use_coords: defaults.use_coords,
        noise_schedule: defaults.noise_schedule,
        v4_prompt,
        v4_negative_prompt,
    };

    PayloadDocument { input: prompt, model: req.model, action: "generate", parameters }
}
