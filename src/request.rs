// These types describe one generation request, as handed to us by the calling layer.
// Validation (step limits, batch bounds, image counts vs. model) happens up there;
// by the time a request gets here it's assumed to be sane.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::catalog::Mode;

/// A reference image, as bare base64 (no `data:` prefix).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Base64Image(String);

impl Base64Image {
    /// Accepts either bare base64 or a `data:image/...;base64,` URL.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        match text.split_once(";base64,") {
            Some((prefix, payload)) if prefix.starts_with("data:") => Self(payload.to_owned()),
            _ => Self(text),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(STANDARD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Base64Image {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<Base64Image> for String {
    fn from(image: Base64Image) -> Self {
        image.0
    }
}

fn default_batch_size() -> u32 {
    1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    /// None leaves the template's own seed alone.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Never encoded into a graph. See `split_batch`.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    pub model_id: String,
    #[serde(default)]
    pub reference_images: Vec<Base64Image>,
}

impl GenerationRequest {
    pub fn new(model_id: &str, prompt: &str) -> Self {
        Self {
            prompt: prompt.to_owned(),
            negative_prompt: None,
            width: 1024,
            height: 1024,
            steps: 20,
            seed: None,
            batch_size: 1,
            model_id: model_id.to_owned(),
            reference_images: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        if self.reference_images.is_empty() {
            Mode::TextToImage
        } else {
            Mode::ImageToImage
        }
    }

    /// Negative prompt, treating an empty string as absent.
    pub fn negative(&self) -> Option<&str> {
        self.negative_prompt.as_deref().filter(|s| !s.is_empty())
    }

    /// Turns a batch into independent single-image requests.
    /// Each gets its own seed: `seed + i`, or `fallback_seed + i` if the caller didn't pick one.
    pub fn split_batch(&self, fallback_seed: u64) -> Vec<GenerationRequest> {
        if self.batch_size <= 1 {
            return vec![GenerationRequest {
                batch_size: 1,
                ..self.clone()
            }];
        }
        let base = self.seed.unwrap_or(fallback_seed);
        (0..self.batch_size)
            .map(|i| GenerationRequest {
                seed: Some(base.wrapping_add(i as u64)),
                batch_size: 1,
                ..self.clone()
            })
            .collect()
    }
}
