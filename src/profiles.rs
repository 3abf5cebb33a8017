// Model profiles.
//
// One entry per model we can serve: which modes it has templates for, how many
// reference images it takes, where its backend URL comes from, and which adapter
// fills in its graph. This is the only place that knows about specific model ids.

use std::{collections::BTreeMap, fmt};

use lazy_static::lazy_static;
use log::debug;

use crate::{
    adapters,
    catalog::{Catalog, Mode, Shape},
    error::DispatchError,
    request::GenerationRequest,
    selector::{self, WorkingGraph, MAX_CHAINED_REFERENCES},
};

/// Writes a request's parameters into a working graph. One per model.
pub type Injector = fn(&mut WorkingGraph, &GenerationRequest) -> Result<(), DispatchError>;

/// The (load, preprocess) node pair that gets copied per extra reference image,
/// and the text encoders that receive `image2`, `image3`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderChain {
    pub load: &'static str,
    pub preprocess: &'static str,
    pub encoders: &'static [&'static str],
}

/// How a model takes more than one reference image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultiReference {
    /// It doesn't; one template per mode.
    Single,
    /// Two references are stitched into one conditioning image.
    Stitch,
    /// Extra references are appended as imageN inputs of the text encoders.
    EncoderChain(EncoderChain),
}

#[derive(Clone)]
pub struct ModelProfile {
    pub model_id: String,
    pub supports_t2i: bool,
    pub supports_i2i: bool,
    pub max_reference_images: usize,
    /// Config key holding this model's backend base URL.
    pub base_url_env_var: String,
    pub multi_reference: MultiReference,
    pub injector: Injector,
}

impl fmt::Debug for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelProfile")
            .field("model_id", &self.model_id)
            .field("supports_t2i", &self.supports_t2i)
            .field("supports_i2i", &self.supports_i2i)
            .field("max_reference_images", &self.max_reference_images)
            .field("base_url_env_var", &self.base_url_env_var)
            .field("multi_reference", &self.multi_reference)
            .finish()
    }
}

pub const QWEN_EDIT_CHAIN: EncoderChain = EncoderChain {
    load: "78",
    preprocess: "93",
    encoders: &["76", "77"],
};

lazy_static! {
    static ref BUILTIN_PROFILES: Vec<ModelProfile> = vec![
        ModelProfile {
            model_id: "sdxl".to_string(),
            supports_t2i: true,
            supports_i2i: true,
            max_reference_images: 1,
            base_url_env_var: "SDXL_BASE_URL".to_string(),
            multi_reference: MultiReference::Single,
            injector: adapters::inject_sdxl,
        },
        ModelProfile {
            model_id: "sd3.5-large".to_string(),
            supports_t2i: true,
            supports_i2i: false,
            max_reference_images: 0,
            base_url_env_var: "SD35_BASE_URL".to_string(),
            multi_reference: MultiReference::Single,
            injector: adapters::inject_sd35,
        },
        ModelProfile {
            model_id: "flux-dev".to_string(),
            supports_t2i: true,
            supports_i2i: false,
            max_reference_images: 0,
            base_url_env_var: "FLUX_DEV_BASE_URL".to_string(),
            multi_reference: MultiReference::Single,
            injector: adapters::inject_flux_dev,
        },
        ModelProfile {
            model_id: "flux-schnell".to_string(),
            supports_t2i: true,
            supports_i2i: false,
            max_reference_images: 0,
            base_url_env_var: "FLUX_SCHNELL_BASE_URL".to_string(),
            multi_reference: MultiReference::Single,
            injector: adapters::inject_flux_schnell,
        },
        ModelProfile {
            model_id: "qwen-image".to_string(),
            supports_t2i: true,
            supports_i2i: false,
            max_reference_images: 0,
            base_url_env_var: "QWEN_IMAGE_BASE_URL".to_string(),
            multi_reference: MultiReference::Single,
            injector: adapters::inject_qwen_image,
        },
        ModelProfile {
            model_id: "qwen-image-edit".to_string(),
            supports_t2i: false,
            supports_i2i: true,
            max_reference_images: 3,
            base_url_env_var: "QWEN_IMAGE_EDIT_BASE_URL".to_string(),
            multi_reference: MultiReference::EncoderChain(QWEN_EDIT_CHAIN),
            injector: adapters::inject_qwen_image_edit,
        },
        ModelProfile {
            model_id: "flux-kontext".to_string(),
            supports_t2i: false,
            supports_i2i: true,
            max_reference_images: 2,
            base_url_env_var: "FLUX_KONTEXT_BASE_URL".to_string(),
            multi_reference: MultiReference::Stitch,
            injector: adapters::inject_flux_kontext,
        },
    ];
}

#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    profiles: BTreeMap<String, ModelProfile>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for profile in BUILTIN_PROFILES.iter() {
            registry.register(profile.clone());
        }
        registry
    }

    pub fn register(&mut self, profile: ModelProfile) {
        self.profiles.insert(profile.model_id.clone(), profile);
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelProfile> {
        self.profiles.values()
    }

    pub fn get(&self, model: &str) -> Result<&ModelProfile, DispatchError> {
        if let Some(profile) = self.profiles.get(model) {
            return Ok(profile);
        }
        // Unknown model, so do a Levenshtein distance check for the error message.
        let suggestion = self
            .profiles
            .keys()
            .map(|known| (strsim::levenshtein(model, known), known))
            .min()
            .filter(|(distance, _)| *distance <= 3);
        Err(DispatchError::Configuration(match suggestion {
            Some((_, known)) => format!("no workflow for model {}. Did you mean {}?", model, known),
            None => format!("no workflow for model {}", model),
        }))
    }

    /// Startup check: every mode a profile claims has a template behind it, and every
    /// graph a profile can synthesize comes out intact.
    pub fn verify(&self, catalog: &Catalog) -> Result<(), DispatchError> {
        for profile in self.profiles.values() {
            let model = profile.model_id.as_str();
            if !profile.supports_t2i && !profile.supports_i2i {
                return Err(DispatchError::Configuration(format!(
                    "{} supports neither text-to-image nor image-to-image",
                    model
                )));
            }
            if profile.supports_t2i {
                catalog.lookup(model, Mode::TextToImage)?;
            }
            if profile.supports_i2i {
                let template = catalog.lookup(model, Mode::ImageToImage)?;
                if template.image_slots().is_empty() || profile.max_reference_images == 0 {
                    return Err(DispatchError::Configuration(format!(
                        "{}: image-to-image workflow {} takes no reference images",
                        model,
                        template.name()
                    )));
                }
            } else if profile.max_reference_images > 0 {
                return Err(DispatchError::Configuration(format!(
                    "{} accepts reference images but has no image-to-image workflow",
                    model
                )));
            }

            match &profile.multi_reference {
                MultiReference::Single => {}
                MultiReference::Stitch => {
                    catalog.lookup_shape(model, Mode::ImageToImage, Shape::Stitched)?;
                }
                MultiReference::EncoderChain(chain) => {
                    let template = catalog.lookup(model, Mode::ImageToImage)?;
                    let most = profile.max_reference_images.min(MAX_CHAINED_REFERENCES);
                    for references in 2..=most {
                        selector::extend_encoder_chain(&template, chain, references).map_err(|e| {
                            DispatchError::Configuration(format!(
                                "{}: {}-reference workflow is broken: {}",
                                model, references, e
                            ))
                        })?;
                    }
                }
            }
            debug!("Verified workflows for {}", model);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::WorkflowTemplate,
        error::ErrorKind,
    };

    #[test]
    fn test_builtin_verifies() {
        let catalog = Catalog::builtin().unwrap();
        ModelRegistry::builtin().verify(&catalog).unwrap();
    }

    #[test]
    fn test_every_claimed_mode_has_a_template() {
        let catalog = Catalog::builtin().unwrap();
        for profile in ModelRegistry::builtin().list() {
            let model = profile.model_id.as_str();
            assert_eq!(
                catalog.contains(model, Mode::TextToImage, Shape::Base),
                profile.supports_t2i,
                "{}",
                model
            );
            assert_eq!(
                catalog.contains(model, Mode::ImageToImage, Shape::Base),
                profile.supports_i2i,
                "{}",
                model
            );
        }
    }

    #[test]
    fn test_missing_template_fails_verification() {
        let mut catalog = Catalog::new();
        catalog.register(
            "sdxl",
            Mode::TextToImage,
            Shape::Base,
            WorkflowTemplate::from_json("sdxl_t2i", include_str!("../workflows/sdxl_t2i.json"), &[]).unwrap(),
        );
        let mut registry = ModelRegistry::new();
        registry.register(ModelRegistry::builtin().get("sdxl").unwrap().clone());
        let err = registry.verify(&catalog).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("image-to-image"));
    }

    #[test]
    fn test_missing_stitch_template_fails_verification() {
        let builtin = Catalog::builtin().unwrap();
        let mut catalog = Catalog::new();
        let base = builtin.lookup("flux-kontext", Mode::ImageToImage).unwrap();
        catalog.register(
            "flux-kontext",
            Mode::ImageToImage,
            Shape::Base,
            WorkflowTemplate::new(base.name(), base.instantiate(), &["142"]).unwrap(),
        );
        let mut registry = ModelRegistry::new();
        registry.register(ModelRegistry::builtin().get("flux-kontext").unwrap().clone());
        let err = registry.verify(&catalog).unwrap_err();
        assert!(err.to_string().contains("Stitched"));
    }

    #[test]
    fn test_broken_chain_fails_verification() {
        let catalog = Catalog::builtin().unwrap();
        let mut profile = ModelRegistry::builtin().get("qwen-image-edit").unwrap().clone();
        profile.multi_reference = MultiReference::EncoderChain(EncoderChain {
            load: "93",
            ..QWEN_EDIT_CHAIN
        });
        let mut registry = ModelRegistry::new();
        registry.register(profile);
        let err = registry.verify(&catalog).unwrap_err();
        assert!(err.to_string().contains("2-reference workflow is broken"));
    }

    #[test]
    fn test_unknown_model_suggestion() {
        let registry = ModelRegistry::builtin();
        let err = registry.get("flux-schnel").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            err.to_string(),
            "configuration error: no workflow for model flux-schnel. Did you mean flux-schnell?"
        );
        let err = registry.get("midjourney-v7").unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: no workflow for model midjourney-v7"
        );
    }
}
