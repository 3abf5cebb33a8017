// Parameter injection, one adapter per model.
//
// Every template was exported by hand from ComfyUI, so the same parameter lives in a
// different place in each of them: the prompt is node 6 in one graph and node 76 in
// another, sometimes under `text` and sometimes under `prompt`. Each adapter lists the
// nodes it writes, checks all of them first, and only then starts writing. A failed
// check leaves the working graph untouched.

use log::{debug, warn};

use crate::{
    catalog::{Mode, LOAD_IMAGE_CLASS},
    error::DispatchError,
    graph::{Graph, GraphError, NodeId},
    request::GenerationRequest,
    selector::WorkingGraph,
};

/// A node an adapter writes to, and the operation it has to be.
#[derive(Clone, Copy, Debug)]
pub struct Target {
    pub id: &'static str,
    pub class: &'static str,
}

impl Target {
    pub const fn new(id: &'static str, class: &'static str) -> Self {
        Self { id, class }
    }
}

fn check(graph: &Graph, targets: &[Target]) -> Result<(), GraphError> {
    for target in targets {
        graph.expect_class(target.id, target.class)?;
    }
    Ok(())
}

fn check_reference_slots(working: &WorkingGraph, request: &GenerationRequest) -> Result<(), DispatchError> {
    if working.image_slots.len() != request.reference_images.len() {
        return Err(DispatchError::ReferenceCount {
            model: working.model_id.clone(),
            slots: working.image_slots.len(),
            supplied: request.reference_images.len(),
        });
    }
    for slot in &working.image_slots {
        working.graph.expect_class(slot, LOAD_IMAGE_CLASS)?;
    }
    Ok(())
}

fn write_reference_images(
    graph: &mut Graph,
    slots: &[NodeId],
    request: &GenerationRequest,
) -> Result<(), GraphError> {
    for (slot, image) in slots.iter().zip(&request.reference_images) {
        graph.set_input(slot, "image", image.as_str())?;
    }
    Ok(())
}

fn write_size(graph: &mut Graph, target: Target, request: &GenerationRequest) -> Result<(), GraphError> {
    graph.set_input(target.id, "width", request.width)?;
    graph.set_input(target.id, "height", request.height)
}

/// Leaves the template's seed alone unless the caller picked one.
fn write_seed(graph: &mut Graph, target: Target, field: &str, request: &GenerationRequest) -> Result<(), GraphError> {
    match request.seed {
        Some(seed) => graph.set_input(target.id, field, seed),
        None => Ok(()),
    }
}

/// For templates without a negative prompt node. Dropping the text is the contract,
/// but it shouldn't happen silently.
fn ignore_negative(model: &str, request: &GenerationRequest) {
    if let Some(negative) = request.negative() {
        warn!("{} has no negative prompt input; ignoring {:?}", model, negative);
    }
}

const SDXL_POSITIVE: Target = Target::new("6", "CLIPTextEncode");
const SDXL_NEGATIVE: Target = Target::new("7", "CLIPTextEncode");
const SDXL_LATENT: Target = Target::new("5", "EmptyLatentImage");
const SDXL_RESIZE: Target = Target::new("11", "ImageScale");
const SDXL_SAMPLER: Target = Target::new("3", "KSampler");

/// SDXL, both modes. Image-to-image resizes the reference instead of sizing an empty
/// latent, and keeps the template's denoise strength.
pub fn inject_sdxl(working: &mut WorkingGraph, request: &GenerationRequest) -> Result<(), DispatchError> {
    let size = match working.mode {
        Mode::TextToImage => SDXL_LATENT,
        Mode::ImageToImage => SDXL_RESIZE,
    };
    check(&working.graph, &[SDXL_POSITIVE, SDXL_NEGATIVE, size, SDXL_SAMPLER])?;
    check_reference_slots(working, request)?;

    let graph = &mut working.graph;
    graph.set_input(SDXL_POSITIVE.id, "text", request.prompt.as_str())?;
    if let Some(negative) = request.negative() {
        graph.set_input(SDXL_NEGATIVE.id, "text", negative)?;
    }
    write_size(graph, size, request)?;
    graph.set_input(SDXL_SAMPLER.id, "steps", request.steps)?;
    write_seed(graph, SDXL_SAMPLER, "seed", request)?;
    write_reference_images(graph, &working.image_slots, request)?;
    Ok(())
}

const SD35_POSITIVE: Target = Target::new("16", "CLIPTextEncode");
const SD35_NEGATIVE: Target = Target::new("40", "CLIPTextEncode");
const SD35_LATENT: Target = Target::new("53", "EmptySD3LatentImage");
const SD35_SAMPLER: Target = Target::new("3", "KSampler");

pub fn inject_sd35(working: &mut WorkingGraph, request: &GenerationRequest) -> Result<(), DispatchError> {
    check(&working.graph, &[SD35_POSITIVE, SD35_NEGATIVE, SD35_LATENT, SD35_SAMPLER])?;
    check_reference_slots(working, request)?;

    let graph = &mut working.graph;
    graph.set_input(SD35_POSITIVE.id, "text", request.prompt.as_str())?;
    if let Some(negative) = request.negative() {
        graph.set_input(SD35_NEGATIVE.id, "text", negative)?;
    }
    write_size(graph, SD35_LATENT, request)?;
    graph.set_input(SD35_SAMPLER.id, "steps", request.steps)?;
    write_seed(graph, SD35_SAMPLER, "seed", request)?;
    Ok(())
}

const FLUX_DEV_POSITIVE: Target = Target::new("6", "CLIPTextEncode");
const FLUX_DEV_LATENT: Target = Target::new("27", "EmptySD3LatentImage");
const FLUX_DEV_SAMPLING: Target = Target::new("30", "ModelSamplingFlux");
const FLUX_DEV_SCHEDULER: Target = Target::new("17", "BasicScheduler");
const FLUX_DEV_NOISE: Target = Target::new("25", "RandomNoise");

/// Flux dev. The resolution goes into both the latent and ModelSamplingFlux, which
/// computes its shift from it; the two must agree.
pub fn inject_flux_dev(working: &mut WorkingGraph, request: &GenerationRequest) -> Result<(), DispatchError> {
    check(
        &working.graph,
        &[FLUX_DEV_POSITIVE, FLUX_DEV_LATENT, FLUX_DEV_SAMPLING, FLUX_DEV_SCHEDULER, FLUX_DEV_NOISE],
    )?;
    check_reference_slots(working, request)?;
    ignore_negative(&working.model_id, request);

    let graph = &mut working.graph;
    graph.set_input(FLUX_DEV_POSITIVE.id, "text", request.prompt.as_str())?;
    write_size(graph, FLUX_DEV_LATENT, request)?;
    write_size(graph, FLUX_DEV_SAMPLING, request)?;
    graph.set_input(FLUX_DEV_SCHEDULER.id, "steps", request.steps)?;
    write_seed(graph, FLUX_DEV_NOISE, "noise_seed", request)?;
    Ok(())
}

/// Schnell is step-distilled; it only works at this step count.
pub const FLUX_SCHNELL_STEPS: u32 = 4;

const FLUX_SCHNELL_POSITIVE: Target = Target::new("6", "CLIPTextEncode");
const FLUX_SCHNELL_LATENT: Target = Target::new("27", "EmptySD3LatentImage");
const FLUX_SCHNELL_SAMPLER: Target = Target::new("31", "KSampler");

pub fn inject_flux_schnell(working: &mut WorkingGraph, request: &GenerationRequest) -> Result<(), DispatchError> {
    check(
        &working.graph,
        &[FLUX_SCHNELL_POSITIVE, FLUX_SCHNELL_LATENT, FLUX_SCHNELL_SAMPLER],
    )?;
    check_reference_slots(working, request)?;
    ignore_negative(&working.model_id, request);
    if request.steps != FLUX_SCHNELL_STEPS {
        debug!(
            "{} always runs {} steps; ignoring requested {}",
            working.model_id, FLUX_SCHNELL_STEPS, request.steps
        );
    }

    let graph = &mut working.graph;
    graph.set_input(FLUX_SCHNELL_POSITIVE.id, "text", request.prompt.as_str())?;
    write_size(graph, FLUX_SCHNELL_LATENT, request)?;
    graph.set_input(FLUX_SCHNELL_SAMPLER.id, "steps", FLUX_SCHNELL_STEPS)?;
    write_seed(graph, FLUX_SCHNELL_SAMPLER, "seed", request)?;
    Ok(())
}

const QWEN_POSITIVE: Target = Target::new("6", "CLIPTextEncode");
const QWEN_NEGATIVE: Target = Target::new("7", "CLIPTextEncode");
const QWEN_LATENT: Target = Target::new("58", "EmptySD3LatentImage");
const QWEN_SAMPLER: Target = Target::new("3", "KSampler");

pub fn inject_qwen_image(working: &mut WorkingGraph, request: &GenerationRequest) -> Result<(), DispatchError> {
    check(&working.graph, &[QWEN_POSITIVE, QWEN_NEGATIVE, QWEN_LATENT, QWEN_SAMPLER])?;
    check_reference_slots(working, request)?;

    let graph = &mut working.graph;
    graph.set_input(QWEN_POSITIVE.id, "text", request.prompt.as_str())?;
    if let Some(negative) = request.negative() {
        graph.set_input(QWEN_NEGATIVE.id, "text", negative)?;
    }
    write_size(graph, QWEN_LATENT, request)?;
    graph.set_input(QWEN_SAMPLER.id, "steps", request.steps)?;
    write_seed(graph, QWEN_SAMPLER, "seed", request)?;
    Ok(())
}

const QWEN_EDIT_POSITIVE: Target = Target::new("76", "TextEncodeQwenImageEditPlus");
const QWEN_EDIT_NEGATIVE: Target = Target::new("77", "TextEncodeQwenImageEditPlus");
const QWEN_EDIT_SAMPLER: Target = Target::new("3", "KSampler");

/// Qwen image edit, one to three references. The encoders take `prompt`, not `text`.
/// Output size follows the first reference, so width/height aren't written.
pub fn inject_qwen_image_edit(working: &mut WorkingGraph, request: &GenerationRequest) -> Result<(), DispatchError> {
    check(&working.graph, &[QWEN_EDIT_POSITIVE, QWEN_EDIT_NEGATIVE, QWEN_EDIT_SAMPLER])?;
    check_reference_slots(working, request)?;

    let graph = &mut working.graph;
    graph.set_input(QWEN_EDIT_POSITIVE.id, "prompt", request.prompt.as_str())?;
    if let Some(negative) = request.negative() {
        graph.set_input(QWEN_EDIT_NEGATIVE.id, "prompt", negative)?;
    }
    graph.set_input(QWEN_EDIT_SAMPLER.id, "steps", request.steps)?;
    write_seed(graph, QWEN_EDIT_SAMPLER, "seed", request)?;
    write_reference_images(graph, &working.image_slots, request)?;
    Ok(())
}

const KONTEXT_POSITIVE: Target = Target::new("6", "CLIPTextEncode");
const KONTEXT_SAMPLER: Target = Target::new("31", "KSampler");

/// Flux Kontext, single or stitched. Size comes from the (stitched) reference.
pub fn inject_flux_kontext(working: &mut WorkingGraph, request: &GenerationRequest) -> Result<(), DispatchError> {
    check(&working.graph, &[KONTEXT_POSITIVE, KONTEXT_SAMPLER])?;
    check_reference_slots(working, request)?;
    ignore_negative(&working.model_id, request);

    let graph = &mut working.graph;
    graph.set_input(KONTEXT_POSITIVE.id, "text", request.prompt.as_str())?;
    graph.set_input(KONTEXT_SAMPLER.id, "steps", request.steps)?;
    write_seed(graph, KONTEXT_SAMPLER, "seed", request)?;
    write_reference_images(graph, &working.image_slots, request)?;
    Ok(())
}
