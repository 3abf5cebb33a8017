// Variant selection.
//
// Picks the template a request runs on, and hands back a private working copy of it.
// Most requests map straight onto a catalog entry. Two cases don't:
// - Stitch models with several references use a separately registered stitched graph.
// - Encoder-chain models grow their single-reference graph one (load, preprocess) pair
//   per extra reference, and wire the new pair into the text encoders' imageN inputs.

use log::debug;

use crate::{
    catalog::{Catalog, Mode, Shape, WorkflowTemplate, LOAD_IMAGE_CLASS},
    error::DispatchError,
    graph::{Graph, GraphError, NodeId, NodeRef, Value},
    profiles::{EncoderChain, ModelProfile, MultiReference},
    request::GenerationRequest,
};

/// Encoders in the chain family take at most image1..image3.
pub const MAX_CHAINED_REFERENCES: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    Base,
    Stitched,
    /// Synthesized from the base graph to take this many references.
    Extended { references: usize },
}

/// A per-call graph. Created here, filled in by an adapter, serialized, dropped.
#[derive(Clone, Debug)]
pub struct WorkingGraph {
    pub model_id: String,
    pub template: String,
    pub mode: Mode,
    pub variant: Variant,
    pub graph: Graph,
    /// Load-image nodes receiving the reference images, in reference order.
    pub image_slots: Vec<NodeId>,
}

impl WorkingGraph {
    fn from_template(profile: &ModelProfile, mode: Mode, variant: Variant, template: &WorkflowTemplate) -> Self {
        Self {
            model_id: profile.model_id.clone(),
            template: template.name().to_owned(),
            mode,
            variant,
            graph: template.instantiate(),
            image_slots: template.image_slots().to_vec(),
        }
    }
}

pub fn select(
    catalog: &Catalog,
    profile: &ModelProfile,
    request: &GenerationRequest,
) -> Result<WorkingGraph, DispatchError> {
    let model = profile.model_id.as_str();
    let references = request.reference_images.len();

    let working = match request.mode() {
        Mode::TextToImage => {
            let template = catalog.lookup(model, Mode::TextToImage)?;
            WorkingGraph::from_template(profile, Mode::TextToImage, Variant::Base, &template)
        }
        Mode::ImageToImage => match &profile.multi_reference {
            MultiReference::Stitch if references > 1 => {
                let template = catalog.lookup_shape(model, Mode::ImageToImage, Shape::Stitched)?;
                WorkingGraph::from_template(profile, Mode::ImageToImage, Variant::Stitched, &template)
            }
            MultiReference::EncoderChain(chain)
                if (2..=MAX_CHAINED_REFERENCES).contains(&references) =>
            {
                let template = catalog.lookup(model, Mode::ImageToImage)?;
                let (graph, image_slots) = extend_encoder_chain(&template, chain, references)?;
                WorkingGraph {
                    model_id: profile.model_id.clone(),
                    template: template.name().to_owned(),
                    mode: Mode::ImageToImage,
                    variant: Variant::Extended { references },
                    graph,
                    image_slots,
                }
            }
            _ => {
                let template = catalog.lookup(model, Mode::ImageToImage)?;
                WorkingGraph::from_template(profile, Mode::ImageToImage, Variant::Base, &template)
            }
        },
    };
    debug!(
        "Selected {} ({:?}) for {} with {} reference image(s)",
        working.template, working.variant, model, references
    );
    Ok(working)
}

/// Builds the `references`-image variant of a single-reference encoder-chain template.
///
/// For each reference k in 2..=references, the chain's load and preprocess nodes are
/// copied under fresh ids (load first, then preprocess, counting up from the template's
/// highest numeric id), and every encoder's `image{k}` input is pointed at the new
/// preprocess output. The ids only depend on the template, so building the same
/// variant twice gives identical graphs.
///
/// Returns the graph and its image slots, the template's own slots first.
pub fn extend_encoder_chain(
    template: &WorkflowTemplate,
    chain: &EncoderChain,
    references: usize,
) -> Result<(Graph, Vec<NodeId>), GraphError> {
    let mut graph = template.instantiate();
    let load = graph.expect_class(chain.load, LOAD_IMAGE_CLASS)?.clone();
    let preprocess = graph.node(chain.preprocess)?.clone();
    for encoder in chain.encoders {
        graph.node(encoder)?;
    }

    let mut image_slots = template.image_slots().to_vec();
    let mut next_id = graph.next_free_id();
    for k in 2..=references {
        let load_id = next_id.to_string();
        let preprocess_id = (next_id + 1).to_string();
        next_id += 2;

        let mut new_load = load.clone();
        new_load.meta.title = format!("Load Image {}", k);

        let mut new_preprocess = preprocess.clone();
        new_preprocess.meta.title = format!("Scale Image {}", k);
        for value in new_preprocess.inputs.values_mut() {
            if let Value::Ref(r) = value {
                if r.node() == chain.load {
                    *value = Value::Ref(NodeRef::new(load_id.clone(), r.output()));
                }
            }
        }

        graph.insert_node(load_id.clone(), new_load)?;
        graph.insert_node(preprocess_id.clone(), new_preprocess)?;
        for encoder in chain.encoders {
            graph.set_input(encoder, &format!("image{}", k), NodeRef::new(preprocess_id.clone(), 0))?;
        }
        image_slots.push(load_id);
    }

    graph.validate_refs()?;
    Ok((graph, image_slots))
}
