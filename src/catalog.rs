// The workflow catalog.
//
// Holds every base template, keyed by (model, mode, shape). Templates are parsed once,
// checked for dangling references, and then only ever handed out behind an Arc.
// Nobody gets a &mut to a catalog entry; to change a graph you instantiate it first.

use std::{collections::HashMap, fmt, sync::Arc};

use log::debug;

use crate::{
    error::DispatchError,
    graph::{Graph, GraphError, NodeId},
};

/// Node class for every "load image" slot. Takes the base64 payload in its `image` input.
pub const LOAD_IMAGE_CLASS: &str = "ETN_LoadImageBase64";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    TextToImage,
    ImageToImage,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::TextToImage => f.write_str("text-to-image"),
            Mode::ImageToImage => f.write_str("image-to-image"),
        }
    }
}

/// Structural flavor of a template within one (model, mode).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Shape {
    Base,
    /// Two references concatenated side by side before encoding.
    Stitched,
}

#[derive(Debug)]
pub struct WorkflowTemplate {
    name: String,
    graph: Graph,
    image_slots: Vec<NodeId>,
}

impl WorkflowTemplate {
    /// Parses and checks a template.
    /// `image_slots` are the load-image nodes that take reference images, in order.
    pub fn new(name: &str, graph: Graph, image_slots: &[&str]) -> Result<Self, GraphError> {
        graph.validate_refs()?;
        for slot in image_slots {
            graph.expect_class(slot, LOAD_IMAGE_CLASS)?;
        }
        Ok(Self {
            name: name.to_owned(),
            graph,
            image_slots: image_slots.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn from_json(name: &str, json: &str, image_slots: &[&str]) -> Result<Self, GraphError> {
        Self::new(name, Graph::from_json(json)?, image_slots)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read-only view of the blueprint.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn image_slots(&self) -> &[NodeId] {
        &self.image_slots
    }

    /// A fresh, private copy of the graph. The only way to get something mutable.
    pub fn instantiate(&self) -> Graph {
        self.graph.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TemplateKey {
    model: String,
    mode: Mode,
    shape: Shape,
}

#[derive(Debug, Default)]
pub struct Catalog {
    templates: HashMap<TemplateKey, Arc<WorkflowTemplate>>,
}

struct BuiltinTemplate {
    model: &'static str,
    mode: Mode,
    shape: Shape,
    name: &'static str,
    json: &'static str,
    image_slots: &'static [&'static str],
}

const BUILTIN: &[BuiltinTemplate] = &[
    BuiltinTemplate {
        model: "sdxl",
        mode: Mode::TextToImage,
        shape: Shape::Base,
        name: "sdxl_t2i",
        json: include_str!("../workflows/sdxl_t2i.json"),
        image_slots: &[],
    },
    BuiltinTemplate {
        model: "sdxl",
        mode: Mode::ImageToImage,
        shape: Shape::Base,
        name: "sdxl_i2i",
        json: include_str!("../workflows/sdxl_i2i.json"),
        image_slots: &["10"],
    },
    BuiltinTemplate {
        model: "sd3.5-large",
        mode: Mode::TextToImage,
        shape: Shape::Base,
        name: "sd35_t2i",
        json: include_str!("../workflows/sd35_t2i.json"),
        image_slots: &[],
    },
    BuiltinTemplate {
        model: "flux-dev",
        mode: Mode::TextToImage,
        shape: Shape::Base,
        name: "flux_dev_t2i",
        json: include_str!("../workflows/flux_dev_t2i.json"),
        image_slots: &[],
    },
    BuiltinTemplate {
        model: "flux-schnell",
        mode: Mode::TextToImage,
        shape: Shape::Base,
        name: "flux_schnell_t2i",
        json: include_str!("../workflows/flux_schnell_t2i.json"),
        image_slots: &[],
    },
    BuiltinTemplate {
        model: "qwen-image",
        mode: Mode::TextToImage,
        shape: Shape::Base,
        name: "qwen_image_t2i",
        json: include_str!("../workflows/qwen_image_t2i.json"),
        image_slots: &[],
    },
    BuiltinTemplate {
        model: "qwen-image-edit",
        mode: Mode::ImageToImage,
        shape: Shape::Base,
        name: "qwen_image_edit",
        json: include_str!("../workflows/qwen_image_edit.json"),
        image_slots: &["78"],
    },
    BuiltinTemplate {
        model: "flux-kontext",
        mode: Mode::ImageToImage,
        shape: Shape::Base,
        name: "flux_kontext_i2i",
        json: include_str!("../workflows/flux_kontext_i2i.json"),
        image_slots: &["142"],
    },
    BuiltinTemplate {
        model: "flux-kontext",
        mode: Mode::ImageToImage,
        shape: Shape::Stitched,
        name: "flux_kontext_stitch",
        json: include_str!("../workflows/flux_kontext_stitch.json"),
        image_slots: &["142", "147"],
    },
];

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The templates compiled into this binary.
    pub fn builtin() -> Result<Self, DispatchError> {
        let mut catalog = Self::new();
        for t in BUILTIN {
            let template = WorkflowTemplate::from_json(t.name, t.json, t.image_slots).map_err(|e| {
                DispatchError::Configuration(format!("built-in workflow {} is broken: {}", t.name, e))
            })?;
            catalog.register(t.model, t.mode, t.shape, template);
        }
        debug!("Loaded {} built-in workflows", catalog.len());
        Ok(catalog)
    }

    /// Adds a template. A later registration for the same key replaces the earlier one.
    pub fn register(&mut self, model: &str, mode: Mode, shape: Shape, template: WorkflowTemplate) {
        let key = TemplateKey {
            model: model.to_owned(),
            mode,
            shape,
        };
        self.templates.insert(key, Arc::new(template));
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn contains(&self, model: &str, mode: Mode, shape: Shape) -> bool {
        self.get(model, mode, shape).is_some()
    }

    fn get(&self, model: &str, mode: Mode, shape: Shape) -> Option<&Arc<WorkflowTemplate>> {
        self.templates.get(&TemplateKey {
            model: model.to_owned(),
            mode,
            shape,
        })
    }

    /// The base template for a model and mode.
    /// Missing means the model is advertised without a backing graph; never fall back.
    pub fn lookup(&self, model: &str, mode: Mode) -> Result<Arc<WorkflowTemplate>, DispatchError> {
        self.lookup_shape(model, mode, Shape::Base)
    }

    pub fn lookup_shape(
        &self,
        model: &str,
        mode: Mode,
        shape: Shape,
    ) -> Result<Arc<WorkflowTemplate>, DispatchError> {
        self.get(model, mode, shape).cloned().ok_or_else(|| {
            DispatchError::Configuration(format!(
                "no workflow for model {} ({}, {:?})",
                model, mode, shape
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Mode, Shape, &WorkflowTemplate)> {
        self.templates
            .iter()
            .map(|(k, t)| (k.model.as_str(), k.mode, k.shape, t.as_ref()))
    }
}
