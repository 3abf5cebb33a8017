// Workflow dispatcher for ComfyUI backends.
//
// A GenerationRequest goes in, the matching workflow template is picked from the catalog
// (possibly widened for extra reference images), the model's adapter fills in the request
// parameters, and the result is POSTed to that model's backend. What comes back is either
// a PNG data URL or a classified DispatchError.

pub mod adapters;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod profiles;
pub mod request;
pub mod router;
pub mod selector;
pub mod utils;

pub use catalog::{Catalog, Mode};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult, ErrorKind};
pub use graph::Graph;
pub use profiles::{ModelProfile, ModelRegistry};
pub use request::{Base64Image, GenerationRequest};
pub use router::{ConfigSource, EnvSource};
