// The dispatcher ties it all together:
// request -> variant selection -> adapter -> backend URL -> one POST -> classified result.
//
// It holds no per-call state. Templates sit behind Arcs and are only ever cloned, so a
// Dispatcher can be cloned and used from as many tasks as you like. There are no retries
// and no timeouts in here; wrap the call if you want either.

use std::sync::Arc;

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::Catalog,
    error::{DispatchError, DispatchResult},
    graph::Graph,
    profiles::{ModelProfile, ModelRegistry},
    request::GenerationRequest,
    router::{self, ConfigSource},
    selector::{self, WorkingGraph},
    utils,
};

pub const DEFAULT_SUBMIT_PATH: &str = "/prompt";
pub const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// The proxy in front of the backends answers with these when the backend is gone,
/// sometimes with a 200.
const UPSTREAM_MARKERS: &[&str] = &["no healthy upstream", "upstream"];

/// Longest upstream body we copy into an error message.
const MAX_ERROR_BODY: usize = 500;

/// A finished graph plus where it's going. Nothing has been sent yet.
#[derive(Clone, Debug)]
pub struct PreparedJob {
    pub working: WorkingGraph,
    pub url: String,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    prompt: &'a Graph,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    catalog: Arc<Catalog>,
    registry: Arc<ModelRegistry>,
    config: Arc<dyn ConfigSource>,
    client: reqwest::Client,
    submit_path: String,
}

impl Dispatcher {
    /// Checks that every profile is fully backed by the catalog before accepting work.
    pub fn new(
        catalog: Catalog,
        registry: ModelRegistry,
        config: Arc<dyn ConfigSource>,
    ) -> Result<Self, DispatchError> {
        registry.verify(&catalog)?;
        info!(
            "Dispatcher ready: {} models, {} workflows",
            registry.list().count(),
            catalog.len()
        );
        Ok(Self {
            catalog: Arc::new(catalog),
            registry: Arc::new(registry),
            config,
            client: reqwest::Client::new(),
            submit_path: DEFAULT_SUBMIT_PATH.to_string(),
        })
    }

    /// The built-in catalog and profiles.
    pub fn builtin(config: Arc<dyn ConfigSource>) -> Result<Self, DispatchError> {
        Self::new(Catalog::builtin()?, ModelRegistry::builtin(), config)
    }

    pub fn with_submit_path(mut self, submit_path: &str) -> Self {
        self.submit_path = submit_path.to_string();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn build(&self, profile: &ModelProfile, request: &GenerationRequest) -> Result<WorkingGraph, DispatchError> {
        let mut working = selector::select(&self.catalog, profile, request)?;
        (profile.injector)(&mut working, request)?;
        working.graph.validate_refs()?;
        Ok(working)
    }

    /// Selects and fills in the graph for a request. No configuration or network access.
    pub fn build_workflow(&self, request: &GenerationRequest) -> Result<WorkingGraph, DispatchError> {
        let profile = self.registry.get(&request.model_id)?;
        self.build(profile, request)
    }

    /// Everything short of sending.
    pub fn prepare(&self, request: &GenerationRequest) -> Result<PreparedJob, DispatchError> {
        let profile = self.registry.get(&request.model_id)?;
        let working = self.build(profile, request)?;
        let base_url = router::resolve_base_url(self.config.as_ref(), profile)?;
        let url = router::submit_url(&base_url, &self.submit_path);
        Ok(PreparedJob { working, url })
    }

    /// Runs one generation. Exactly one HTTP attempt, and only if everything before it worked.
    pub async fn dispatch(&self, request: &GenerationRequest) -> DispatchResult {
        let job = self.prepare(request).map_err(|e| {
            warn!("{}: not dispatched [{}]: {}", request.model_id, e.kind(), e);
            e
        })?;
        let fingerprint = job.working.graph.fingerprint()?;
        info!(
            "Submitting {} ({:?}, {}) to {}",
            job.working.template, job.working.variant, fingerprint, job.url
        );
        let result = submit(&self.client, &job.url, &job.working.graph).await;
        match &result {
            Ok(_) => debug!("{}: got an image back", request.model_id),
            Err(e) => warn!("{}: dispatch failed [{}]: {}", request.model_id, e.kind(), e),
        }
        result
    }
}

/// POSTs `{"prompt": graph}` and classifies whatever comes back.
pub async fn submit(client: &reqwest::Client, url: &str, graph: &Graph) -> DispatchResult {
    let response = client
        .post(url)
        .json(&SubmitRequest { prompt: graph })
        .send()
        .await?;
    let status = response.status().as_u16();
    let text = response.text().await?;
    trace!("Response ({}): {}", status, text);
    interpret_response(status, &text, url)
}

/// Turns a raw backend response into an artifact or an error.
///
/// 404 and 503 are decided by status alone. Otherwise a body mentioning "upstream" is
/// the proxy reporting a dead backend, whatever the status says. Other non-2xx codes
/// are backend errors, and a 2xx has to carry a non-empty `images` array.
pub fn interpret_response(status: u16, body: &str, url: &str) -> DispatchResult {
    if status == 404 {
        return Err(DispatchError::EndpointNotFound { url: url.to_string() });
    }
    if status == 503 {
        return Err(DispatchError::UpstreamUnavailable(format!(
            "HTTP 503: {}",
            utils::truncate(body, MAX_ERROR_BODY)
        )));
    }
    if UPSTREAM_MARKERS.iter().any(|marker| body.contains(marker)) {
        return Err(DispatchError::UpstreamUnavailable(format!(
            "HTTP {}: {}",
            status,
            utils::truncate(body, MAX_ERROR_BODY)
        )));
    }
    if !(200..300).contains(&status) {
        return Err(DispatchError::Upstream {
            status,
            body: utils::truncate(body, MAX_ERROR_BODY),
        });
    }

    let parsed = serde_json::from_str::<SubmitResponse>(body)
        .map_err(|e| DispatchError::MalformedResponse(format!("invalid JSON: {}", e)))?;
    match parsed.images.into_iter().next() {
        Some(image) if !image.is_empty() => Ok(format!("{}{}", PNG_DATA_URL_PREFIX, image)),
        _ => Err(DispatchError::MalformedResponse(
            "response carried no images".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use mockito::Matcher;
    use serde_json::json;

    use super::*;
    use crate::{
        catalog::Mode,
        error::ErrorKind,
        request::Base64Image,
    };

    const URL: &str = "http://backend/prompt";

    fn dispatcher(backends: &[(&str, &str)]) -> Dispatcher {
        let config: HashMap<String, String> = backends
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Dispatcher::builtin(Arc::new(config))
            .unwrap()
            .with_client(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    #[test]
    fn test_interpret_success() {
        assert_eq!(
            interpret_response(200, r#"{"images": ["QUJD", "REVG"]}"#, URL).unwrap(),
            "data:image/png;base64,QUJD"
        );
    }

    #[test]
    fn test_interpret_status_codes() {
        let err = interpret_response(404, "Not Found", URL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EndpointNotFound);
        assert!(err.to_string().contains(URL));

        let err = interpret_response(503, "", URL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);

        let err = interpret_response(500, r#"{"error": "CUDA out of memory"}"#, URL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamError);
        assert!(matches!(err, DispatchError::Upstream { status: 500, ref body } if body.contains("CUDA")));
    }

    #[test]
    fn test_interpret_upstream_text() {
        let err = interpret_response(200, "no healthy upstream", URL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        let err = interpret_response(200, "upstream connect error", URL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        let err = interpret_response(502, "upstream connect error or disconnect/reset before headers", URL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[test]
    fn test_interpret_malformed() {
        for body in ["<html>oops</html>", "{}", r#"{"images": []}"#, r#"{"images": [""]}"#, r#"{"images": [1]}"#] {
            let err = interpret_response(200, body, URL).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedResponse, "{}", body);
        }
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(10_000);
        match interpret_response(500, &body, URL).unwrap_err() {
            DispatchError::Upstream { body, .. } => assert!(body.chars().count() <= MAX_ERROR_BODY + 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/prompt")
            .match_body(Matcher::PartialJson(json!({
                "prompt": {
                    "6": {"inputs": {"text": "x", "clip": ["4", 1]}, "class_type": "CLIPTextEncode"},
                    "5": {"inputs": {"width": 1024, "height": 1024}}
                }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"images": ["QUJD"]}"#)
            .create_async()
            .await;

        let url = format!("{}/", server.url());
        let dispatcher = dispatcher(&[("SDXL_BASE_URL", &url)]);
        let mut request = GenerationRequest::new("sdxl", "x");
        request.steps = 30;
        let result = dispatcher.dispatch(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(result, "data:image/png;base64,QUJD");
    }

    #[tokio::test]
    async fn test_dispatch_custom_submit_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/prompt")
            .with_status(200)
            .with_body(r#"{"images": ["QUJD"]}"#)
            .create_async()
            .await;
        let dispatcher = dispatcher(&[("FLUX_DEV_BASE_URL", &server.url())]).with_submit_path("api/prompt");
        dispatcher.dispatch(&GenerationRequest::new("flux-dev", "x")).await.unwrap();
        mock.assert_async().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_dispatch_error_statuses() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();
        let dispatcher = dispatcher(&[("SDXL_BASE_URL", &url)]);
        let request = GenerationRequest::new("sdxl", "x");

        let cases = [
            (404, "404 page not found", ErrorKind::EndpointNotFound),
            (503, "Service Unavailable", ErrorKind::UpstreamUnavailable),
            (200, "no healthy upstream", ErrorKind::UpstreamUnavailable),
            (200, "not json", ErrorKind::MalformedResponse),
            (200, r#"{"images": []}"#, ErrorKind::MalformedResponse),
            (500, "Internal Server Error", ErrorKind::UpstreamError),
        ];
        for (status, body, kind) in cases {
            let mock = server
                .mock("POST", "/prompt")
                .with_status(status)
                .with_body(body)
                .expect(1)
                .create_async()
                .await;
            let err = dispatcher.dispatch(&request).await.unwrap_err();
            assert_eq!(err.kind(), kind, "{} {}", status, body);
            mock.assert_async().await;
            mock.remove_async().await;
        }
    }

    #[tokio::test]
    async fn test_missing_base_url_never_sends() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;
        let dispatcher = dispatcher(&[("SDXL_BASE_URL", &server.url())]);

        let err = dispatcher
            .dispatch(&GenerationRequest::new("flux-dev", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("FLUX_DEV_BASE_URL"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_model_never_sends() {
        let dispatcher = dispatcher(&[]);
        let err = dispatcher
            .dispatch(&GenerationRequest::new("dall-e-3", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Nothing listens on port 1.
        let dispatcher = dispatcher(&[("SDXL_BASE_URL", "http://127.0.0.1:1")]);
        let err = dispatcher
            .dispatch(&GenerationRequest::new("sdxl", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_do_not_interfere() {
        let mut server = mockito::Server::new_async().await;
        let mut mocks = Vec::new();
        for (seed, image) in [(1u64, "MQ=="), (2, "Mg==")] {
            mocks.push(
                server
                    .mock("POST", "/prompt")
                    .match_body(Matcher::PartialJson(json!({
                        "prompt": {"3": {"inputs": {"seed": seed, "steps": 20 + seed}}}
                    })))
                    .with_status(200)
                    .with_body(json!({ "images": [image] }).to_string())
                    .expect(1)
                    .create_async()
                    .await,
            );
        }
        let dispatcher = dispatcher(&[("SDXL_BASE_URL", &server.url())]);
        let template = dispatcher.catalog().lookup("sdxl", Mode::TextToImage).unwrap();
        let before = template.graph().fingerprint().unwrap();

        let mut first = GenerationRequest::new("sdxl", "first");
        first.seed = Some(1);
        first.steps = 21;
        let mut second = GenerationRequest::new("sdxl", "second");
        second.seed = Some(2);
        second.steps = 22;
        let (a, b) = tokio::join!(dispatcher.dispatch(&first), dispatcher.dispatch(&second));

        assert_eq!(a.unwrap(), "data:image/png;base64,MQ==");
        assert_eq!(b.unwrap(), "data:image/png;base64,Mg==");
        for mock in mocks {
            mock.assert_async().await;
        }
        assert_eq!(template.graph().fingerprint().unwrap(), before);
        assert_eq!(
            dispatcher.catalog().lookup("sdxl", Mode::TextToImage).unwrap().graph().fingerprint().unwrap(),
            before
        );
    }

    #[test]
    fn test_prepare_stitched_job() {
        let dispatcher = dispatcher(&[("FLUX_KONTEXT_BASE_URL", "http://kontext:8188//")]);
        let mut request = GenerationRequest::new("flux-kontext", "x");
        request.reference_images = vec![Base64Image::new("AAAA"), Base64Image::new("BBBB")];
        let job = dispatcher.prepare(&request).unwrap();
        assert_eq!(job.url, "http://kontext:8188/prompt");
        assert_eq!(job.working.graph.count_class("ImageStitch"), 1);

        let body = serde_json::to_value(SubmitRequest { prompt: &job.working.graph }).unwrap();
        assert_eq!(body["prompt"]["146"]["inputs"]["image1"], json!(["142", 0]));
        assert_eq!(body["prompt"]["147"]["inputs"]["image"], "BBBB");
    }

    #[test]
    fn test_build_workflow_needs_no_config() {
        let dispatcher = dispatcher(&[]);
        let working = dispatcher
            .build_workflow(&GenerationRequest::new("qwen-image", "x"))
            .unwrap();
        assert_eq!(working.template, "qwen_image_t2i");
        assert!(dispatcher.prepare(&GenerationRequest::new("qwen-image", "x")).is_err());
    }
}
