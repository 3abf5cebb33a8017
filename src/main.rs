use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::{prelude::*, stream::FuturesUnordered};
use log::{error, info};

use sd_dispatch::{
    config::{self, DispatchConfig},
    utils, Base64Image, Dispatcher, GenerationRequest,
};

#[derive(Parser, Debug)]
#[command(about = "Send one generation request to a ComfyUI backend")]
struct CommandLineFlags {
    /// Optional TOML file with backend URLs. Environment variables win over it.
    #[arg(long, short)]
    pub config_path: Option<PathBuf>,
    #[arg(long, short, default_value = "sdxl")]
    pub model: String,
    #[arg(long, short, required_unless_present = "list_models")]
    pub prompt: Option<String>,
    #[arg(long, short)]
    pub negative: Option<String>,
    #[arg(long, default_value_t = 1024)]
    pub width: u32,
    #[arg(long, default_value_t = 1024)]
    pub height: u32,
    #[arg(long, default_value_t = 20)]
    pub steps: u32,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Number of images. Each is a separate request with its own seed.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub count: u32,
    /// Reference image; repeat for more.
    #[arg(long = "image", short = 'i')]
    pub images: Vec<PathBuf>,
    #[arg(long, short, default_value = ".")]
    pub output_dir: PathBuf,
    /// Print the finished workflow instead of submitting it.
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub list_models: bool,
}

impl CommandLineFlags {
    fn request(&self) -> Result<GenerationRequest> {
        let mut request = GenerationRequest::new(&self.model, self.prompt.as_deref().unwrap_or_default());
        request.negative_prompt = self.negative.clone();
        request.width = self.width;
        request.height = self.height;
        request.steps = self.steps;
        request.seed = Some(self.seed.unwrap_or_else(rand::random));
        request.batch_size = self.count;
        for path in &self.images {
            let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            request.reference_images.push(Base64Image::from_bytes(&data));
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let config = match &args.config_path {
        Some(path) => config::read_config(path).context("failed to initialize config")?,
        None => DispatchConfig::default(),
    };
    info!("Loaded config: {:?}", config);

    let dispatcher = Dispatcher::builtin(Arc::new(config.source()))
        .context("workflow catalog failed verification")?
        .with_submit_path(&config.submit_path);

    if args.list_models {
        for profile in dispatcher.registry().list() {
            println!(
                "{:<16} t2i={:<5} i2i={:<5} refs={} {}",
                profile.model_id,
                profile.supports_t2i,
                profile.supports_i2i,
                profile.max_reference_images,
                profile.base_url_env_var
            );
        }
        return Ok(());
    }

    let request = args.request()?;
    let requests = request.split_batch(request.seed.unwrap_or_default());

    if args.dry_run {
        for request in &requests {
            let working = dispatcher.build_workflow(request)?;
            println!("{}", serde_json::to_string_pretty(&working.graph.to_json()?)?);
        }
        return Ok(());
    }

    let batch = uuid::Uuid::new_v4();
    let mut runners = requests
        .iter()
        .enumerate()
        .map(|(i, request)| dispatcher.dispatch(request).map(move |result| (i, result)))
        .collect::<FuturesUnordered<_>>();

    let mut failures = 0;
    while let Some((i, result)) = runners.next().await {
        match result {
            Ok(data_url) => {
                let path = utils::save_image(&args.output_dir, &batch, i, &data_url)?;
                println!("{}", path.display());
            }
            Err(e) => {
                error!("Image {} failed [{}]: {}", i, e.kind(), e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{} of {} images failed", failures, requests.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_must_be_positive() {
        let args = CommandLineFlags::try_parse_from(["sd-dispatch", "-p", "x", "--count", "3"]).unwrap();
        assert_eq!(args.count, 3);
        assert!(CommandLineFlags::try_parse_from(["sd-dispatch", "-p", "x", "--count", "0"]).is_err());
    }

    #[test]
    fn test_prompt_required_unless_listing() {
        assert!(CommandLineFlags::try_parse_from(["sd-dispatch"]).is_err());
        assert!(CommandLineFlags::try_parse_from(["sd-dispatch", "--list-models"]).is_ok());
    }
}
