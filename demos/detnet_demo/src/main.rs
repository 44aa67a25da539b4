#![recursion_limit = "256"]

use burn::backend::NdArray;
use burn::config::Config;
use burn::prelude::Tensor;
use clap::Parser;
use detnet::cache::disk::DiskCacheConfig;
use detnet::models::detnet::detnet_model::{DetNet, DetNetMeta};
use detnet::models::detnet::prefabs::DetNetDepth;
use detnet::models::detnet::pretrained::{default_weight_sources, fetch_pretrained_weights};
use detnet::options::TrackerOptions;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Network depth (`resnet18` .. `resnet152`).
    #[arg(long, default_value = "resnet18")]
    depth: String,

    /// Batch size of the demo input.
    #[arg(long, default_value = "1")]
    batch: usize,

    /// Square input resolution.
    #[arg(long, default_value = "448")]
    size: usize,

    /// Stem input channels.
    #[arg(long, default_value = "4")]
    in_channels: usize,

    /// Named pretrained weight source to import.
    #[arg(long)]
    weights: Option<String>,

    /// Drop the checkpoint's stem conv before importing.
    #[arg(long, default_value = "false")]
    drop_stem: bool,

    /// Tracker options JSON; its `backbone` replaces `--depth`.
    #[arg(long)]
    options: Option<String>,

    /// Weight cache directory.
    #[arg(long)]
    cache_dir: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    type B = NdArray<f32>;
    let device = Default::default();

    let depth: DetNetDepth = match &args.options {
        Some(path) => {
            let options = TrackerOptions::load(path)?;
            options.validate()?;
            options.depth()?
        }
        None => args.depth.parse()?,
    };

    let config = depth.to_config().with_in_channels(args.in_channels);
    let mut net: DetNet<B> = config.try_init(&device)?;
    tracing::info!(%depth, weights = net.num_weights(), "built network");

    if let Some(name) = &args.weights {
        let cache = DiskCacheConfig::new().with_root_dir(args.cache_dir.clone());
        let mut weights = fetch_pretrained_weights::<B>(name, &default_weight_sources(), &cache, &device)?;
        if args.drop_stem {
            weights.retain(|name| !name.starts_with("conv1."));
        }
        let (loaded, report) = net.import_state_dict(&weights)?;
        tracing::info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            missing = report.missing.len(),
            "imported {name}"
        );
        net = loaded;
    }

    let input = Tensor::<B, 4>::zeros([args.batch, net.in_channels(), args.size, args.size], &device);
    let output = net.forward(input);

    let min = output.clone().min().into_scalar();
    let max = output.clone().max().into_scalar();
    tracing::info!(
        shape = ?output.dims(),
        grid = ?net.output_resolution([args.size, args.size]),
        min,
        max,
        "forward"
    );

    Ok(())
}
