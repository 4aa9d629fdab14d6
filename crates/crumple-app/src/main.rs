use std::path::PathBuf;
use anyhow::{bail, Context};
use clap::Parser;
use log::info;
use tokio::sync::broadcast::error::RecvError;
use crumple_app::config::AppConfig;
use crumple_app::{build_orchestrator, TransformEvent};
use crumple_core::clicks::ClickTracker;
use crumple_core::image_data::{decode_base64, encode_base64, strip_data_uri, to_data_uri, DEFAULT_MIME};
use crumple_core::{TransformOptions, TransformType};

/// Crumple a photo through the configured image-to-image service
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Source image path
    image: PathBuf,

    /// Transform to apply when --clicks is not given ("light", "heavy" or a configured profile)
    #[arg(short = 't', long = "type", default_value = "light")]
    transform_type: TransformType,

    /// Simulate this many clicks; every crossed damage threshold fires a transform
    #[arg(long)]
    clicks: Option<u32>,

    /// Where to write the result
    #[arg(short, long, default_value = "crumpled.png")]
    out: PathBuf,

    #[arg(long)]
    strength: Option<f32>,

    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = AppConfig::load()?;
    let orchestrator = build_orchestrator(&config)?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransformEvent::Progress { phase, progress, eta }) => {
                    info!("{:>3}% {} (eta {:?})", progress, phase.label(), eta);
                }
                Ok(TransformEvent::AttemptFailed { attempt, error, retry_in: Some(delay) }) => {
                    info!("Attempt {} failed: {}; retrying in {:?}", attempt, error, delay);
                }
                Ok(TransformEvent::CacheHit(key)) => info!("Served {} from cache", key),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let bytes = tokio::fs::read(&args.image)
        .await
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let mime = image::guess_format(&bytes).map_or(DEFAULT_MIME, |format| format.to_mime_type());
    let mut current = to_data_uri(mime, &encode_base64(&bytes));

    let options = TransformOptions {
        strength: args.strength,
        seed: args.seed,
        ..TransformOptions::default()
    };

    let plan = match args.clicks {
        Some(clicks) => {
            let mut tracker = ClickTracker::default();
            (0..clicks).filter_map(|_| tracker.register_click()).collect()
        }
        None => vec![args.transform_type.clone()],
    };
    if plan.is_empty() {
        bail!("{} click(s) did not cross any damage threshold", args.clicks.unwrap_or(0));
    }

    for transform_type in plan {
        info!("Applying {} ({})", transform_type, transform_type.description());
        let result = orchestrator
            .transform(current.clone(), transform_type, options.clone())
            .await?;
        info!(
            "{} transform finished in {} ms ({} attempt(s))",
            result.transform_type, result.processing_time_ms, result.attempts
        );
        if let Some(image) = result.transformed_image {
            current = image;
        }
    }

    let output = decode_base64(strip_data_uri(&current)).context("transformed image is not valid base64")?;
    tokio::fs::write(&args.out, output)
        .await
        .with_context(|| format!("failed to write {}", args.out.display()))?;

    println!("Wrote {}", args.out.display());
    println!("{}", serde_json::to_string_pretty(&orchestrator.stats())?);
    Ok(())
}
