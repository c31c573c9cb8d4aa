use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use dicom_contour::{
    config::{AssemblyConfig, PipelineConfig, StoreConfig},
    enums::{Normalization, ResolveMode, SeriesPolicy},
    pipeline::Orchestrator,
    stages::{Model, SegmentationEncoder, ThresholdModel, ZeroModel},
    store::OrthancClient,
};
use tracing_subscriber::EnvFilter;

/// Contour one study held in an Orthanc store.
///
/// The store is configured through ORTHANC_URL, ORTHANC_USERNAME,
/// ORTHANC_PASSWORD and ORTHANC_TIMEOUT_SECONDS.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Store id of the study, or of one of its instances with --by-instance.
    identifier: String,

    #[arg(long)]
    by_instance: bool,

    /// Pool every series of the study instead of using the first one.
    #[arg(long)]
    all_series: bool,

    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Label voxels at or above this value instead of running the zero model.
    #[arg(long)]
    threshold: Option<f32>,

    /// Window the volume before inference, as CENTER,WIDTH.
    #[arg(long, value_parser = parse_window)]
    window: Option<(f32, f32)>,

    /// Keep the encoded result instead of uploading it.
    #[arg(long)]
    no_upload: bool,

    #[arg(long)]
    json_logs: bool,
}

fn parse_window(value: &str) -> Result<(f32, f32), String> {
    let (center, width) = value
        .split_once(',')
        .ok_or_else(|| "expected CENTER,WIDTH".to_string())?;
    let parse = |v: &str| v.trim().parse::<f32>().map_err(|e| e.to_string());
    Ok((parse(center)?, parse(width)?))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let store = OrthancClient::new(StoreConfig::from_env()).context("building store client")?;
    let model: Arc<dyn Model> = match args.threshold {
        Some(threshold) => Arc::new(ThresholdModel::new(threshold)),
        None => Arc::new(ZeroModel),
    };
    let config = PipelineConfig::default()
        .with_assembly(
            AssemblyConfig::default()
                .with_series_policy(if args.all_series {
                    SeriesPolicy::AllSeries
                } else {
                    SeriesPolicy::FirstSeries
                })
                .with_fetch_concurrency(args.concurrency),
        )
        .with_normalization(match args.window {
            Some((center, width)) => Normalization::Window { center, width },
            None => Normalization::None,
        })
        .with_upload(!args.no_upload);
    let mode = if args.by_instance {
        ResolveMode::ByInstance
    } else {
        ResolveMode::ByStudy
    };

    let orchestrator = Orchestrator::new(
        Arc::new(store),
        model,
        Arc::new(SegmentationEncoder::default()),
        config,
    );

    match orchestrator.run(&args.identifier, mode).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(failed) => {
            println!("{}", serde_json::to_string_pretty(&failed.status())?);
            Ok(ExitCode::FAILURE)
        }
    }
}
