//! Flux Kontext binary: loads a model from a job config, renders its sample
//! requests and optionally writes the transformer back out.

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use kontext_trainer::trainers::load_config;
use kontext_trainer::FluxKontextModel;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Flux Kontext sampling and export", long_about = None)]
struct Args {
    /// Path to the job config (YAML)
    config: PathBuf,

    /// Output directory for samples and saved weights
    #[arg(long, default_value = "./output")]
    output_dir: PathBuf,

    /// Run on the CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,

    /// Save the transformer and run metadata after sampling
    #[arg(long)]
    save_model: bool,
}

fn select_device(cpu: bool, requested: Option<&str>) -> Result<Device> {
    if cpu || requested == Some("cpu") {
        return Ok(Device::Cpu);
    }
    let ordinal = requested
        .and_then(|d| d.strip_prefix("cuda:"))
        .map(|n| n.parse::<usize>())
        .transpose()
        .context("Invalid CUDA device ordinal")?
        .unwrap_or(0);
    Ok(Device::cuda_if_available(ordinal)?)
}

fn main() -> Result<()> {
    kontext_trainer::logging::init_logger();
    let args = Args::parse();

    info!("Starting with config: {}", args.config.display());
    let config = load_config(&args.config)?;
    let job_name = config.config.name.clone().unwrap_or_else(|| "kontext".to_string());

    for process in &config.config.process {
        let device = select_device(args.cpu, process.device.as_deref())?;
        let mut model = FluxKontextModel::load(&process.model, &device)
            .with_context(|| format!("Failed to load model from {}", process.model.name_or_path))?;

        let samples = process.sample.as_ref().map(|s| s.samples.as_slice()).unwrap_or_default();
        for (i, request) in samples.iter().enumerate() {
            let image = model
                .generate_image(request)
                .with_context(|| format!("Failed to generate sample {i}"))?;
            let path = match &request.output_path {
                Some(path) => PathBuf::from(path),
                None => args.output_dir.join("samples").join(format!("{job_name}_{i:03}.png")),
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            image
                .save(&path)
                .with_context(|| format!("Failed to save sample to {}", path.display()))?;
            info!("Saved sample to {}", path.display());
        }

        if args.save_model {
            let save_dtype = process.save.as_ref().map(|s| s.dtype).unwrap_or_default().dtype();
            let weights = model
                .save_model(&args.output_dir.join(&job_name), &config.meta, save_dtype)
                .context("Failed to save model")?;
            info!("Saved model to {}", weights.display());
        }
    }

    info!("Done");
    Ok(())
}
