use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use tch::Device;
use tqdm::tqdm;

mod augment;
mod config;
mod cutouts;
mod encoder;
mod error;
mod export;
mod generator;
mod grad;
mod latent;
mod logging;
mod loss;
mod prompt;
mod protocol;
mod resample;
mod train;

#[cfg(test)]
mod testing;

use config::{RunConfig, Variant};
use encoder::PromptTokenizer;
use export::save_frame;
use prompt::parse_prompt;
use train::Trainer;

#[derive(Parser, Debug)]
#[command(version, about = "Text-guided image synthesis by latent optimization.", long_about = None)]
struct Args {
    /// `text[:weight[:stop]]`; repeat for several prompts.
    #[arg(short, long, required = true)]
    prompt: Vec<String>,
    /// biggan, dall-e, stylegan or vqgan.
    #[arg(short, long)]
    generator: Option<String>,
    /// TorchScript export of the generator.
    #[arg(long)]
    generator_model: PathBuf,
    /// TorchScript export of the CLIP encoder.
    #[arg(long)]
    clip_model: PathBuf,
    /// CLIP tokenizer.json.
    #[arg(long)]
    tokenizer: PathBuf,
    /// YAML run configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    iters: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    /// Write a preview frame every N steps.
    #[arg(long)]
    save_every: Option<usize>,
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

fn load_config(args: &Args) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(generator) = &args.generator {
        config.variant = generator.parse::<Variant>()?;
    }
    if let Some(iters) = args.iters {
        config.iterations = iters;
    }
    if let Some(lr) = args.lr {
        config.learning_rate = lr;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(save_every) = args.save_every {
        config.save_every = save_every;
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    logging::init_logger();
    let args = Args::parse();

    print_oss_license();

    let config = load_config(&args)?;
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    info!("Use Device: {device:?}");
    if let Some(seed) = config.seed {
        tch::manual_seed(seed as i64);
    }

    let prompts = args
        .prompt
        .iter()
        .map(|p| parse_prompt(p))
        .collect::<Result<Vec<_>, _>>()?;
    let tokenizer = PromptTokenizer::load(&args.tokenizer, device)
        .with_context(|| format!("loading tokenizer {}", args.tokenizer.display()))?;
    let protocol = protocol::build(
        &config,
        device,
        &args.generator_model,
        &args.clip_model,
        &tokenizer,
        &prompts,
    )
    .context("building the generator protocol")?;
    let mut trainer = Trainer::new(protocol, &config)?;

    info!("Generator: {}", trainer.protocol().variant());
    for p in &prompts {
        info!("Prompt: {} (weight {}, stop {})", p.text, p.weight, p.stop);
    }
    info!("Iterations: {}", config.iterations);
    info!("Learning Rate: {}", config.learning_rate);
    info!("Output Dir: {}", config.output_dir.display());

    let mut snapshot = None;
    for i in tqdm(0..config.iterations) {
        snapshot = trainer.train(i)?;

        if (i + 1) % 10 == 0 {
            if let Some(loss) = trainer.last_loss() {
                info!("{}: LOSS({loss:.5})", i + 1);
            }
        }

        if config.save_every > 0 && (i + 1) % config.save_every == 0 {
            let protocol = trainer.protocol();
            let frame = protocol.render(&protocol.latent())?;
            let path = config.output_dir.join(format!("{}.png", i + 1));
            save_frame(&frame, protocol.pixel_range(), &path)?;
        }
    }

    info!("Final loss: {:.5}", trainer.evaluate()?);

    let Some(latent) = snapshot else {
        bail!("training ended without a final latent");
    };
    let protocol = trainer.protocol();
    let frame = protocol.render(&latent)?;
    let path = config.output_dir.join("final.png");
    save_frame(&frame, protocol.pixel_range(), &path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Saved: {}", path.display());

    Ok(())
}

fn print_oss_license() {
    println!("OSS Library: PyTorch");
    println!("URL: https://github.com/pytorch/pytorch");
    println!("License: 3-Clause BSD License");
    println!();
    println!("OSS Library: tch-rs");
    println!("URL: https://github.com/LaurentMazare/tch-rs");
    println!("License: MIT License");
    println!();
    println!("OSS Library: tokenizers");
    println!("URL: https://github.com/huggingface/tokenizers");
    println!("License: Apache License Version 2.0");
    println!();
    println!("OSS Library: anyhow");
    println!("URL: https://github.com/dtolnay/anyhow");
    println!("License: Apache License Version 2.0");
    println!();
    println!("OSS Library: serde / serde_yaml");
    println!("URL: https://github.com/serde-rs/serde");
    println!("License: MIT OR Apache-2.0");
    println!();
    println!("OSS Library: thiserror");
    println!("URL: https://github.com/dtolnay/thiserror");
    println!("License: MIT OR Apache-2.0");
    println!();
    println!("OSS Library: log / env_logger");
    println!("URL: https://github.com/rust-lang/log");
    println!("License: MIT OR Apache-2.0");
    println!();
    println!("OSS Library: chrono");
    println!("URL: https://github.com/chronotope/chrono");
    println!("License: MIT OR Apache-2.0");
    println!();
    println!("OSS Library: rand / rand_distr");
    println!("URL: https://github.com/rust-random/rand");
    println!("License: MIT OR Apache-2.0");
    println!();
    println!("OSS Library: tqdm");
    println!("URL: https://github.com/mrlazy1708/tqdm");
    println!("License: MIT OR Apache-2.0");
    println!();
    println!("OSS Library: clap");
    println!("URL: https://github.com/clap-rs/clap");
    println!("License: MIT OR Apache-2.0");
    println!("--------");
    println!();
}
