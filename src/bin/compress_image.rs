use adipura::compress::{Compressed, Compressor};
use adipura::config::Compression;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "compress_image")]
#[command(about = "Compress an image the way attachments are compressed before upload")]
struct Cli {
    image_path: String,
    #[arg(long, default_value_t = 800)]
    max_width: u32,
    #[arg(long, default_value_t = 0.7)]
    quality: f32,
    /// Write the resulting data URI to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(short, long)]
    pretty: bool,
}

#[derive(Debug, Serialize)]
struct CompressionReport {
    filename: String,
    original_bytes: u64,
    width: u32,
    height: u32,
    quality: f32,
    passes: u8,
    estimated_bytes: usize,
}

fn report(path: &Path, original_bytes: u64, compressed: &Compressed) -> CompressionReport {
    CompressionReport {
        filename: path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string(),
        original_bytes,
        width: compressed.width,
        height: compressed.height,
        quality: compressed.quality,
        passes: compressed.passes,
        estimated_bytes: compressed.estimated_bytes(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = Path::new(&cli.image_path);

    if !path.is_file() {
        anyhow::bail!("Path is not a file: {}", path.display());
    }
    if !(0.0..=1.0).contains(&cli.quality) {
        anyhow::bail!("quality must be between 0 and 1, got {}", cli.quality);
    }

    let original_bytes = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat image: {}", path.display()))?
        .len();

    let compressor = Compressor::new(Compression {
        max_width: cli.max_width,
        quality: cli.quality,
    });
    let compressed = compressor
        .compress_file(path)
        .await
        .with_context(|| format!("Failed to compress image: {}", path.display()))?;

    if let Some(output) = &cli.output {
        tokio::fs::write(output, &compressed.data_uri)
            .await
            .with_context(|| format!("Failed to write data URI: {}", output.display()))?;
    }

    let summary = report(path, original_bytes, &compressed);
    if cli.pretty {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", serde_json::to_string(&summary)?);
    }

    Ok(())
}
