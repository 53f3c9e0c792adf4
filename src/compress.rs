//! Client-side attachment compression.
//!
//! Photos are embedded inline in documents as `data:` URIs, so they have to
//! stay well under the store's per-document ceiling. Images wider than
//! `max_width` are scaled down proportionally and re-encoded as JPEG; if the
//! estimated size is still above [`MAX_ENCODED_BYTES`] one more pass is made at
//! [`FALLBACK_QUALITY`] and that result is taken as is.

use crate::config::Compression;
use crate::error::CompressError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::DynamicImage;
use image::imageops::FilterType;
use std::path::Path;
use std::sync::Arc;

pub const MAX_ENCODED_BYTES: usize = 500 * 1024;
pub const FALLBACK_QUALITY: f32 = 0.5;
const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

pub trait RasterEncoder: Send + Sync + 'static {
    fn encode(&self, image: &DynamicImage, quality: f32) -> Result<Vec<u8>, CompressError>;
}

pub struct JpegEncoder;

impl RasterEncoder for JpegEncoder {
    fn encode(&self, image: &DynamicImage, quality: f32) -> Result<Vec<u8>, CompressError> {
        let rgb = image.to_rgb8();
        let quality = (quality.clamp(0.0, 1.0) * 100.0).round().max(1.0) as u8;
        let mut buf = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
        encoder
            .encode_image(&rgb)
            .map_err(|e| CompressError::Encode(e.to_string()))?;
        Ok(buf)
    }
}

#[derive(Debug, Clone)]
pub struct Compressed {
    pub data_uri: String,
    pub width: u32,
    pub height: u32,
    /// Quality of the pass that produced `data_uri`.
    pub quality: f32,
    pub passes: u8,
}

impl Compressed {
    pub fn estimated_bytes(&self) -> usize {
        estimate_bytes(self.data_uri.len())
    }
}

/// Approximates decoded size from base64 length. Soft budget only.
pub fn estimate_bytes(encoded_len: usize) -> usize {
    (encoded_len as f64 * 0.75) as usize
}

fn over_budget(encoded_len: usize) -> bool {
    encoded_len as f64 * 0.75 > MAX_ENCODED_BYTES as f64
}

/// Never upscales.
pub fn target_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || width == 0 {
        return (width, height);
    }
    let scaled = (height as f64 * max_width as f64 / width as f64).round() as u32;
    (max_width, scaled.max(1))
}

fn to_data_uri(bytes: &[u8]) -> String {
    let mut uri = String::with_capacity(DATA_URI_PREFIX.len() + bytes.len() * 4 / 3 + 4);
    uri.push_str(DATA_URI_PREFIX);
    STANDARD.encode_string(bytes, &mut uri);
    uri
}

pub struct Compressor<E = JpegEncoder> {
    max_width: u32,
    quality: f32,
    encoder: Arc<E>,
}

impl Compressor<JpegEncoder> {
    pub fn new(cfg: Compression) -> Self {
        Compressor::with_encoder(cfg, JpegEncoder)
    }
}

impl<E: RasterEncoder> Compressor<E> {
    pub fn with_encoder(cfg: Compression, encoder: E) -> Self {
        Compressor {
            max_width: cfg.max_width.max(1),
            quality: cfg.quality,
            encoder: Arc::new(encoder),
        }
    }

    pub async fn compress_file(&self, path: impl AsRef<Path>) -> Result<Compressed, CompressError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        self.compress(bytes).await
    }

    /// The caller is expected to have rejected non-image uploads already.
    pub async fn compress(&self, bytes: Vec<u8>) -> Result<Compressed, CompressError> {
        let encoder = self.encoder.clone();
        let max_width = self.max_width;
        let quality = self.quality;

        let compressed = tokio::task::spawn_blocking(move || {
            compress_blocking(encoder.as_ref(), &bytes, max_width, quality)
        })
        .await??;

        tracing::debug!(
            width = compressed.width,
            height = compressed.height,
            passes = compressed.passes,
            estimated_bytes = compressed.estimated_bytes(),
            "image compressed"
        );
        Ok(compressed)
    }
}

fn compress_blocking<E: RasterEncoder>(
    encoder: &E,
    bytes: &[u8],
    max_width: u32,
    quality: f32,
) -> Result<Compressed, CompressError> {
    let decoded = image::load_from_memory(bytes).map_err(CompressError::Decode)?;
    let (width, height) = target_dimensions(decoded.width(), decoded.height(), max_width);

    let raster = if (width, height) == (decoded.width(), decoded.height()) {
        decoded
    } else {
        decoded.resize_exact(width, height, FilterType::Triangle)
    };

    let first = to_data_uri(&encoder.encode(&raster, quality)?);
    if !over_budget(first.len()) {
        return Ok(Compressed {
            data_uri: first,
            width,
            height,
            quality,
            passes: 1,
        });
    }

    tracing::debug!(
        estimated_bytes = estimate_bytes(first.len()),
        "first pass over budget, re-encoding at fallback quality"
    );
    let second = to_data_uri(&encoder.encode(&raster, FALLBACK_QUALITY)?);
    Ok(Compressed {
        data_uri: second,
        width,
        height,
        quality: FALLBACK_QUALITY,
        passes: 2,
    })
}
