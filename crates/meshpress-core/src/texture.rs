//! Texture re-encoding
//!
//! Re-encodes PNG/JPEG textures as Basis Universal KTX2 (ETC1S or UASTC)
//! when the `ktx2` feature provides the native encoder, or through a compact
//! fallback path otherwise: lossy JPEG for opaque images, lossless WebP when
//! alpha must survive. A re-encode that fails to shrink a texture keeps the
//! original bytes, so processed textures never grow in aggregate.
//!
//! With a `slots` filter only textures reachable from a material through one
//! of the named slots are touched; everything else is processed.

use std::collections::HashSet;

use image::ImageEncoder;
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::document::{Document, MaterialSlot, TextureId};
use crate::glb::EXT_BASISU;
use crate::{OptimizeError, Result};

/// Basis Universal encoder selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum TextureMode {
    #[default]
    #[serde(rename = "ETC1S")]
    Etc1s,
    #[serde(rename = "UASTC")]
    Uastc,
}

/// Configuration for the texture step
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextureOptions {
    pub enabled: bool,
    pub mode: TextureMode,
    /// ETC1S: 1..=255 (default 128); UASTC: 0..=4 (default 2)
    pub quality: Option<u16>,
    /// Material slot filter, e.g. `["baseColorTexture", "normalTexture"]`
    pub slots: Option<Vec<String>>,
}

/// Per-texture compression record
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextureDetail {
    pub name: String,
    pub original_format: String,
    pub original_size: usize,
    pub compressed_size: usize,
}

/// Statistics from a texture operation
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextureStats {
    pub textures_processed: usize,
    pub original_size: usize,
    pub compressed_size: usize,
    pub compression_ratio: f64,
    /// Which encoder served this run
    pub encoder: String,
    pub details: Vec<TextureDetail>,
}

fn effective_quality(options: &TextureOptions) -> Result<u16> {
    match options.mode {
        TextureMode::Etc1s => {
            let quality = options.quality.unwrap_or(128);
            if !(1..=255).contains(&quality) {
                return Err(OptimizeError::InvalidOptions {
                    field: "quality",
                    expected: "[1, 255] for ETC1S",
                    received: quality.to_string(),
                });
            }
            Ok(quality)
        }
        TextureMode::Uastc => {
            let quality = options.quality.unwrap_or(2);
            if quality > 4 {
                return Err(OptimizeError::InvalidOptions {
                    field: "quality",
                    expected: "[0, 4] for UASTC",
                    received: quality.to_string(),
                });
            }
            Ok(quality)
        }
    }
}

fn parse_slot(name: &str) -> Result<MaterialSlot> {
    match name {
        "baseColorTexture" => Ok(MaterialSlot::BaseColor),
        "normalTexture" => Ok(MaterialSlot::Normal),
        "metallicRoughnessTexture" => Ok(MaterialSlot::MetallicRoughness),
        "occlusionTexture" => Ok(MaterialSlot::Occlusion),
        "emissiveTexture" => Ok(MaterialSlot::Emissive),
        other => Err(OptimizeError::InvalidOptions {
            field: "slots",
            expected: "known material slot names",
            received: other.to_string(),
        }),
    }
}

/// Textures reachable from at least one material via the given slots.
fn textures_in_slots(doc: &Document, slots: &[MaterialSlot]) -> HashSet<TextureId> {
    let mut selected = HashSet::new();
    for (_, material) in doc.iter_materials() {
        for slot in slots {
            if let Some(binding) = material.binding(*slot) {
                selected.insert(binding.texture);
            }
        }
    }
    selected
}

struct EncodeJob {
    id: TextureId,
    name: String,
    mime: String,
    bytes: Vec<u8>,
}

struct EncodeOutcome {
    id: TextureId,
    name: String,
    original_format: String,
    original_size: usize,
    replacement: Option<(Vec<u8>, String)>,
}

/// Re-encode the selected textures.
pub fn compress_textures(doc: &mut Document, options: &TextureOptions) -> Result<TextureStats> {
    let quality = effective_quality(options)?;
    let slot_filter = match &options.slots {
        Some(names) => {
            let slots: Vec<MaterialSlot> = names
                .iter()
                .map(|n| parse_slot(n))
                .collect::<Result<_>>()?;
            Some(textures_in_slots(doc, &slots))
        }
        None => None,
    };

    let jobs: Vec<EncodeJob> = doc
        .iter_textures()
        .filter(|(id, _)| {
            slot_filter
                .as_ref()
                .map(|f| f.contains(id))
                .unwrap_or(true)
        })
        .filter(|(_, tex)| tex.mime == "image/png" || tex.mime == "image/jpeg")
        .map(|(id, tex)| EncodeJob {
            id,
            name: tex
                .name
                .clone()
                .unwrap_or_else(|| format!("texture_{}", id.index())),
            mime: tex.mime.clone(),
            bytes: tex.bytes.clone(),
        })
        .collect();

    let mode = options.mode;
    let outcomes: Vec<Result<EncodeOutcome>> = jobs
        .into_par_iter()
        .map(|job| encode_job(job, mode, quality))
        .collect();

    let mut stats = TextureStats {
        encoder: encoder_name().to_string(),
        ..Default::default()
    };
    let mut produced_ktx2 = false;
    for outcome in outcomes {
        let outcome = outcome?;
        let compressed_size = outcome
            .replacement
            .as_ref()
            .map(|(bytes, _)| bytes.len())
            .unwrap_or(outcome.original_size);
        stats.textures_processed += 1;
        stats.original_size += outcome.original_size;
        stats.compressed_size += compressed_size;
        stats.details.push(TextureDetail {
            name: outcome.name,
            original_format: outcome.original_format,
            original_size: outcome.original_size,
            compressed_size,
        });
        if let Some((bytes, mime)) = outcome.replacement {
            if mime == "image/ktx2" {
                produced_ktx2 = true;
            }
            if let Some(tex) = doc.texture_mut(outcome.id) {
                tex.bytes = bytes;
                tex.mime = mime;
            }
        }
    }

    if produced_ktx2 {
        doc.mark_extension_used(EXT_BASISU, true);
    }
    stats.compression_ratio = if stats.original_size == 0 {
        1.0
    } else {
        stats.compressed_size as f64 / stats.original_size as f64
    };
    debug!(
        "texture: {} processed via {}, {} -> {} bytes",
        stats.textures_processed, stats.encoder, stats.original_size, stats.compressed_size
    );
    Ok(stats)
}

fn encode_job(job: EncodeJob, mode: TextureMode, quality: u16) -> Result<EncodeOutcome> {
    let img = image::load_from_memory(&job.bytes).map_err(|e| {
        OptimizeError::OptimizationFailed {
            step: "texture",
            message: format!("cannot decode {}: {e}", job.name),
        }
    })?;

    let encoded = encode_image(&img, mode, quality).map_err(|message| {
        OptimizeError::OptimizationFailed {
            step: "texture",
            message: format!("cannot encode {}: {message}", job.name),
        }
    })?;

    // Keep the original when re-encoding did not shrink it.
    let replacement = if encoded.0.len() < job.bytes.len() {
        Some(encoded)
    } else {
        warn!(
            "texture {}: re-encode grew {} -> {} bytes, keeping original",
            job.name,
            job.bytes.len(),
            encoded.0.len()
        );
        None
    };

    Ok(EncodeOutcome {
        id: job.id,
        name: job.name,
        original_format: job.mime,
        original_size: job.bytes.len(),
        replacement,
    })
}

#[cfg(feature = "ktx2")]
fn encoder_name() -> &'static str {
    "basis-ktx2"
}

#[cfg(not(feature = "ktx2"))]
fn encoder_name() -> &'static str {
    "image-fallback"
}

/// ETC1S compression effort level 1-5 derived from the quality setting.
#[cfg(feature = "ktx2")]
fn etc1s_compression_level(quality: u16) -> u32 {
    ((quality as f32 / 51.0).round() as u32).clamp(1, 5)
}

#[cfg(feature = "ktx2")]
fn encode_image(
    img: &image::DynamicImage,
    mode: TextureMode,
    quality: u16,
) -> std::result::Result<(Vec<u8>, String), String> {
    use ktx2_rw::{BasisCompressionParams, Ktx2Texture, VkFormat};

    let rgba = img.to_rgba8();
    let mut texture = Ktx2Texture::create(
        img.width(),
        img.height(),
        1,
        1,
        1,
        1,
        VkFormat::R8G8B8A8Unorm,
    )
    .map_err(|e| e.to_string())?;
    texture
        .set_image_data(0, 0, 0, rgba.as_raw())
        .map_err(|e| e.to_string())?;
    texture
        .set_metadata("Tool", b"meshpress")
        .map_err(|e| e.to_string())?;

    let quality_level = match mode {
        TextureMode::Etc1s => quality as u32,
        // Map the 0-4 UASTC scale onto the encoder's 1-255 quality range.
        TextureMode::Uastc => (quality as u32 + 1) * 51,
    };
    let params = BasisCompressionParams::builder()
        .uastc(mode == TextureMode::Uastc)
        .thread_count(num_cpus::get() as u32)
        .quality_level(quality_level)
        .compression_level(match mode {
            TextureMode::Etc1s => etc1s_compression_level(quality),
            TextureMode::Uastc => 2,
        })
        .build();
    texture.compress_basis(&params).map_err(|e| e.to_string())?;
    let bytes = texture.write_to_memory().map_err(|e| e.to_string())?;
    Ok((bytes, "image/ktx2".to_string()))
}

/// Fallback encoder: quality-mapped lossy JPEG for opaque images, lossless
/// WebP when the source carries alpha.
#[cfg(not(feature = "ktx2"))]
fn encode_image(
    img: &image::DynamicImage,
    mode: TextureMode,
    quality: u16,
) -> std::result::Result<(Vec<u8>, String), String> {
    let mut out = Vec::new();
    if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        image::codecs::webp::WebPEncoder::new_lossless(&mut out)
            .write_image(
                rgba.as_raw(),
                img.width(),
                img.height(),
                image::ExtendedColorType::Rgba8,
            )
            .map_err(|e| e.to_string())?;
        Ok((out, "image/webp".to_string()))
    } else {
        let jpeg_quality = match mode {
            TextureMode::Etc1s => ((quality as u32 * 100) / 255).clamp(1, 100) as u8,
            TextureMode::Uastc => (60 + quality as u32 * 10).min(100) as u8,
        };
        let rgb = img.to_rgb8();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, jpeg_quality)
            .write_image(
                rgb.as_raw(),
                img.width(),
                img.height(),
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| e.to_string())?;
        Ok((out, "image/jpeg".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Material, Texture, TextureBinding};

    /// Deterministic pseudo-noise RGB PNG of the given edge size.
    fn make_noise_png(size: u32) -> Vec<u8> {
        let mut state = 0x2545F491u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };
        let img = image::RgbImage::from_fn(size, size, |_, _| {
            let v = next();
            image::Rgb([(v & 0xFF) as u8, ((v >> 8) & 0xFF) as u8, ((v >> 16) & 0xFF) as u8])
        });
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
        bytes
    }

    fn make_doc_with_texture(png: Vec<u8>, bound: bool) -> (Document, TextureId) {
        let mut doc = Document::new();
        let texture = doc.add_texture(Texture {
            name: Some("albedo".into()),
            mime: "image/png".into(),
            bytes: png,
            sampler: None,
        });
        if bound {
            let mut material = Material::default();
            material.base_color = Some(TextureBinding {
                texture,
                tex_coord: 0,
            });
            doc.add_material(material);
        }
        (doc, texture)
    }

    fn enabled() -> TextureOptions {
        TextureOptions {
            enabled: true,
            ..Default::default()
        }
    }

    // ==================== Option validation ====================

    #[test]
    fn test_rejects_etc1s_quality_zero() {
        let (mut doc, _) = make_doc_with_texture(make_noise_png(8), true);
        let options = TextureOptions {
            enabled: true,
            quality: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            compress_textures(&mut doc, &options),
            Err(OptimizeError::InvalidOptions { field: "quality", .. })
        ));
    }

    #[test]
    fn test_rejects_uastc_quality_above_four() {
        let (mut doc, _) = make_doc_with_texture(make_noise_png(8), true);
        let options = TextureOptions {
            enabled: true,
            mode: TextureMode::Uastc,
            quality: Some(5),
            ..Default::default()
        };
        assert!(compress_textures(&mut doc, &options).is_err());
    }

    #[test]
    fn test_rejects_unknown_slot_name() {
        let (mut doc, _) = make_doc_with_texture(make_noise_png(8), true);
        let options = TextureOptions {
            enabled: true,
            slots: Some(vec!["specularTexture".into()]),
            ..Default::default()
        };
        assert!(matches!(
            compress_textures(&mut doc, &options),
            Err(OptimizeError::InvalidOptions { field: "slots", .. })
        ));
    }

    // ==================== Processing ====================

    #[test]
    fn test_noise_png_shrinks_and_mime_updates() {
        let png = make_noise_png(128);
        let original_len = png.len();
        let (mut doc, id) = make_doc_with_texture(png, true);

        let stats = compress_textures(&mut doc, &enabled()).unwrap();
        assert_eq!(stats.textures_processed, 1);
        assert_eq!(stats.details.len(), 1);
        assert_eq!(stats.original_size, original_len);
        assert!(stats.compressed_size < stats.original_size);
        assert!(stats.details[0].original_size > 0);

        let tex = doc.texture(id).unwrap();
        assert_ne!(tex.mime, "image/png");
        assert!(tex.bytes.len() < original_len);
    }

    #[test]
    fn test_zero_textures_is_not_an_error() {
        let mut doc = Document::new();
        let stats = compress_textures(&mut doc, &enabled()).unwrap();
        assert_eq!(stats.textures_processed, 0);
        assert_eq!(stats.compression_ratio, 1.0);
        assert!(stats.details.is_empty());
    }

    #[test]
    fn test_slot_filter_skips_unbound_texture() {
        let (mut doc, id) = make_doc_with_texture(make_noise_png(32), false);
        let options = TextureOptions {
            enabled: true,
            slots: Some(vec!["baseColorTexture".into()]),
            ..Default::default()
        };
        let stats = compress_textures(&mut doc, &options).unwrap();
        assert_eq!(stats.textures_processed, 0);
        assert_eq!(doc.texture(id).unwrap().mime, "image/png");
    }

    #[test]
    fn test_slot_filter_selects_bound_texture() {
        let (mut doc, _) = make_doc_with_texture(make_noise_png(32), true);
        let options = TextureOptions {
            enabled: true,
            slots: Some(vec!["baseColorTexture".into()]),
            ..Default::default()
        };
        let stats = compress_textures(&mut doc, &options).unwrap();
        assert_eq!(stats.textures_processed, 1);
    }

    #[test]
    fn test_details_length_matches_processed() {
        let (mut doc, _) = make_doc_with_texture(make_noise_png(16), true);
        let second = make_noise_png(24);
        doc.add_texture(Texture {
            name: None,
            mime: "image/png".into(),
            bytes: second,
            sampler: None,
        });
        let stats = compress_textures(&mut doc, &enabled()).unwrap();
        assert_eq!(stats.textures_processed, 2);
        assert_eq!(stats.details.len(), 2);
    }

    #[test]
    fn test_alpha_source_takes_webp_path() {
        let img = image::RgbaImage::from_fn(32, 32, |x, y| {
            image::Rgba([x as u8 * 8, y as u8 * 8, 0, 128])
        });
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let (mut doc, id) = make_doc_with_texture(png, true);

        let stats = compress_textures(&mut doc, &enabled()).unwrap();
        assert_eq!(stats.textures_processed, 1);
        let tex = doc.texture(id).unwrap();
        // Smooth gradient with alpha: either shrunk to webp/ktx2 or kept.
        if cfg!(feature = "ktx2") {
            assert!(tex.mime == "image/ktx2" || tex.mime == "image/png");
        } else {
            assert!(tex.mime == "image/webp" || tex.mime == "image/png");
        }
    }
}
