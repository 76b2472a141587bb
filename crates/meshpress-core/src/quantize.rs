//! Vertex attribute quantization
//!
//! Rewrites float vertex attributes to narrow normalized integer types:
//! positions to i16, normals and tangents to i8, texture coordinates to u16,
//! colors to u8. Position quantization maps every vertex of a mesh into a
//! shared [-1, 1] cube; the inverse transform (uniform scale + offset) is
//! folded into each node referencing the mesh, so rendered geometry is
//! unchanged. Serialized documents that carry quantized attributes declare
//! KHR_mesh_quantization.
//!
//! Primitives with morph targets are skipped; target deltas are relative to
//! the base attribute encoding and would not survive a rescale.

use std::collections::{HashMap, HashSet};

use glam::Vec3;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::document::{
    AccessorId, AttributeData, Document, ElementType, MeshId, Semantic,
};
use crate::glb::EXT_QUANTIZATION;
use crate::Result;

fn default_true() -> bool {
    true
}

/// Configuration for the quantize step
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuantizeOptions {
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub quantize_position: bool,
    /// Also covers tangents
    #[serde(default = "default_true")]
    pub quantize_normal: bool,
    #[serde(default = "default_true")]
    pub quantize_texcoord: bool,
    #[serde(default = "default_true")]
    pub quantize_color: bool,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            quantize_position: true,
            quantize_normal: true,
            quantize_texcoord: true,
            quantize_color: true,
        }
    }
}

/// Statistics from a quantize operation
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantizeStats {
    pub attributes_quantized: Vec<String>,
    pub original_size: usize,
    pub quantized_size: usize,
    pub reduction_ratio: f64,
}

/// Quantize enabled attribute classes across the document.
pub fn quantize(doc: &mut Document, options: &QuantizeOptions) -> Result<QuantizeStats> {
    let mut stats = QuantizeStats::default();
    let mut classes: HashSet<&'static str> = HashSet::new();
    let mut processed: HashSet<AccessorId> = HashSet::new();

    // Position accessors shared across meshes cannot take a per-mesh decode
    // transform; leave them alone.
    let mut position_meshes: HashMap<AccessorId, HashSet<MeshId>> = HashMap::new();
    for (mesh_id, mesh) in doc.iter_meshes() {
        for prim in &mesh.primitives {
            if let Some(id) = prim.position() {
                position_meshes.entry(id).or_default().insert(mesh_id);
            }
        }
    }

    for mesh_id in doc.mesh_ids() {
        if options.quantize_position {
            quantize_mesh_positions(
                doc,
                mesh_id,
                &position_meshes,
                &mut processed,
                &mut classes,
                &mut stats,
            );
        }

        let primitives = match doc.mesh(mesh_id) {
            Some(mesh) => mesh.primitives.clone(),
            None => continue,
        };
        for prim in &primitives {
            if !prim.targets.is_empty() {
                continue;
            }
            for (sem, id) in &prim.attributes {
                if processed.contains(id) {
                    continue;
                }
                let converted = match sem {
                    Semantic::Normal if options.quantize_normal => {
                        convert(doc, *id, &mut stats, signed_normalized_i8)
                            .then_some("NORMAL")
                    }
                    Semantic::Tangent if options.quantize_normal => {
                        convert(doc, *id, &mut stats, signed_normalized_i8)
                            .then_some("TANGENT")
                    }
                    Semantic::TexCoord(_) if options.quantize_texcoord => {
                        convert_texcoord(doc, *id, &mut stats).then_some("TEXCOORD")
                    }
                    Semantic::Color(_) if options.quantize_color => {
                        convert(doc, *id, &mut stats, unsigned_normalized_u8)
                            .then_some("COLOR")
                    }
                    _ => None,
                };
                if let Some(class) = converted {
                    processed.insert(*id);
                    classes.insert(class);
                }
            }
        }
    }

    // Report classes in a stable order.
    for class in ["POSITION", "NORMAL", "TANGENT", "TEXCOORD", "COLOR"] {
        if classes.contains(class) {
            stats.attributes_quantized.push(class.to_string());
        }
    }
    if !stats.attributes_quantized.is_empty() {
        doc.mark_extension_used(EXT_QUANTIZATION, true);
    }

    stats.reduction_ratio = if stats.original_size == 0 {
        1.0
    } else {
        stats.quantized_size as f64 / stats.original_size as f64
    };
    debug!(
        "quantize: {:?}, {} -> {} bytes",
        stats.attributes_quantized, stats.original_size, stats.quantized_size
    );
    Ok(stats)
}

/// Quantize all POSITION accessors of one mesh into a shared cube and fold
/// the decode transform into the referencing nodes.
fn quantize_mesh_positions(
    doc: &mut Document,
    mesh_id: MeshId,
    position_meshes: &HashMap<AccessorId, HashSet<MeshId>>,
    processed: &mut HashSet<AccessorId>,
    classes: &mut HashSet<&'static str>,
    stats: &mut QuantizeStats,
) {
    let candidates: Vec<AccessorId> = match doc.mesh(mesh_id) {
        Some(mesh) => mesh
            .primitives
            .iter()
            .filter(|prim| prim.targets.is_empty())
            .filter_map(|prim| prim.position())
            .filter(|id| {
                position_meshes
                    .get(id)
                    .map(|meshes| meshes.len() == 1)
                    .unwrap_or(false)
            })
            .filter(|id| !processed.contains(id))
            .filter(|id| {
                doc.accessor(*id)
                    .map(|a| a.element == ElementType::Vec3 && a.data.as_f32().is_some())
                    .unwrap_or(false)
            })
            .collect(),
        None => return,
    };
    if candidates.is_empty() {
        return;
    }

    // Union bounds over every primitive that will be rewritten.
    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    for id in &candidates {
        if let Some(values) = doc.accessor(*id).and_then(|a| a.data.as_f32()) {
            for p in values.chunks_exact(3) {
                let v = Vec3::new(p[0], p[1], p[2]);
                min = min.min(v);
                max = max.max(v);
            }
        }
    }
    if !min.is_finite() || !max.is_finite() {
        return;
    }
    let center = (min + max) * 0.5;
    let half_extent = ((max - min) * 0.5).max_element().max(1e-6);

    for id in candidates {
        let Some(acc) = doc.accessor_mut(id) else {
            continue;
        };
        let Some(values) = acc.data.as_f32() else {
            continue;
        };
        stats.original_size += acc.byte_len();
        let quantized: Vec<i16> = values
            .chunks_exact(3)
            .flat_map(|p| {
                let normalized = (Vec3::new(p[0], p[1], p[2]) - center) / half_extent;
                normalized
                    .to_array()
                    .into_iter()
                    .map(|v| (v.clamp(-1.0, 1.0) * 32767.0).round() as i16)
                    .collect::<Vec<i16>>()
            })
            .collect();
        acc.data = AttributeData::I16(quantized);
        acc.normalized = true;
        acc.min = None;
        acc.max = None;
        stats.quantized_size += acc.byte_len();
        processed.insert(id);
        classes.insert("POSITION");
    }

    // Fold decode transform into every node drawing this mesh:
    // p = center + half_extent * q, with q the normalized stored value.
    for node_id in doc.node_ids() {
        let Some(node) = doc.node_mut(node_id) else {
            continue;
        };
        if node.mesh != Some(mesh_id) {
            continue;
        }
        let (t, r, s) = node.trs();
        node.matrix = None;
        node.translation = t + r * (s * center);
        node.rotation = r;
        node.scale = s * half_extent;
    }
}

fn signed_normalized_i8(values: &[f32]) -> AttributeData {
    AttributeData::I8(
        values
            .iter()
            .map(|&v| (v.clamp(-1.0, 1.0) * 127.0).round() as i8)
            .collect(),
    )
}

fn unsigned_normalized_u8(values: &[f32]) -> AttributeData {
    AttributeData::U8(
        values
            .iter()
            .map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
    )
}

/// Convert an f32 accessor in place with the given mapping. Returns false if
/// the accessor is not eligible.
fn convert(
    doc: &mut Document,
    id: AccessorId,
    stats: &mut QuantizeStats,
    mapping: fn(&[f32]) -> AttributeData,
) -> bool {
    let Some(acc) = doc.accessor_mut(id) else {
        return false;
    };
    let Some(values) = acc.data.as_f32() else {
        return false;
    };
    stats.original_size += acc.byte_len();
    acc.data = mapping(values);
    acc.normalized = true;
    acc.min = None;
    acc.max = None;
    stats.quantized_size += acc.byte_len();
    true
}

/// Texture coordinates quantize to normalized u16 only when they stay inside
/// the unit square; tiling coordinates keep full precision.
fn convert_texcoord(doc: &mut Document, id: AccessorId, stats: &mut QuantizeStats) -> bool {
    let in_range = doc
        .accessor(id)
        .and_then(|a| a.data.as_f32())
        .map(|values| values.iter().all(|&v| (0.0..=1.0).contains(&v)))
        .unwrap_or(false);
    if !in_range {
        return false;
    }
    convert(doc, id, stats, |values| {
        AttributeData::U16(
            values
                .iter()
                .map(|&v| (v.clamp(0.0, 1.0) * 65535.0).round() as u16)
                .collect(),
        )
    })
}
