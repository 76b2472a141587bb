//! Two-phase geometry sanitizer
//!
//! `repair_input` runs before any optimization step and `repair_output`
//! after the last one, so every step in between can assume finite vertex
//! data, unit-length normals and well-formed tangents, and the serialized
//! file upholds the same guarantees.
//!
//! Shared checks:
//! - scrub `NaN`/`Inf` components out of `POSITION`, `NORMAL`, `TEXCOORD_0/1`
//! - regenerate normals whose sampled vectors are non-finite or far from unit length
//! - drop tangent accessors that are not VEC4 or whose `|w|` strays from 1
//! - dispose empty accessors nothing references
//!
//! `repair_output` additionally generates normals for primitives that lost
//! theirs along the way.

use std::collections::HashSet;

use glam::Vec3;
use log::debug;
use rayon::prelude::*;
use serde::Serialize;

use crate::document::{
    Accessor, AccessorId, AttributeData, Document, ElementType, MeshId, PrimitiveMode, RefIndex,
    Semantic,
};
use crate::Result;

/// Sampled normals must stay within this length band to count as valid.
const NORMAL_LENGTH_MIN: f32 = 0.5;
const NORMAL_LENGTH_MAX: f32 = 1.5;
/// Allowed deviation of a tangent's `|w|` from 1.
const TANGENT_W_TOLERANCE: f32 = 0.1;

/// Statistics from one sanitizer phase
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryFixResult {
    /// Vertices that contained at least one non-finite component
    pub invalid_vertices_fixed: usize,
    /// Normal accessors rebuilt from face geometry
    pub normals_regenerated: usize,
    /// Tangent accessors dropped from primitives
    pub tangents_removed: usize,
    /// Empty, unreferenced accessors disposed
    pub empty_accessors_removed: usize,
    /// Primitives visited
    pub total_primitives_processed: usize,
}

/// Repair phase run before the optimization steps.
pub fn repair_input(doc: &mut Document) -> Result<GeometryFixResult> {
    repair(doc, false)
}

/// Repair phase run after the optimization steps; also restores normals
/// that simplification or quantization may have invalidated.
pub fn repair_output(doc: &mut Document) -> Result<GeometryFixResult> {
    repair(doc, true)
}

fn repair(doc: &mut Document, generate_missing_normals: bool) -> Result<GeometryFixResult> {
    let mut stats = GeometryFixResult::default();

    // Pass 1: scrub non-finite components from the scannable attribute
    // classes. Each accessor is scrubbed once even when shared.
    let scrub_targets = collect_scrub_targets(doc);
    stats.invalid_vertices_fixed = doc
        .accessors_slots_mut()
        .par_iter_mut()
        .enumerate()
        .filter(|(i, _)| scrub_targets.contains(&AccessorId(*i)))
        .map(|(_, slot)| slot.as_mut().map(scrub_accessor).unwrap_or(0))
        .sum();

    // Pass 2: validate normals per primitive; rebuild broken ones from
    // area-weighted face normals.
    let mut regenerated: HashSet<AccessorId> = HashSet::new();
    let mut rebuilt: Vec<(AccessorId, Vec<f32>)> = Vec::new();
    for (_, mesh) in doc.iter_meshes() {
        for prim in &mesh.primitives {
            stats.total_primitives_processed += 1;
            let normal_id = match prim.attributes.get(&Semantic::Normal) {
                Some(id) => *id,
                None => continue,
            };
            if regenerated.contains(&normal_id) {
                continue;
            }
            let Some(normal) = doc.accessor(normal_id) else {
                continue;
            };
            if normal.element != ElementType::Vec3 || normal.data.as_f32().is_none() {
                continue;
            }
            if normals_valid(normal) {
                continue;
            }
            if let Some(normals) = primitive_face_normals(doc, prim) {
                regenerated.insert(normal_id);
                rebuilt.push((normal_id, normals));
            }
        }
    }
    for (id, normals) in rebuilt {
        if let Some(acc) = doc.accessor_mut(id) {
            acc.data = AttributeData::F32(normals);
            acc.min = None;
            acc.max = None;
            stats.normals_regenerated += 1;
        }
    }

    // Pass 3: drop invalid tangents.
    let mut tangent_drops: Vec<(MeshId, usize)> = Vec::new();
    for (mesh_id, mesh) in doc.iter_meshes() {
        for (prim_index, prim) in mesh.primitives.iter().enumerate() {
            let Some(&tangent_id) = prim.attributes.get(&Semantic::Tangent) else {
                continue;
            };
            let valid = doc
                .accessor(tangent_id)
                .map(tangent_valid)
                .unwrap_or(false);
            if !valid {
                tangent_drops.push((mesh_id, prim_index));
            }
        }
    }
    for (mesh_id, prim_index) in tangent_drops {
        if let Some(mesh) = doc.mesh_mut(mesh_id) {
            mesh.primitives[prim_index]
                .attributes
                .remove(&Semantic::Tangent);
            stats.tangents_removed += 1;
        }
    }

    // Pass 4 (output phase only): primitives that still render positions but
    // lost their normals get freshly generated ones.
    if generate_missing_normals {
        let mut additions: Vec<(MeshId, usize, Vec<f32>)> = Vec::new();
        for (mesh_id, mesh) in doc.iter_meshes() {
            for (prim_index, prim) in mesh.primitives.iter().enumerate() {
                if prim.mode != PrimitiveMode::Triangles
                    || prim.position().is_none()
                    || prim.attributes.contains_key(&Semantic::Normal)
                {
                    continue;
                }
                if let Some(normals) = primitive_face_normals(doc, prim) {
                    additions.push((mesh_id, prim_index, normals));
                }
            }
        }
        for (mesh_id, prim_index, normals) in additions {
            let accessor = Accessor::new(ElementType::Vec3, AttributeData::F32(normals));
            let id = doc.add_accessor(accessor);
            if let Some(mesh) = doc.mesh_mut(mesh_id) {
                mesh.primitives[prim_index]
                    .attributes
                    .insert(Semantic::Normal, id);
                stats.normals_regenerated += 1;
            }
        }
    }

    // Pass 5: dispose empty accessors nothing references.
    let refs = RefIndex::build(doc);
    let empties: Vec<AccessorId> = doc
        .iter_accessors()
        .filter(|(id, acc)| acc.data.is_empty() && refs.accessor_refs(*id) == 0)
        .map(|(id, _)| id)
        .collect();
    for id in &empties {
        doc.dispose_accessor(*id);
    }
    stats.empty_accessors_removed = empties.len();

    debug!(
        "sanitizer: {} vertices fixed, {} normals regenerated, {} tangents removed",
        stats.invalid_vertices_fixed, stats.normals_regenerated, stats.tangents_removed
    );
    Ok(stats)
}

/// Accessors holding the attribute classes the sanitizer scans.
fn collect_scrub_targets(doc: &Document) -> HashSet<AccessorId> {
    let mut targets = HashSet::new();
    for (_, mesh) in doc.iter_meshes() {
        for prim in &mesh.primitives {
            for sem in [
                Semantic::Position,
                Semantic::Normal,
                Semantic::TexCoord(0),
                Semantic::TexCoord(1),
            ] {
                if let Some(id) = prim.attributes.get(&sem) {
                    targets.insert(*id);
                }
            }
        }
    }
    targets
}

/// Replace non-finite components with 0; returns the number of affected
/// elements (vertices).
fn scrub_accessor(acc: &mut Accessor) -> usize {
    let components = acc.element.components();
    let Some(values) = acc.data.as_f32_mut() else {
        return 0;
    };
    let mut fixed = 0;
    for element in values.chunks_mut(components) {
        let mut dirty = false;
        for v in element.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
                dirty = true;
            }
        }
        if dirty {
            fixed += 1;
        }
    }
    if fixed > 0 {
        acc.min = None;
        acc.max = None;
    }
    fixed
}

/// Sample every ⌈count/10⌉-th vector and check finiteness and length.
fn normals_valid(acc: &Accessor) -> bool {
    let Some(values) = acc.data.as_f32() else {
        return true;
    };
    let count = acc.count();
    if count == 0 {
        return true;
    }
    let step = count.div_ceil(10).max(1);
    let mut i = 0;
    while i < count {
        let n = Vec3::new(values[i * 3], values[i * 3 + 1], values[i * 3 + 2]);
        if !n.is_finite() {
            return false;
        }
        let len = n.length();
        if !(NORMAL_LENGTH_MIN..=NORMAL_LENGTH_MAX).contains(&len) {
            return false;
        }
        i += step;
    }
    true
}

fn tangent_valid(acc: &Accessor) -> bool {
    if acc.element != ElementType::Vec4 {
        return false;
    }
    let Some(values) = acc.data.as_f32() else {
        // Quantized tangents were produced by the quantizer and are sound.
        return true;
    };
    let count = acc.count();
    if count == 0 {
        return false;
    }
    let step = count.div_ceil(10).max(1);
    let mut i = 0;
    while i < count {
        let t = &values[i * 4..i * 4 + 4];
        if t.iter().any(|v| !v.is_finite()) {
            return false;
        }
        if (t[3].abs() - 1.0).abs() > TANGENT_W_TOLERANCE {
            return false;
        }
        i += step;
    }
    true
}

/// Per-vertex normals from area-weighted face normals over the primitive's
/// triangles (indexed or sequential). Zero-length accumulations fall back to
/// +Y.
fn primitive_face_normals(doc: &Document, prim: &crate::document::Primitive) -> Option<Vec<f32>> {
    if prim.mode != PrimitiveMode::Triangles {
        return None;
    }
    let positions = doc.accessor(prim.position()?)?;
    let values = positions.data.as_f32()?;
    let vertex_count = positions.count();

    let indices: Vec<u32> = match prim.indices {
        Some(id) => doc.accessor(id)?.data.to_u32_vec(),
        None => (0..vertex_count as u32).collect(),
    };

    let vertex = |i: u32| -> Vec3 {
        let base = i as usize * 3;
        Vec3::new(values[base], values[base + 1], values[base + 2])
    };

    let mut accumulated = vec![Vec3::ZERO; vertex_count];
    for tri in indices.chunks_exact(3) {
        let (a, b, c) = (tri[0], tri[1], tri[2]);
        if a as usize >= vertex_count || b as usize >= vertex_count || c as usize >= vertex_count {
            continue;
        }
        let (va, vb, vc) = (vertex(a), vertex(b), vertex(c));
        // Unnormalized cross product weights by twice the face area.
        let face = (vb - va).cross(vc - va);
        if face.is_finite() {
            accumulated[a as usize] += face;
            accumulated[b as usize] += face;
            accumulated[c as usize] += face;
        }
    }

    let mut normals = Vec::with_capacity(vertex_count * 3);
    for n in accumulated {
        let n = if n.length_squared() > 1e-12 && n.is_finite() {
            n.normalize()
        } else {
            Vec3::Y
        };
        normals.extend_from_slice(&n.to_array());
    }
    Some(normals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Mesh, Primitive};

    /// Helper: indexed quad (two triangles) with optional normals.
    fn make_quad_doc(normals: Option<Vec<f32>>) -> (Document, MeshId) {
        let mut doc = Document::new();
        let positions = doc.add_accessor(Accessor::new(
            ElementType::Vec3,
            AttributeData::F32(vec![
                0.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                1.0, 1.0, 0.0, //
                0.0, 1.0, 0.0,
            ]),
        ));
        let indices = doc.add_accessor(Accessor::new(
            ElementType::Scalar,
            AttributeData::U32(vec![0, 1, 2, 0, 2, 3]),
        ));
        let mut prim = Primitive::new(PrimitiveMode::Triangles);
        prim.attributes.insert(Semantic::Position, positions);
        prim.indices = Some(indices);
        if let Some(values) = normals {
            let id = doc.add_accessor(Accessor::new(ElementType::Vec3, AttributeData::F32(values)));
            prim.attributes.insert(Semantic::Normal, id);
        }
        let mesh = doc.add_mesh(Mesh {
            name: None,
            primitives: vec![prim],
        });
        (doc, mesh)
    }

    // ==================== Non-finite scrubbing ====================

    #[test]
    fn test_scrubs_nan_positions() {
        let (mut doc, mesh) = make_quad_doc(None);
        let pos_id = doc.mesh(mesh).unwrap().primitives[0].position().unwrap();
        doc.accessor_mut(pos_id).unwrap().data.as_f32_mut().unwrap()[0] = f32::NAN;
        doc.accessor_mut(pos_id).unwrap().data.as_f32_mut().unwrap()[4] = f32::INFINITY;

        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.invalid_vertices_fixed, 2);
        let values = doc.accessor(pos_id).unwrap().data.as_f32().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
        assert_eq!(values[0], 0.0);
        assert_eq!(values[4], 0.0);
    }

    #[test]
    fn test_clean_input_reports_zero_fixes() {
        let (mut doc, _) = make_quad_doc(None);
        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.invalid_vertices_fixed, 0);
        assert_eq!(stats.total_primitives_processed, 1);
    }

    // ==================== Normal validation ====================

    #[test]
    fn test_regenerates_denormalized_normals() {
        // All normals far too long: the sampled check must trip.
        let bad = vec![
            0.0, 0.0, 9.0, //
            0.0, 0.0, 9.0, //
            0.0, 0.0, 9.0, //
            0.0, 0.0, 9.0,
        ];
        let (mut doc, mesh) = make_quad_doc(Some(bad));
        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.normals_regenerated, 1);

        let normal_id = doc.mesh(mesh).unwrap().primitives[0]
            .attributes
            .get(&Semantic::Normal)
            .copied()
            .unwrap();
        let values = doc.accessor(normal_id).unwrap().data.as_f32().unwrap();
        // Flat quad in the XY plane: normals must be ±Z and unit length.
        for n in values.chunks_exact(3) {
            let v = Vec3::new(n[0], n[1], n[2]);
            assert!((v.length() - 1.0).abs() < 1e-5);
            assert!(v.z.abs() > 0.99);
        }
    }

    #[test]
    fn test_valid_normals_left_untouched() {
        let good = vec![
            0.0, 0.0, 1.0, //
            0.0, 0.0, 1.0, //
            0.0, 0.0, 1.0, //
            0.0, 0.0, 1.0,
        ];
        let (mut doc, _) = make_quad_doc(Some(good.clone()));
        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.normals_regenerated, 0);
    }

    // ==================== Tangent validation ====================

    #[test]
    fn test_drops_tangent_with_bad_w() {
        let (mut doc, mesh) = make_quad_doc(None);
        let tangent = doc.add_accessor(Accessor::new(
            ElementType::Vec4,
            AttributeData::F32(vec![
                1.0, 0.0, 0.0, 0.5, //
                1.0, 0.0, 0.0, 0.5, //
                1.0, 0.0, 0.0, 0.5, //
                1.0, 0.0, 0.0, 0.5,
            ]),
        ));
        doc.mesh_mut(mesh).unwrap().primitives[0]
            .attributes
            .insert(Semantic::Tangent, tangent);

        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.tangents_removed, 1);
        assert!(!doc.mesh(mesh).unwrap().primitives[0]
            .attributes
            .contains_key(&Semantic::Tangent));
    }

    #[test]
    fn test_keeps_well_formed_tangent() {
        let (mut doc, mesh) = make_quad_doc(None);
        let tangent = doc.add_accessor(Accessor::new(
            ElementType::Vec4,
            AttributeData::F32(vec![
                1.0, 0.0, 0.0, 1.0, //
                1.0, 0.0, 0.0, 1.0, //
                1.0, 0.0, 0.0, -1.0, //
                1.0, 0.0, 0.0, -1.0,
            ]),
        ));
        doc.mesh_mut(mesh).unwrap().primitives[0]
            .attributes
            .insert(Semantic::Tangent, tangent);

        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.tangents_removed, 0);
    }

    #[test]
    fn test_drops_non_vec4_tangent() {
        let (mut doc, mesh) = make_quad_doc(None);
        let tangent = doc.add_accessor(Accessor::new(
            ElementType::Vec3,
            AttributeData::F32(vec![[1.0f32, 0.0, 0.0]; 4].concat()),
        ));
        doc.mesh_mut(mesh).unwrap().primitives[0]
            .attributes
            .insert(Semantic::Tangent, tangent);
        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.tangents_removed, 1);
    }

    // ==================== Empty accessor disposal ====================

    #[test]
    fn test_disposes_empty_unreferenced_accessor() {
        let (mut doc, _) = make_quad_doc(None);
        doc.add_accessor(Accessor::new(ElementType::Scalar, AttributeData::F32(vec![])));
        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.empty_accessors_removed, 1);
    }

    #[test]
    fn test_keeps_empty_but_referenced_accessor() {
        let (mut doc, mesh) = make_quad_doc(None);
        let empty = doc.add_accessor(Accessor::new(ElementType::Vec2, AttributeData::F32(vec![])));
        doc.mesh_mut(mesh).unwrap().primitives[0]
            .attributes
            .insert(Semantic::TexCoord(0), empty);
        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.empty_accessors_removed, 0);
        assert!(doc.accessor(empty).is_some());
    }

    // ==================== Output phase ====================

    #[test]
    fn test_output_phase_generates_missing_normals() {
        let (mut doc, mesh) = make_quad_doc(None);
        let stats = repair_output(&mut doc).unwrap();
        assert_eq!(stats.normals_regenerated, 1);
        let prim = &doc.mesh(mesh).unwrap().primitives[0];
        let normal_id = prim.attributes.get(&Semantic::Normal).copied().unwrap();
        assert_eq!(doc.accessor(normal_id).unwrap().count(), 4);
    }

    #[test]
    fn test_input_phase_does_not_add_normals() {
        let (mut doc, mesh) = make_quad_doc(None);
        let stats = repair_input(&mut doc).unwrap();
        assert_eq!(stats.normals_regenerated, 0);
        assert!(!doc.mesh(mesh).unwrap().primitives[0]
            .attributes
            .contains_key(&Semantic::Normal));
    }
}
