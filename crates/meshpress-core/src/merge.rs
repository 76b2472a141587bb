//! Primitive merging by shared material
//!
//! Primitives inside a mesh that draw with the same material, triangle
//! topology and an identical attribute layout are concatenated into a single
//! draw unit. Primitives without a material, with morph targets, or with
//! non-triangle topology are left alone; the set of materials used by the
//! document is never changed by this step.
//!
//! Merging stays within one mesh so every merged vertex keeps the node
//! transform it had before.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::document::{
    Accessor, AccessorId, AttributeData, ComponentType, Document, ElementType, MaterialId,
    Primitive, PrimitiveMode, Semantic,
};
use crate::{OptimizeError, Result};

/// Configuration for the merge step
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeOptions {
    pub enabled: bool,
}

/// Statistics from a merge operation; counts are draw units (primitives)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    pub original_mesh_count: usize,
    pub merged_mesh_count: usize,
    pub meshes_reduced: usize,
}

/// Attribute layout fingerprint: primitives merge only when these match.
type LayoutKey = (MaterialId, Vec<(Semantic, ComponentType, ElementType, bool)>);

/// Merge compatible primitives document-wide.
pub fn merge(doc: &mut Document, _options: &MergeOptions) -> Result<MergeStats> {
    let original_count = primitive_count(doc);

    for mesh_id in doc.mesh_ids() {
        merge_mesh(doc, mesh_id)?;
    }
    doc.dispose_orphan_accessors();

    let merged_count = primitive_count(doc);
    let stats = MergeStats {
        original_mesh_count: original_count,
        merged_mesh_count: merged_count,
        meshes_reduced: original_count - merged_count,
    };
    debug!(
        "merge: {} -> {} draw units",
        stats.original_mesh_count, stats.merged_mesh_count
    );
    Ok(stats)
}

fn primitive_count(doc: &Document) -> usize {
    doc.iter_meshes().map(|(_, m)| m.primitives.len()).sum()
}

fn layout_key(doc: &Document, prim: &Primitive) -> Option<LayoutKey> {
    if prim.mode != PrimitiveMode::Triangles
        || !prim.targets.is_empty()
        || prim.draco.is_some()
    {
        return None;
    }
    let material = prim.material?;
    let mut layout = Vec::with_capacity(prim.attributes.len());
    for (sem, id) in &prim.attributes {
        let acc = doc.accessor(*id)?;
        layout.push((sem.clone(), acc.component(), acc.element, acc.normalized));
    }
    Some((material, layout))
}

fn merge_mesh(doc: &mut Document, mesh_id: crate::document::MeshId) -> Result<()> {
    let primitives = match doc.mesh(mesh_id) {
        Some(mesh) => mesh.primitives.clone(),
        None => return Ok(()),
    };
    if primitives.len() < 2 {
        return Ok(());
    }

    // Group indices of mergeable primitives by layout.
    let mut groups: HashMap<LayoutKey, Vec<usize>> = HashMap::new();
    for (i, prim) in primitives.iter().enumerate() {
        if let Some(key) = layout_key(doc, prim) {
            groups.entry(key).or_default().push(i);
        }
    }

    let mut replaced: HashMap<usize, Primitive> = HashMap::new();
    let mut dropped: Vec<usize> = Vec::new();

    for (_, members) in groups.into_iter().filter(|(_, m)| m.len() > 1) {
        let merged = concatenate(doc, &primitives, &members)?;
        replaced.insert(members[0], merged);
        dropped.extend(members[1..].iter().copied());
    }

    if replaced.is_empty() {
        return Ok(());
    }

    let mut rebuilt = Vec::with_capacity(primitives.len());
    for (i, prim) in primitives.into_iter().enumerate() {
        if let Some(merged) = replaced.remove(&i) {
            rebuilt.push(merged);
        } else if !dropped.contains(&i) {
            rebuilt.push(prim);
        }
    }
    if let Some(mesh) = doc.mesh_mut(mesh_id) {
        mesh.primitives = rebuilt;
    }
    Ok(())
}

/// Build one primitive out of the member primitives' concatenated vertex
/// streams, with indices rebased onto the combined vertex range.
fn concatenate(
    doc: &mut Document,
    primitives: &[Primitive],
    members: &[usize],
) -> Result<Primitive> {
    let template = &primitives[members[0]];
    let mut merged = Primitive::new(PrimitiveMode::Triangles);
    merged.material = template.material;

    // Concatenate each attribute stream in template order.
    let mut merged_attributes: Vec<(Semantic, AccessorId)> = Vec::new();
    for sem in template.attributes.keys() {
        let mut data: Option<AttributeData> = None;
        let mut element = ElementType::Scalar;
        let mut normalized = false;
        let mut name = None;
        for &member in members {
            let id = primitives[member].attributes[sem];
            let acc = doc.accessor(id).ok_or_else(|| OptimizeError::Internal(
                format!("merge: accessor for {} disappeared", sem.label()),
            ))?;
            element = acc.element;
            normalized = acc.normalized;
            if name.is_none() {
                name = acc.name.clone();
            }
            match &mut data {
                None => data = Some(acc.data.clone()),
                Some(existing) => append_attribute(existing, &acc.data)?,
            }
        }
        let mut accessor = Accessor::new(element, data.unwrap_or(AttributeData::F32(vec![])));
        accessor.normalized = normalized;
        accessor.name = name;
        let id = doc.add_accessor(accessor);
        merged_attributes.push((sem.clone(), id));
    }
    for (sem, id) in merged_attributes {
        merged.attributes.insert(sem, id);
    }

    // Rebase indices over the concatenated vertex streams.
    let mut indices: Vec<u32> = Vec::new();
    let mut vertex_base: u32 = 0;
    for &member in members {
        let prim = &primitives[member];
        let vertex_count = prim
            .position()
            .and_then(|id| doc.accessor(id))
            .map(|a| a.count() as u32)
            .unwrap_or(0);
        match prim.indices {
            Some(id) => {
                let acc = doc.accessor(id).ok_or_else(|| {
                    OptimizeError::Internal("merge: index accessor disappeared".into())
                })?;
                indices.extend(acc.data.to_u32_vec().into_iter().map(|i| i + vertex_base));
            }
            None => indices.extend((0..vertex_count).map(|i| i + vertex_base)),
        }
        vertex_base += vertex_count;
    }
    merged.indices = Some(doc.add_accessor(Accessor::new(
        ElementType::Scalar,
        AttributeData::U32(indices),
    )));

    Ok(merged)
}

fn append_attribute(dst: &mut AttributeData, src: &AttributeData) -> Result<()> {
    match (dst, src) {
        (AttributeData::I8(d), AttributeData::I8(s)) => d.extend_from_slice(s),
        (AttributeData::U8(d), AttributeData::U8(s)) => d.extend_from_slice(s),
        (AttributeData::I16(d), AttributeData::I16(s)) => d.extend_from_slice(s),
        (AttributeData::U16(d), AttributeData::U16(s)) => d.extend_from_slice(s),
        (AttributeData::U32(d), AttributeData::U32(s)) => d.extend_from_slice(s),
        (AttributeData::F32(d), AttributeData::F32(s)) => d.extend_from_slice(s),
        _ => {
            return Err(OptimizeError::Internal(
                "merge: mismatched attribute storage in one layout group".into(),
            ))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Material, Mesh, RefIndex};

    fn triangle_positions(offset: f32) -> Vec<f32> {
        vec![
            offset, 0.0, 0.0, //
            offset + 1.0, 0.0, 0.0, //
            offset + 0.5, 1.0, 0.0,
        ]
    }

    fn add_triangle_primitive(
        doc: &mut Document,
        offset: f32,
        material: Option<MaterialId>,
    ) -> Primitive {
        let positions = doc.add_accessor(Accessor::new(
            ElementType::Vec3,
            AttributeData::F32(triangle_positions(offset)),
        ));
        let indices = doc.add_accessor(Accessor::new(
            ElementType::Scalar,
            AttributeData::U32(vec![0, 1, 2]),
        ));
        let mut prim = Primitive::new(PrimitiveMode::Triangles);
        prim.attributes.insert(Semantic::Position, positions);
        prim.indices = Some(indices);
        prim.material = material;
        prim
    }

    fn material_set(doc: &Document) -> std::collections::BTreeSet<MaterialId> {
        doc.iter_meshes()
            .flat_map(|(_, m)| m.primitives.iter())
            .filter_map(|p| p.material)
            .collect()
    }

    // ==================== Merging ====================

    #[test]
    fn test_merges_three_primitives_sharing_material() {
        let mut doc = Document::new();
        let material = doc.add_material(Material::default());
        let prims = vec![
            add_triangle_primitive(&mut doc, 0.0, Some(material)),
            add_triangle_primitive(&mut doc, 2.0, Some(material)),
            add_triangle_primitive(&mut doc, 4.0, Some(material)),
        ];
        let mesh = doc.add_mesh(Mesh {
            name: None,
            primitives: prims,
        });
        let before_materials = material_set(&doc);

        let stats = merge(&mut doc, &MergeOptions::default()).unwrap();
        assert_eq!(stats.original_mesh_count, 3);
        assert_eq!(stats.merged_mesh_count, 1);
        assert_eq!(stats.meshes_reduced, 2);
        assert_eq!(material_set(&doc), before_materials);

        let prim = &doc.mesh(mesh).unwrap().primitives[0];
        let positions = doc.accessor(prim.position().unwrap()).unwrap();
        assert_eq!(positions.count(), 9);
        let indices = doc.accessor(prim.indices.unwrap()).unwrap();
        assert_eq!(indices.data.to_u32_vec(), vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_different_materials_not_merged() {
        let mut doc = Document::new();
        let a = doc.add_material(Material::default());
        let b = doc.add_material(Material::default());
        let prims = vec![
            add_triangle_primitive(&mut doc, 0.0, Some(a)),
            add_triangle_primitive(&mut doc, 2.0, Some(b)),
        ];
        doc.add_mesh(Mesh {
            name: None,
            primitives: prims,
        });

        let stats = merge(&mut doc, &MergeOptions::default()).unwrap();
        assert_eq!(stats.meshes_reduced, 0);
    }

    #[test]
    fn test_primitives_without_material_left_alone() {
        let mut doc = Document::new();
        let prims = vec![
            add_triangle_primitive(&mut doc, 0.0, None),
            add_triangle_primitive(&mut doc, 2.0, None),
        ];
        doc.add_mesh(Mesh {
            name: None,
            primitives: prims,
        });

        let stats = merge(&mut doc, &MergeOptions::default()).unwrap();
        assert_eq!(stats.meshes_reduced, 0);
        assert_eq!(stats.merged_mesh_count, 2);
    }

    #[test]
    fn test_incompatible_layouts_not_merged() {
        let mut doc = Document::new();
        let material = doc.add_material(Material::default());
        let mut with_normals = add_triangle_primitive(&mut doc, 0.0, Some(material));
        let normals = doc.add_accessor(Accessor::new(
            ElementType::Vec3,
            AttributeData::F32(vec![[0.0f32, 0.0, 1.0]; 3].concat()),
        ));
        with_normals.attributes.insert(Semantic::Normal, normals);
        let plain = add_triangle_primitive(&mut doc, 2.0, Some(material));
        doc.add_mesh(Mesh {
            name: None,
            primitives: vec![with_normals, plain],
        });

        let stats = merge(&mut doc, &MergeOptions::default()).unwrap();
        assert_eq!(stats.meshes_reduced, 0);
    }

    #[test]
    fn test_merge_disposes_orphaned_accessors() {
        let mut doc = Document::new();
        let material = doc.add_material(Material::default());
        let prims = vec![
            add_triangle_primitive(&mut doc, 0.0, Some(material)),
            add_triangle_primitive(&mut doc, 2.0, Some(material)),
        ];
        doc.add_mesh(Mesh {
            name: None,
            primitives: prims,
        });

        merge(&mut doc, &MergeOptions::default()).unwrap();
        let refs = RefIndex::build(&doc);
        for (id, _) in doc.iter_accessors() {
            assert!(refs.accessor_refs(id) > 0, "orphan accessor survived merge");
        }
    }

    #[test]
    fn test_non_indexed_primitives_get_sequential_indices() {
        let mut doc = Document::new();
        let material = doc.add_material(Material::default());
        let mut a = add_triangle_primitive(&mut doc, 0.0, Some(material));
        let mut b = add_triangle_primitive(&mut doc, 2.0, Some(material));
        // Strip the index accessors to exercise the sequential path.
        a.indices = None;
        b.indices = None;
        doc.add_mesh(Mesh {
            name: None,
            primitives: vec![a, b],
        });

        let stats = merge(&mut doc, &MergeOptions::default()).unwrap();
        assert_eq!(stats.meshes_reduced, 1);
        let (_, mesh) = doc.iter_meshes().next().unwrap();
        let indices = doc.accessor(mesh.primitives[0].indices.unwrap()).unwrap();
        assert_eq!(indices.data.to_u32_vec(), vec![0, 1, 2, 3, 4, 5]);
    }
}
