//! Unreferenced-resource pruning
//!
//! Computes the set of entities reachable from the default scene (every
//! scene when none is marked default) and disposes what nothing reaches:
//! meshes and accessors unconditionally, materials and textures per their
//! option flags, and scene-graph nodes only when `remove_unused_nodes` is
//! set. Skin joints and animation targets are never removed, whatever the
//! scene graph looks like.

use std::collections::HashSet;

use log::debug;
use serde::Deserialize;
use serde::Serialize;

use crate::document::{Document, MaterialId, MeshId, NodeId, RefIndex, TextureId};
use crate::Result;

fn default_true() -> bool {
    true
}

/// Configuration for the prune step
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanOptions {
    pub enabled: bool,
    /// Drop scene-graph nodes that carry nothing and lead nowhere
    #[serde(default = "default_true")]
    pub remove_unused_nodes: bool,
    #[serde(default = "default_true")]
    pub remove_unused_materials: bool,
    #[serde(default = "default_true")]
    pub remove_unused_textures: bool,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            remove_unused_nodes: true,
            remove_unused_materials: true,
            remove_unused_textures: true,
        }
    }
}

/// Statistics from a prune operation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanStats {
    pub nodes_removed: usize,
    pub materials_removed: usize,
    pub textures_removed: usize,
}

/// Remove unreferenced entities from the document.
pub fn clean(doc: &mut Document, options: &CleanOptions) -> Result<CleanStats> {
    let nodes_before = doc.node_count();
    let materials_before = doc.material_count();
    let textures_before = doc.texture_count();

    // Nodes that must survive regardless of scene reachability.
    let mut protected: HashSet<NodeId> = HashSet::new();
    for skin in &doc.skins {
        protected.extend(skin.joints.iter().copied());
        if let Some(skeleton) = skin.skeleton {
            protected.insert(skeleton);
        }
    }
    for anim in &doc.animations {
        protected.extend(anim.channels.iter().map(|c| c.node));
    }

    if options.remove_unused_nodes {
        let reachable = reachable_nodes(doc);

        // Unreachable, unprotected nodes go first.
        let strays: Vec<NodeId> = doc
            .node_ids()
            .into_iter()
            .filter(|id| !reachable.contains(id) && !protected.contains(id))
            .collect();
        for id in strays {
            doc.dispose_node(id);
        }

        // Then empty leaves inside the reachable graph, bottom-up.
        let roots = doc.root_nodes();
        for root in &roots {
            prune_empty_leaves(doc, *root, &protected);
        }
        let live: HashSet<NodeId> = doc.node_ids().into_iter().collect();
        for scene in doc.scenes.iter_mut() {
            scene.nodes.retain(|id| live.contains(id));
        }
    }

    // Meshes nothing references anymore.
    let refs = RefIndex::build(doc);
    let dead_meshes: Vec<MeshId> = doc
        .iter_meshes()
        .filter(|(id, _)| refs.mesh_refs(*id) == 0)
        .map(|(id, _)| id)
        .collect();
    for id in dead_meshes {
        doc.dispose_mesh(id);
    }

    // Materials, then textures: texture references can only come from live
    // materials, so the order matters.
    if options.remove_unused_materials {
        let refs = RefIndex::build(doc);
        let dead: Vec<MaterialId> = doc
            .iter_materials()
            .filter(|(id, _)| refs.material_refs(*id) == 0)
            .map(|(id, _)| id)
            .collect();
        for id in dead {
            doc.dispose_material(id);
        }
    }
    if options.remove_unused_textures {
        let refs = RefIndex::build(doc);
        let dead: Vec<TextureId> = doc
            .iter_textures()
            .filter(|(id, _)| refs.texture_refs(*id) == 0)
            .map(|(id, _)| id)
            .collect();
        for id in dead {
            doc.dispose_texture(id);
        }
    }

    doc.dispose_orphan_accessors();

    let stats = CleanStats {
        nodes_removed: nodes_before - doc.node_count(),
        materials_removed: materials_before - doc.material_count(),
        textures_removed: textures_before - doc.texture_count(),
    };
    debug!(
        "clean: removed {} nodes, {} materials, {} textures",
        stats.nodes_removed, stats.materials_removed, stats.textures_removed
    );
    Ok(stats)
}

fn reachable_nodes(doc: &Document) -> HashSet<NodeId> {
    let mut reachable = HashSet::new();
    let mut stack = doc.root_nodes();
    while let Some(id) = stack.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(node) = doc.node(id) {
            stack.extend(node.children.iter().copied());
        }
    }
    reachable
}

/// Returns true when the node survives. A node survives when it carries a
/// payload, is protected, or keeps at least one surviving child.
fn prune_empty_leaves(doc: &mut Document, id: NodeId, protected: &HashSet<NodeId>) -> bool {
    let Some(node) = doc.node(id) else {
        return false;
    };
    let children = node.children.clone();
    let has_payload = node.mesh.is_some() || node.camera.is_some() || node.skin.is_some();

    let mut kept_children = Vec::with_capacity(children.len());
    for child in children {
        if prune_empty_leaves(doc, child, protected) {
            kept_children.push(child);
        }
    }

    let survives = has_payload || protected.contains(&id) || !kept_children.is_empty();
    if let Some(node) = doc.node_mut(id) {
        node.children = kept_children;
    }
    if !survives {
        doc.dispose_node(id);
    }
    survives
}
