//! Mesh simplification
//!
//! Quadric-error-metric edge collapse applied per triangle primitive,
//! preceded by a positional weld so collapses can cross vertices that were
//! split for per-vertex attributes. The collapse loop runs until the target
//! triangle count is reached, the candidate queue drains, or the cheapest
//! remaining collapse exceeds the error tolerance.
//!
//! Candidates carry version stamps of their endpoints; stale entries are
//! discarded on pop instead of rebuilding the queue after every collapse.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use glam::{DMat3, DVec3, Vec3};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::document::{
    Accessor, AttributeData, Document, ElementType, MeshId, PrimitiveMode, Semantic,
};
use crate::{OptimizeError, Result};

/// Weld epsilon as a fraction of the primitive's bounding-box diagonal.
const WELD_EPSILON_SCALE: f32 = 1e-4;

fn default_error() -> f32 {
    0.01
}

/// Configuration for the simplify step
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimplifyOptions {
    pub enabled: bool,
    /// Fraction of triangles to keep, in (0, 1]
    pub target_ratio: Option<f32>,
    /// Absolute triangle target; mutually exclusive with `target_ratio`
    pub target_count: Option<u32>,
    /// Quadric error tolerance in [0, 1], relative to the bounding box
    #[serde(default = "default_error")]
    pub error: f32,
    /// Refuse collapses that touch an open boundary
    pub lock_border: bool,
}

impl Default for SimplifyOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            target_ratio: None,
            target_count: None,
            error: default_error(),
            lock_border: false,
        }
    }
}

/// Statistics from a simplify operation
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimplifyStats {
    pub original_triangles: usize,
    pub simplified_triangles: usize,
    pub reduction_ratio: f64,
    pub meshes_processed: usize,
}

/// Validate options and derive the effective keep-ratio.
fn effective_ratio(doc: &Document, options: &SimplifyOptions) -> Result<f32> {
    if options.target_ratio.is_some() && options.target_count.is_some() {
        return Err(OptimizeError::InvalidOptions {
            field: "targetCount",
            expected: "mutually exclusive with targetRatio",
            received: "both set".into(),
        });
    }
    if !(0.0..=1.0).contains(&options.error) {
        return Err(OptimizeError::InvalidOptions {
            field: "error",
            expected: "[0, 1]",
            received: options.error.to_string(),
        });
    }
    match (options.target_ratio, options.target_count) {
        (Some(ratio), None) => {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(OptimizeError::InvalidOptions {
                    field: "targetRatio",
                    expected: "(0, 1]",
                    received: ratio.to_string(),
                });
            }
            Ok(ratio)
        }
        (None, Some(count)) => {
            if count == 0 {
                return Err(OptimizeError::InvalidOptions {
                    field: "targetCount",
                    expected: "positive integer",
                    received: count.to_string(),
                });
            }
            let total = doc.triangle_count();
            if total == 0 {
                Ok(1.0)
            } else {
                Ok((count as f32 / total as f32).min(1.0))
            }
        }
        (None, None) => Err(OptimizeError::InvalidOptions {
            field: "targetRatio",
            expected: "one of targetRatio or targetCount",
            received: "neither set".into(),
        }),
        (Some(_), Some(_)) => unreachable!(),
    }
}

/// Simplify every triangle primitive in the document to the target ratio.
pub fn simplify(doc: &mut Document, options: &SimplifyOptions) -> Result<SimplifyStats> {
    let ratio = effective_ratio(doc, options)?;
    let mut stats = SimplifyStats::default();

    for mesh_id in doc.mesh_ids() {
        simplify_mesh(doc, mesh_id, ratio, options, &mut stats)?;
    }
    doc.dispose_orphan_accessors();

    stats.reduction_ratio = if stats.original_triangles == 0 {
        1.0
    } else {
        stats.simplified_triangles as f64 / stats.original_triangles as f64
    };
    debug!(
        "simplify: {} -> {} triangles over {} primitives",
        stats.original_triangles, stats.simplified_triangles, stats.meshes_processed
    );
    Ok(stats)
}

fn simplify_mesh(
    doc: &mut Document,
    mesh_id: MeshId,
    ratio: f32,
    options: &SimplifyOptions,
    stats: &mut SimplifyStats,
) -> Result<()> {
    let primitive_count = match doc.mesh(mesh_id) {
        Some(mesh) => mesh.primitives.len(),
        None => return Ok(()),
    };

    for prim_index in 0..primitive_count {
        let Some(input) = extract_geometry(doc, mesh_id, prim_index) else {
            continue;
        };

        let original_triangles = input.indices.len() / 3;
        let target = ((original_triangles as f32 * ratio).round() as usize).max(1);

        let welded = weld(&input.positions, &input.indices);
        let output = collapse(
            &input.positions,
            &welded,
            target,
            options.error,
            options.lock_border,
        );

        stats.original_triangles += original_triangles;
        stats.simplified_triangles += output.indices.len() / 3;
        stats.meshes_processed += 1;

        rebuild_primitive(doc, mesh_id, prim_index, &output)?;
    }
    Ok(())
}

struct InputGeometry {
    positions: Vec<Vec3>,
    indices: Vec<u32>,
}

fn extract_geometry(doc: &Document, mesh_id: MeshId, prim_index: usize) -> Option<InputGeometry> {
    let mesh = doc.mesh(mesh_id)?;
    let prim = mesh.primitives.get(prim_index)?;
    if prim.mode != PrimitiveMode::Triangles || !prim.targets.is_empty() {
        return None;
    }
    let positions = doc.accessor(prim.position()?)?;
    let values = positions.data.as_f32()?;
    if positions.element != ElementType::Vec3 {
        return None;
    }
    let points: Vec<Vec3> = values
        .chunks_exact(3)
        .map(|c| Vec3::new(c[0], c[1], c[2]))
        .collect();
    let indices = match prim.indices {
        Some(id) => doc.accessor(id)?.data.to_u32_vec(),
        None => (0..points.len() as u32).collect(),
    };
    if indices.len() < 3 {
        return None;
    }
    Some(InputGeometry {
        positions: points,
        indices,
    })
}

/// Merge positionally coincident vertices within a bbox-relative epsilon.
/// Returns the rewritten index list; vertex storage is untouched.
fn weld(positions: &[Vec3], indices: &[u32]) -> Vec<u32> {
    if positions.is_empty() {
        return indices.to_vec();
    }
    let (min, max) = positions.iter().fold(
        (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
        |(min, max), p| (min.min(*p), max.max(*p)),
    );
    let diagonal = (max - min).length();
    let epsilon = (diagonal * WELD_EPSILON_SCALE).max(f32::MIN_POSITIVE);

    let mut cells: HashMap<(i64, i64, i64), u32> = HashMap::new();
    let mut remap: Vec<u32> = Vec::with_capacity(positions.len());
    for (i, p) in positions.iter().enumerate() {
        let key = (
            (p.x / epsilon).round() as i64,
            (p.y / epsilon).round() as i64,
            (p.z / epsilon).round() as i64,
        );
        let representative = *cells.entry(key).or_insert(i as u32);
        remap.push(representative);
    }
    indices.iter().map(|&i| remap[i as usize]).collect()
}

// ---------------------------------------------------------------
// Quadric error metric
// ---------------------------------------------------------------

/// Symmetric 4x4 error quadric stored as its ten unique coefficients.
#[derive(Clone, Copy, Default)]
struct Quadric {
    xx: f64,
    xy: f64,
    xz: f64,
    xw: f64,
    yy: f64,
    yz: f64,
    yw: f64,
    zz: f64,
    zw: f64,
    ww: f64,
}

impl Quadric {
    fn from_plane(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self {
            xx: a * a,
            xy: a * b,
            xz: a * c,
            xw: a * d,
            yy: b * b,
            yz: b * c,
            yw: b * d,
            zz: c * c,
            zw: c * d,
            ww: d * d,
        }
    }

    fn add(&mut self, other: &Quadric) {
        self.xx += other.xx;
        self.xy += other.xy;
        self.xz += other.xz;
        self.xw += other.xw;
        self.yy += other.yy;
        self.yz += other.yz;
        self.yw += other.yw;
        self.zz += other.zz;
        self.zw += other.zw;
        self.ww += other.ww;
    }

    fn sum(&self, other: &Quadric) -> Quadric {
        let mut q = *self;
        q.add(other);
        q
    }

    fn error(&self, v: DVec3) -> f64 {
        let (x, y, z) = (v.x, v.y, v.z);
        (self.xx * x * x
            + 2.0 * self.xy * x * y
            + 2.0 * self.xz * x * z
            + 2.0 * self.xw * x
            + self.yy * y * y
            + 2.0 * self.yz * y * z
            + 2.0 * self.yw * y
            + self.zz * z * z
            + 2.0 * self.zw * z
            + self.ww)
            .max(0.0)
    }

    /// Position minimizing the quadric, or `None` when the system is
    /// near-singular (flat or degenerate neighborhoods).
    fn minimizer(&self) -> Option<DVec3> {
        let a = DMat3::from_cols(
            DVec3::new(self.xx, self.xy, self.xz),
            DVec3::new(self.xy, self.yy, self.yz),
            DVec3::new(self.xz, self.yz, self.zz),
        );
        if a.determinant().abs() < 1e-12 {
            return None;
        }
        Some(a.inverse() * -DVec3::new(self.xw, self.yw, self.zw))
    }
}

fn face_quadric(a: DVec3, b: DVec3, c: DVec3) -> Quadric {
    let normal = (b - a).cross(c - a);
    let len = normal.length();
    if len < 1e-20 || !normal.is_finite() {
        return Quadric::default();
    }
    let n = normal / len;
    let d = -n.dot(a);
    Quadric::from_plane(n.x, n.y, n.z, d)
}

/// Collapse candidate; min-heap ordering on cost.
struct Candidate {
    cost: f64,
    v1: u32,
    v2: u32,
    version1: u32,
    version2: u32,
    position: DVec3,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cost.total_cmp(&other.cost) == Ordering::Equal
    }
}
impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smallest cost first
        other.cost.total_cmp(&self.cost)
    }
}

struct CollapseOutput {
    /// Remap from original vertex index to compacted output slot
    kept: Vec<u32>,
    indices: Vec<u32>,
    /// Post-collapse coordinates per output slot; collapses relocate
    /// surviving vertices to their quadric minimizer
    positions: Vec<Vec3>,
}

struct CollapseState {
    positions: Vec<DVec3>,
    quadrics: Vec<Quadric>,
    faces: Vec<[u32; 3]>,
    face_alive: Vec<bool>,
    vertex_faces: Vec<Vec<usize>>,
    vertex_alive: Vec<bool>,
    versions: Vec<u32>,
    boundary: Vec<bool>,
    active_faces: usize,
}

impl CollapseState {
    fn neighbors(&self, v: u32) -> HashSet<u32> {
        let mut out = HashSet::new();
        for &f in &self.vertex_faces[v as usize] {
            if !self.face_alive[f] {
                continue;
            }
            for &other in &self.faces[f] {
                if other != v {
                    out.insert(other);
                }
            }
        }
        out
    }

    fn edge_exists(&self, v1: u32, v2: u32) -> bool {
        self.vertex_faces[v1 as usize].iter().any(|&f| {
            self.face_alive[f] && self.faces[f].contains(&v1) && self.faces[f].contains(&v2)
        })
    }

    fn collapse_cost(&self, v1: u32, v2: u32) -> (DVec3, f64) {
        let q = self.quadrics[v1 as usize].sum(&self.quadrics[v2 as usize]);
        let optimal = q.minimizer().filter(|p| p.is_finite()).unwrap_or_else(|| {
            (self.positions[v1 as usize] + self.positions[v2 as usize]) * 0.5
        });
        (optimal, q.error(optimal))
    }
}

/// Iterative edge collapse down to `target` live faces.
fn collapse(
    positions: &[Vec3],
    indices: &[u32],
    target: usize,
    error: f32,
    lock_border: bool,
) -> CollapseOutput {
    let nv = positions.len();
    let mut faces: Vec<[u32; 3]> = Vec::with_capacity(indices.len() / 3);
    for tri in indices.chunks_exact(3) {
        if tri[0] != tri[1] && tri[1] != tri[2] && tri[2] != tri[0] {
            faces.push([tri[0], tri[1], tri[2]]);
        }
    }

    let mut state = CollapseState {
        positions: positions.iter().map(|p| p.as_dvec3()).collect(),
        quadrics: vec![Quadric::default(); nv],
        faces: faces.clone(),
        face_alive: vec![true; faces.len()],
        vertex_faces: vec![Vec::new(); nv],
        vertex_alive: vec![false; nv],
        versions: vec![0; nv],
        boundary: vec![false; nv],
        active_faces: faces.len(),
    };

    let mut edge_faces: HashMap<(u32, u32), u32> = HashMap::new();
    for (fi, face) in faces.iter().enumerate() {
        for j in 0..3 {
            let a = face[j];
            let b = face[(j + 1) % 3];
            state.vertex_alive[a as usize] = true;
            *edge_faces.entry((a.min(b), a.max(b))).or_default() += 1;
        }
        let q = face_quadric(
            state.positions[face[0] as usize],
            state.positions[face[1] as usize],
            state.positions[face[2] as usize],
        );
        for &v in face {
            state.quadrics[v as usize].add(&q);
            state.vertex_faces[v as usize].push(fi);
        }
    }
    for (&(a, b), &count) in &edge_faces {
        if count == 1 {
            state.boundary[a as usize] = true;
            state.boundary[b as usize] = true;
        }
    }

    // Scale-relative tolerance: the quadric cost is a squared distance.
    let (min, max) = positions.iter().fold(
        (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
        |(min, max), p| (min.min(*p), max.max(*p)),
    );
    let diagonal = (max - min).length() as f64;
    let threshold = (error as f64 * diagonal).powi(2);

    let mut heap: BinaryHeap<Candidate> = BinaryHeap::new();
    let push_candidate = |state: &CollapseState, heap: &mut BinaryHeap<Candidate>, v1: u32, v2: u32| {
        if lock_border && (state.boundary[v1 as usize] || state.boundary[v2 as usize]) {
            return;
        }
        let (position, cost) = state.collapse_cost(v1, v2);
        heap.push(Candidate {
            cost,
            v1,
            v2,
            version1: state.versions[v1 as usize],
            version2: state.versions[v2 as usize],
            position,
        });
    };

    for &(a, b) in edge_faces.keys() {
        push_candidate(&state, &mut heap, a, b);
    }

    let max_iterations = state.faces.len().saturating_mul(16).max(64);
    let mut iterations = 0usize;

    while state.active_faces > target && iterations < max_iterations {
        iterations += 1;
        let Some(candidate) = heap.pop() else {
            break;
        };
        let (v1, v2) = (candidate.v1, candidate.v2);
        if !state.vertex_alive[v1 as usize]
            || !state.vertex_alive[v2 as usize]
            || candidate.version1 != state.versions[v1 as usize]
            || candidate.version2 != state.versions[v2 as usize]
        {
            continue;
        }
        if candidate.cost > threshold {
            break;
        }
        if !state.edge_exists(v1, v2) {
            continue;
        }
        // Link-condition style fin guard: collapsing an edge whose endpoints
        // share more than two neighbors would fold the surface.
        let shared = state
            .neighbors(v1)
            .intersection(&state.neighbors(v2))
            .count();
        if shared > 2 {
            continue;
        }

        // Merge v2 into v1 at the optimal position.
        state.positions[v1 as usize] = candidate.position;
        let v2_quadric = state.quadrics[v2 as usize];
        state.quadrics[v1 as usize].add(&v2_quadric);
        state.boundary[v1 as usize] =
            state.boundary[v1 as usize] || state.boundary[v2 as usize];

        let v2_faces = std::mem::take(&mut state.vertex_faces[v2 as usize]);
        for f in v2_faces {
            if !state.face_alive[f] {
                continue;
            }
            let face = &mut state.faces[f];
            for slot in face.iter_mut() {
                if *slot == v2 {
                    *slot = v1;
                }
            }
            let face = state.faces[f];
            if face[0] == face[1] || face[1] == face[2] || face[2] == face[0] {
                state.face_alive[f] = false;
                state.active_faces -= 1;
            } else {
                state.vertex_faces[v1 as usize].push(f);
            }
        }
        state.vertex_alive[v2 as usize] = false;
        // Only the merged vertex's incident edges change cost; ring edges
        // between untouched neighbors keep their queued candidates.
        state.versions[v1 as usize] += 1;
        state.versions[v2 as usize] += 1;

        for n in state.neighbors(v1) {
            push_candidate(&state, &mut heap, v1, n);
        }
    }

    // Compact: keep vertices referenced by live faces, in first-use order.
    let mut kept = vec![u32::MAX; nv];
    let mut next = 0u32;
    let mut out_indices = Vec::with_capacity(state.active_faces * 3);
    let mut out_positions = Vec::new();
    for (fi, face) in state.faces.iter().enumerate() {
        if !state.face_alive[fi] {
            continue;
        }
        for &v in face {
            if kept[v as usize] == u32::MAX {
                kept[v as usize] = next;
                out_positions.push(state.positions[v as usize].as_vec3());
                next += 1;
            }
            out_indices.push(kept[v as usize]);
        }
    }
    CollapseOutput {
        kept,
        indices: out_indices,
        positions: out_positions,
    }
}

/// Rewrite the primitive's accessors to the compacted post-collapse vertex
/// set. Positions come from the collapse state (collapses relocate surviving
/// vertices); every other attribute is gathered from the kept vertex's
/// original values.
fn rebuild_primitive(
    doc: &mut Document,
    mesh_id: MeshId,
    prim_index: usize,
    output: &CollapseOutput,
) -> Result<()> {
    let attribute_ids: Vec<(Semantic, crate::document::AccessorId)> = {
        let mesh = doc
            .mesh(mesh_id)
            .ok_or_else(|| OptimizeError::Internal("simplify: mesh disappeared".into()))?;
        mesh.primitives[prim_index]
            .attributes
            .iter()
            .map(|(s, id)| (s.clone(), *id))
            .collect()
    };

    // Ordered list of original vertex indices that survive.
    let mut order: Vec<u32> = vec![0; output.kept.iter().filter(|&&k| k != u32::MAX).count()];
    for (original, &slot) in output.kept.iter().enumerate() {
        if slot != u32::MAX {
            order[slot as usize] = original as u32;
        }
    }

    let mut new_ids = Vec::with_capacity(attribute_ids.len());
    for (sem, id) in &attribute_ids {
        let source = doc
            .accessor(*id)
            .ok_or_else(|| OptimizeError::Internal("simplify: accessor disappeared".into()))?;
        let data = if *sem == Semantic::Position {
            AttributeData::F32(output.positions.iter().flat_map(|p| p.to_array()).collect())
        } else {
            gather_elements(&source.data, &order, source.element.components())
        };
        let mut accessor = Accessor::new(source.element, data);
        accessor.normalized = source.normalized;
        accessor.name = source.name.clone();
        new_ids.push((sem.clone(), doc.add_accessor(accessor)));
    }
    let index_id = doc.add_accessor(Accessor::new(
        ElementType::Scalar,
        AttributeData::U32(output.indices.clone()),
    ));

    let mesh = doc
        .mesh_mut(mesh_id)
        .ok_or_else(|| OptimizeError::Internal("simplify: mesh disappeared".into()))?;
    let prim = &mut mesh.primitives[prim_index];
    prim.attributes.clear();
    for (sem, id) in new_ids {
        prim.attributes.insert(sem, id);
    }
    prim.indices = Some(index_id);
    Ok(())
}

fn gather_elements(data: &AttributeData, order: &[u32], components: usize) -> AttributeData {
    fn gather<T: Copy>(values: &[T], order: &[u32], components: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(order.len() * components);
        for &i in order {
            let base = i as usize * components;
            out.extend_from_slice(&values[base..base + components]);
        }
        out
    }
    match data {
        AttributeData::I8(v) => AttributeData::I8(gather(v, order, components)),
        AttributeData::U8(v) => AttributeData::U8(gather(v, order, components)),
        AttributeData::I16(v) => AttributeData::I16(gather(v, order, components)),
        AttributeData::U16(v) => AttributeData::U16(gather(v, order, components)),
        AttributeData::U32(v) => AttributeData::U32(gather(v, order, components)),
        AttributeData::F32(v) => AttributeData::F32(gather(v, order, components)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Mesh, Primitive};

    fn make_grid_doc(size: usize) -> (Document, MeshId) {
        let mut positions = Vec::new();
        for y in 0..size {
            for x in 0..size {
                positions.extend_from_slice(&[x as f32, y as f32, 0.0]);
            }
        }
        let mut indices: Vec<u32> = Vec::new();
        for y in 0..(size - 1) {
            for x in 0..(size - 1) {
                let tl = (y * size + x) as u32;
                let tr = tl + 1;
                let bl = tl + size as u32;
                let br = bl + 1;
                indices.extend_from_slice(&[tl, bl, tr, tr, bl, br]);
            }
        }
        let mut doc = Document::new();
        let pos_id = doc.add_accessor(Accessor::new(
            ElementType::Vec3,
            AttributeData::F32(positions),
        ));
        let idx_id = doc.add_accessor(Accessor::new(
            ElementType::Scalar,
            AttributeData::U32(indices),
        ));
        let mut prim = Primitive::new(PrimitiveMode::Triangles);
        prim.attributes.insert(Semantic::Position, pos_id);
        prim.indices = Some(idx_id);
        let mesh = doc.add_mesh(Mesh {
            name: None,
            primitives: vec![prim],
        });
        (doc, mesh)
    }

    fn enabled(ratio: f32, error: f32) -> SimplifyOptions {
        SimplifyOptions {
            enabled: true,
            target_ratio: Some(ratio),
            target_count: None,
            error,
            lock_border: false,
        }
    }

    // ==================== Option validation ====================

    #[test]
    fn test_rejects_negative_ratio() {
        let (mut doc, _) = make_grid_doc(4);
        let before = doc.triangle_count();
        let err = simplify(&mut doc, &enabled(-1.0, 0.01)).unwrap_err();
        match err {
            OptimizeError::InvalidOptions { field, .. } => assert_eq!(field, "targetRatio"),
            other => panic!("unexpected error {other:?}"),
        }
        // The document must be untouched after a rejected configuration.
        assert_eq!(doc.triangle_count(), before);
    }

    #[test]
    fn test_rejects_ratio_above_one() {
        let (mut doc, _) = make_grid_doc(4);
        assert!(simplify(&mut doc, &enabled(1.5, 0.01)).is_err());
    }

    #[test]
    fn test_rejects_zero_target_count() {
        let (mut doc, _) = make_grid_doc(4);
        let options = SimplifyOptions {
            enabled: true,
            target_ratio: None,
            target_count: Some(0),
            error: 0.01,
            lock_border: false,
        };
        let err = simplify(&mut doc, &options).unwrap_err();
        match err {
            OptimizeError::InvalidOptions { field, .. } => assert_eq!(field, "targetCount"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_rejects_both_targets() {
        let (mut doc, _) = make_grid_doc(4);
        let options = SimplifyOptions {
            enabled: true,
            target_ratio: Some(0.5),
            target_count: Some(10),
            error: 0.01,
            lock_border: false,
        };
        assert!(matches!(
            simplify(&mut doc, &options),
            Err(OptimizeError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_rejects_error_out_of_range() {
        let (mut doc, _) = make_grid_doc(4);
        let err = simplify(&mut doc, &enabled(0.5, 1.5)).unwrap_err();
        match err {
            OptimizeError::InvalidOptions { field, .. } => assert_eq!(field, "error"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    // ==================== Simplification ====================

    #[test]
    fn test_flat_grid_reaches_target() {
        let (mut doc, _) = make_grid_doc(11);
        let original = doc.triangle_count();
        assert_eq!(original, 200);

        let stats = simplify(&mut doc, &enabled(0.5, 0.02)).unwrap();
        assert_eq!(stats.original_triangles, 200);
        assert!(stats.simplified_triangles <= (200.0_f64 * 0.5 * 1.02).ceil() as usize + 2);
        assert!(stats.simplified_triangles > 0);
        assert_eq!(doc.triangle_count(), stats.simplified_triangles);
    }

    #[test]
    fn test_ratio_one_is_identity_on_triangle_count() {
        let (mut doc, _) = make_grid_doc(6);
        let original = doc.triangle_count();
        let stats = simplify(&mut doc, &enabled(1.0, 0.01)).unwrap();
        assert_eq!(stats.simplified_triangles, original);
    }

    #[test]
    fn test_target_count_derives_ratio() {
        let (mut doc, _) = make_grid_doc(11);
        let options = SimplifyOptions {
            enabled: true,
            target_ratio: None,
            target_count: Some(100),
            error: 0.05,
            lock_border: false,
        };
        let stats = simplify(&mut doc, &options).unwrap();
        assert!(stats.simplified_triangles <= 110);
    }

    #[test]
    fn test_lock_border_preserves_outline() {
        let (mut doc, mesh) = make_grid_doc(6);
        let options = SimplifyOptions {
            enabled: true,
            target_ratio: Some(0.4),
            target_count: None,
            error: 0.05,
            lock_border: true,
        };
        simplify(&mut doc, &options).unwrap();

        // Every outline corner must still be present among positions.
        let prim = &doc.mesh(mesh).unwrap().primitives[0];
        let positions = doc.accessor(prim.position().unwrap()).unwrap();
        let values = positions.data.as_f32().unwrap();
        let corners = [[0.0, 0.0], [5.0, 0.0], [0.0, 5.0], [5.0, 5.0]];
        for corner in corners {
            let found = values
                .chunks_exact(3)
                .any(|p| (p[0] - corner[0]).abs() < 1e-4 && (p[1] - corner[1]).abs() < 1e-4);
            assert!(found, "corner {corner:?} was collapsed away");
        }
    }

    #[test]
    fn test_simplified_indices_in_range() {
        let (mut doc, mesh) = make_grid_doc(8);
        simplify(&mut doc, &enabled(0.3, 0.05)).unwrap();
        let prim = &doc.mesh(mesh).unwrap().primitives[0];
        let vertex_count = doc.accessor(prim.position().unwrap()).unwrap().count() as u32;
        let indices = doc.accessor(prim.indices.unwrap()).unwrap().data.to_u32_vec();
        assert!(indices.iter().all(|&i| i < vertex_count));
        assert_eq!(indices.len() % 3, 0);
    }

    // ==================== Welding ====================

    #[test]
    fn test_weld_merges_coincident_vertices() {
        // Two triangles sharing an edge but with duplicated vertices.
        let positions = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0), // duplicate of 1
            Vec3::new(0.0, 1.0, 0.0), // duplicate of 2
            Vec3::new(1.0, 1.0, 0.0),
        ];
        let indices = vec![0, 1, 2, 3, 5, 4];
        let welded = weld(&positions, &indices);
        assert_eq!(welded, vec![0, 1, 2, 1, 5, 2]);
    }

    #[test]
    fn test_weld_keeps_distinct_vertices() {
        let positions = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let indices = vec![0, 1, 2];
        assert_eq!(weld(&positions, &indices), indices);
    }
}
