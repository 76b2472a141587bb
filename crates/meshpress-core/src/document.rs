//! In-memory glTF document graph
//!
//! The document is an ownership graph of glTF entities backed by typed
//! arenas: a `Vec<Option<T>>` of slots per entity kind, addressed by
//! monotonically increasing typed ids. Disposing an entity clears its slot;
//! ids are never reused within a document's lifetime. Forward references
//! (primitive -> accessor, material -> texture, ...) are stored as ids;
//! reverse navigation goes through [`RefIndex`], a snapshot built on demand.
//!
//! Accessors own their decoded element data as typed arrays and textures own
//! their encoded image bytes, so the single binary buffer of a `.glb` exists
//! only at the I/O boundary and is repacked from live entities on write.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use glam::{Mat4, Quat, Vec3};

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) usize);

        impl $name {
            pub fn index(&self) -> usize {
                self.0
            }
        }
    };
}

entity_id!(AccessorId);
entity_id!(MeshId);
entity_id!(MaterialId);
entity_id!(TextureId);
entity_id!(NodeId);

/// Scalar component type of an accessor element
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentType {
    I8,
    U8,
    I16,
    U16,
    U32,
    F32,
}

impl ComponentType {
    pub fn byte_size(&self) -> usize {
        match self {
            ComponentType::I8 | ComponentType::U8 => 1,
            ComponentType::I16 | ComponentType::U16 => 2,
            ComponentType::U32 | ComponentType::F32 => 4,
        }
    }
}

/// Element shape of an accessor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    Scalar,
    Vec2,
    Vec3,
    Vec4,
    Mat2,
    Mat3,
    Mat4,
}

impl ElementType {
    pub fn components(&self) -> usize {
        match self {
            ElementType::Scalar => 1,
            ElementType::Vec2 => 2,
            ElementType::Vec3 => 3,
            ElementType::Vec4 => 4,
            ElementType::Mat2 => 4,
            ElementType::Mat3 => 9,
            ElementType::Mat4 => 16,
        }
    }
}

/// Typed storage for accessor data. The variant always matches the
/// accessor's declared component type.
#[derive(Clone, Debug)]
pub enum AttributeData {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

impl AttributeData {
    pub fn len(&self) -> usize {
        match self {
            AttributeData::I8(v) => v.len(),
            AttributeData::U8(v) => v.len(),
            AttributeData::I16(v) => v.len(),
            AttributeData::U16(v) => v.len(),
            AttributeData::U32(v) => v.len(),
            AttributeData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn component_type(&self) -> ComponentType {
        match self {
            AttributeData::I8(_) => ComponentType::I8,
            AttributeData::U8(_) => ComponentType::U8,
            AttributeData::I16(_) => ComponentType::I16,
            AttributeData::U16(_) => ComponentType::U16,
            AttributeData::U32(_) => ComponentType::U32,
            AttributeData::F32(_) => ComponentType::F32,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.component_type().byte_size()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            AttributeData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            AttributeData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Widen index-typed data to u32, regardless of stored width.
    pub fn to_u32_vec(&self) -> Vec<u32> {
        match self {
            AttributeData::U8(v) => v.iter().map(|&x| x as u32).collect(),
            AttributeData::U16(v) => v.iter().map(|&x| x as u32).collect(),
            AttributeData::U32(v) => v.clone(),
            AttributeData::I8(v) => v.iter().map(|&x| x as u32).collect(),
            AttributeData::I16(v) => v.iter().map(|&x| x as u32).collect(),
            AttributeData::F32(v) => v.iter().map(|&x| x as u32).collect(),
        }
    }
}

/// A typed view over element data
#[derive(Clone, Debug)]
pub struct Accessor {
    pub name: Option<String>,
    pub element: ElementType,
    pub normalized: bool,
    pub data: AttributeData,
    pub min: Option<Vec<f64>>,
    pub max: Option<Vec<f64>>,
}

impl Accessor {
    pub fn new(element: ElementType, data: AttributeData) -> Self {
        Self {
            name: None,
            element,
            normalized: false,
            data,
            min: None,
            max: None,
        }
    }

    pub fn component(&self) -> ComponentType {
        self.data.component_type()
    }

    /// Element count: stored scalars divided by the element's component count.
    pub fn count(&self) -> usize {
        self.data.len() / self.element.components()
    }

    pub fn byte_len(&self) -> usize {
        self.data.byte_len()
    }
}

/// Vertex attribute semantic
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Semantic {
    Position,
    Normal,
    Tangent,
    TexCoord(u32),
    Color(u32),
    Joints(u32),
    Weights(u32),
    Custom(String),
}

impl Semantic {
    pub fn label(&self) -> String {
        match self {
            Semantic::Position => "POSITION".into(),
            Semantic::Normal => "NORMAL".into(),
            Semantic::Tangent => "TANGENT".into(),
            Semantic::TexCoord(n) => format!("TEXCOORD_{n}"),
            Semantic::Color(n) => format!("COLOR_{n}"),
            Semantic::Joints(n) => format!("JOINTS_{n}"),
            Semantic::Weights(n) => format!("WEIGHTS_{n}"),
            Semantic::Custom(s) => s.clone(),
        }
    }
}

/// Primitive topology
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveMode {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

/// Draco compression settings attached to a primitive by the draco step.
/// The actual encode happens when the document is serialized.
#[derive(Clone, Copy, Debug)]
pub struct DracoSettings {
    pub encode_speed: u8,
    pub decode_speed: u8,
    pub position_bits: u8,
    pub normal_bits: u8,
    pub texcoord_bits: u8,
    pub color_bits: u8,
    pub generic_bits: u8,
}

/// Morph target attribute bindings (deltas against the base attributes)
#[derive(Clone, Debug, Default)]
pub struct MorphTarget {
    pub position: Option<AccessorId>,
    pub normal: Option<AccessorId>,
    pub tangent: Option<AccessorId>,
}

/// One draw unit: attribute bindings + optional indices + material
#[derive(Clone, Debug)]
pub struct Primitive {
    pub mode: PrimitiveMode,
    pub attributes: BTreeMap<Semantic, AccessorId>,
    pub indices: Option<AccessorId>,
    pub material: Option<MaterialId>,
    pub targets: Vec<MorphTarget>,
    pub draco: Option<DracoSettings>,
}

impl Primitive {
    pub fn new(mode: PrimitiveMode) -> Self {
        Self {
            mode,
            attributes: BTreeMap::new(),
            indices: None,
            material: None,
            targets: Vec::new(),
            draco: None,
        }
    }

    pub fn position(&self) -> Option<AccessorId> {
        self.attributes.get(&Semantic::Position).copied()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub name: Option<String>,
    pub primitives: Vec<Primitive>,
}

/// Reference from a material slot to a texture
#[derive(Clone, Copy, Debug)]
pub struct TextureBinding {
    pub texture: TextureId,
    pub tex_coord: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlphaMode {
    Opaque,
    Mask,
    Blend,
}

/// PBR metallic-roughness material with five texture slots
#[derive(Clone, Debug)]
pub struct Material {
    pub name: Option<String>,
    pub base_color_factor: [f32; 4],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub emissive_factor: [f32; 3],
    pub alpha_mode: AlphaMode,
    pub alpha_cutoff: Option<f32>,
    pub double_sided: bool,
    pub base_color: Option<TextureBinding>,
    pub normal: Option<TextureBinding>,
    pub normal_scale: f32,
    pub metallic_roughness: Option<TextureBinding>,
    pub occlusion: Option<TextureBinding>,
    pub occlusion_strength: f32,
    pub emissive: Option<TextureBinding>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: None,
            base_color_factor: [1.0, 1.0, 1.0, 1.0],
            metallic_factor: 1.0,
            roughness_factor: 1.0,
            emissive_factor: [0.0, 0.0, 0.0],
            alpha_mode: AlphaMode::Opaque,
            alpha_cutoff: None,
            double_sided: false,
            base_color: None,
            normal: None,
            normal_scale: 1.0,
            metallic_roughness: None,
            occlusion: None,
            occlusion_strength: 1.0,
            emissive: None,
        }
    }
}

/// The five material texture slots recognized by the texture step filter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialSlot {
    BaseColor,
    Normal,
    MetallicRoughness,
    Occlusion,
    Emissive,
}

impl Material {
    pub fn binding(&self, slot: MaterialSlot) -> Option<TextureBinding> {
        match slot {
            MaterialSlot::BaseColor => self.base_color,
            MaterialSlot::Normal => self.normal,
            MaterialSlot::MetallicRoughness => self.metallic_roughness,
            MaterialSlot::Occlusion => self.occlusion,
            MaterialSlot::Emissive => self.emissive,
        }
    }

    pub fn bindings(&self) -> impl Iterator<Item = TextureBinding> + '_ {
        [
            self.base_color,
            self.normal,
            self.metallic_roughness,
            self.occlusion,
            self.emissive,
        ]
        .into_iter()
        .flatten()
    }
}

/// Encoded image bytes plus MIME type and sampling settings
#[derive(Clone, Debug)]
pub struct Texture {
    pub name: Option<String>,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub sampler: Option<gltf_json::texture::Sampler>,
}

/// Scene-graph node: local TRS (or matrix), children, optional payload
#[derive(Clone, Debug)]
pub struct Node {
    pub name: Option<String>,
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub matrix: Option<Mat4>,
    pub children: Vec<NodeId>,
    pub mesh: Option<MeshId>,
    pub skin: Option<usize>,
    pub camera: Option<usize>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            name: None,
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            matrix: None,
            children: Vec::new(),
            mesh: None,
            skin: None,
            camera: None,
        }
    }
}

impl Node {
    /// TRS decomposition, resolving a stored matrix if present.
    pub fn trs(&self) -> (Vec3, Quat, Vec3) {
        match self.matrix {
            Some(m) => {
                let (scale, rotation, translation) = m.to_scale_rotation_translation();
                (translation, rotation, scale)
            }
            None => (self.translation, self.rotation, self.scale),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub name: Option<String>,
    pub nodes: Vec<NodeId>,
}

#[derive(Clone, Debug)]
pub struct Skin {
    pub name: Option<String>,
    pub inverse_bind_matrices: Option<AccessorId>,
    pub joints: Vec<NodeId>,
    pub skeleton: Option<NodeId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Linear,
    Step,
    CubicSpline,
}

#[derive(Clone, Debug)]
pub struct AnimationSampler {
    pub input: AccessorId,
    pub output: AccessorId,
    pub interpolation: Interpolation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPath {
    Translation,
    Rotation,
    Scale,
    MorphTargetWeights,
}

#[derive(Clone, Debug)]
pub struct AnimationChannel {
    pub sampler: usize,
    pub node: NodeId,
    pub path: TargetPath,
}

#[derive(Clone, Debug, Default)]
pub struct Animation {
    pub name: Option<String>,
    pub samplers: Vec<AnimationSampler>,
    pub channels: Vec<AnimationChannel>,
}

/// The document root: typed arenas plus scene/extension bookkeeping
#[derive(Default, Debug)]
pub struct Document {
    accessors: Vec<Option<Accessor>>,
    meshes: Vec<Option<Mesh>>,
    materials: Vec<Option<Material>>,
    textures: Vec<Option<Texture>>,
    nodes: Vec<Option<Node>>,
    pub scenes: Vec<Scene>,
    pub default_scene: Option<usize>,
    pub skins: Vec<Skin>,
    pub animations: Vec<Animation>,
    pub cameras: Vec<gltf_json::Camera>,
    pub generator: Option<String>,
    pub copyright: Option<String>,
    extensions_used: BTreeSet<String>,
    extensions_required: BTreeSet<String>,
}

macro_rules! arena_access {
    ($field:ident, $id:ident, $ty:ty, $add:ident, $get:ident, $get_mut:ident, $dispose:ident, $iter:ident, $count:ident) => {
        pub fn $add(&mut self, value: $ty) -> $id {
            self.$field.push(Some(value));
            $id(self.$field.len() - 1)
        }

        pub fn $get(&self, id: $id) -> Option<&$ty> {
            self.$field.get(id.0).and_then(|slot| slot.as_ref())
        }

        pub fn $get_mut(&mut self, id: $id) -> Option<&mut $ty> {
            self.$field.get_mut(id.0).and_then(|slot| slot.as_mut())
        }

        pub fn $dispose(&mut self, id: $id) {
            if let Some(slot) = self.$field.get_mut(id.0) {
                *slot = None;
            }
        }

        pub fn $iter(&self) -> impl Iterator<Item = ($id, &$ty)> {
            self.$field
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.as_ref().map(|v| ($id(i), v)))
        }

        pub fn $count(&self) -> usize {
            self.$field.iter().filter(|slot| slot.is_some()).count()
        }
    };
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    arena_access!(
        accessors,
        AccessorId,
        Accessor,
        add_accessor,
        accessor,
        accessor_mut,
        dispose_accessor,
        iter_accessors,
        accessor_count
    );
    arena_access!(
        meshes, MeshId, Mesh, add_mesh, mesh, mesh_mut, dispose_mesh, iter_meshes, mesh_count
    );
    arena_access!(
        materials,
        MaterialId,
        Material,
        add_material,
        material,
        material_mut,
        dispose_material,
        iter_materials,
        material_count
    );
    arena_access!(
        textures,
        TextureId,
        Texture,
        add_texture,
        texture,
        texture_mut,
        dispose_texture,
        iter_textures,
        texture_count
    );
    arena_access!(
        nodes, NodeId, Node, add_node, node, node_mut, dispose_node, iter_nodes, node_count
    );

    /// Parallel mutable access to every live accessor slot; used by steps
    /// whose per-accessor writes are disjoint.
    pub fn accessors_slots_mut(&mut self) -> &mut [Option<Accessor>] {
        &mut self.accessors
    }

    pub fn mesh_ids(&self) -> Vec<MeshId> {
        self.iter_meshes().map(|(id, _)| id).collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.iter_nodes().map(|(id, _)| id).collect()
    }

    /// Total triangle count over live primitives with triangle topology.
    pub fn triangle_count(&self) -> usize {
        self.iter_meshes()
            .flat_map(|(_, mesh)| mesh.primitives.iter())
            .filter(|prim| prim.mode == PrimitiveMode::Triangles)
            .map(|prim| {
                let vertices = match prim.indices {
                    Some(idx) => self.accessor(idx).map(|a| a.count()).unwrap_or(0),
                    None => prim
                        .position()
                        .and_then(|id| self.accessor(id))
                        .map(|a| a.count())
                        .unwrap_or(0),
                };
                vertices / 3
            })
            .sum()
    }

    pub fn mark_extension_used(&mut self, name: &str, required: bool) {
        self.extensions_used.insert(name.to_string());
        if required {
            self.extensions_required.insert(name.to_string());
        }
    }

    pub fn extension_used(&self, name: &str) -> bool {
        self.extensions_used.contains(name)
    }

    pub fn extension_required(&self, name: &str) -> bool {
        self.extensions_required.contains(name)
    }

    pub fn extensions_used(&self) -> impl Iterator<Item = &String> {
        self.extensions_used.iter()
    }

    pub fn extensions_required(&self) -> impl Iterator<Item = &String> {
        self.extensions_required.iter()
    }

    /// Scene roots for reachability queries: the default scene when one is
    /// marked, otherwise every scene.
    pub fn root_nodes(&self) -> Vec<NodeId> {
        match self.default_scene {
            Some(i) => self
                .scenes
                .get(i)
                .map(|s| s.nodes.clone())
                .unwrap_or_default(),
            None => self
                .scenes
                .iter()
                .flat_map(|s| s.nodes.iter().copied())
                .collect(),
        }
    }

    /// Dispose accessors that no longer have any referrer. Returns the
    /// number of accessors removed.
    pub fn dispose_orphan_accessors(&mut self) -> usize {
        let refs = RefIndex::build(self);
        let orphans: Vec<AccessorId> = self
            .iter_accessors()
            .filter(|(id, _)| refs.accessor_refs(*id) == 0)
            .map(|(id, _)| id)
            .collect();
        for id in &orphans {
            self.dispose_accessor(*id);
        }
        orphans.len()
    }
}

/// Reverse-reference snapshot: for each entity, how many live entities refer
/// to it. Rebuilt on demand; a fresh build reflects all prior mutations.
pub struct RefIndex {
    accessor: HashMap<AccessorId, usize>,
    texture: HashMap<TextureId, usize>,
    material: HashMap<MaterialId, usize>,
    mesh: HashMap<MeshId, usize>,
}

impl RefIndex {
    pub fn build(doc: &Document) -> Self {
        let mut index = RefIndex {
            accessor: HashMap::new(),
            texture: HashMap::new(),
            material: HashMap::new(),
            mesh: HashMap::new(),
        };

        for (_, mesh) in doc.iter_meshes() {
            for prim in &mesh.primitives {
                for id in prim.attributes.values() {
                    *index.accessor.entry(*id).or_default() += 1;
                }
                if let Some(id) = prim.indices {
                    *index.accessor.entry(id).or_default() += 1;
                }
                for target in &prim.targets {
                    for id in [target.position, target.normal, target.tangent]
                        .into_iter()
                        .flatten()
                    {
                        *index.accessor.entry(id).or_default() += 1;
                    }
                }
                if let Some(id) = prim.material {
                    *index.material.entry(id).or_default() += 1;
                }
            }
        }

        for skin in &doc.skins {
            if let Some(id) = skin.inverse_bind_matrices {
                *index.accessor.entry(id).or_default() += 1;
            }
        }

        for anim in &doc.animations {
            for sampler in &anim.samplers {
                *index.accessor.entry(sampler.input).or_default() += 1;
                *index.accessor.entry(sampler.output).or_default() += 1;
            }
        }

        for (_, material) in doc.iter_materials() {
            for binding in material.bindings() {
                *index.texture.entry(binding.texture).or_default() += 1;
            }
        }

        for (_, node) in doc.iter_nodes() {
            if let Some(id) = node.mesh {
                *index.mesh.entry(id).or_default() += 1;
            }
        }

        index
    }

    pub fn accessor_refs(&self, id: AccessorId) -> usize {
        self.accessor.get(&id).copied().unwrap_or(0)
    }

    pub fn texture_refs(&self, id: TextureId) -> usize {
        self.texture.get(&id).copied().unwrap_or(0)
    }

    pub fn material_refs(&self, id: MaterialId) -> usize {
        self.material.get(&id).copied().unwrap_or(0)
    }

    pub fn mesh_refs(&self, id: MeshId) -> usize {
        self.mesh.get(&id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_triangle_doc() -> (Document, MeshId, AccessorId, AccessorId) {
        let mut doc = Document::new();
        let positions = doc.add_accessor(Accessor::new(
            ElementType::Vec3,
            AttributeData::F32(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.5, 1.0, 0.0]),
        ));
        let indices = doc.add_accessor(Accessor::new(
            ElementType::Scalar,
            AttributeData::U32(vec![0, 1, 2]),
        ));
        let mut prim = Primitive::new(PrimitiveMode::Triangles);
        prim.attributes.insert(Semantic::Position, positions);
        prim.indices = Some(indices);
        let mesh = doc.add_mesh(Mesh {
            name: None,
            primitives: vec![prim],
        });
        (doc, mesh, positions, indices)
    }

    #[test]
    fn test_accessor_count_matches_element_layout() {
        let (doc, _, positions, _) = make_triangle_doc();
        let acc = doc.accessor(positions).unwrap();
        assert_eq!(acc.count(), 3);
        assert_eq!(acc.byte_len(), 36);
    }

    #[test]
    fn test_dispose_clears_slot_without_shifting_ids() {
        let (mut doc, _, positions, indices) = make_triangle_doc();
        doc.dispose_accessor(positions);
        assert!(doc.accessor(positions).is_none());
        assert!(doc.accessor(indices).is_some());
        assert_eq!(doc.accessor_count(), 1);
    }

    #[test]
    fn test_triangle_count_uses_indices_when_present() {
        let (doc, _, _, _) = make_triangle_doc();
        assert_eq!(doc.triangle_count(), 1);
    }

    #[test]
    fn test_ref_index_counts_primitive_references() {
        let (doc, _, positions, indices) = make_triangle_doc();
        let refs = RefIndex::build(&doc);
        assert_eq!(refs.accessor_refs(positions), 1);
        assert_eq!(refs.accessor_refs(indices), 1);
    }

    #[test]
    fn test_orphan_accessor_disposal() {
        let (mut doc, _, _, _) = make_triangle_doc();
        let orphan = doc.add_accessor(Accessor::new(
            ElementType::Scalar,
            AttributeData::F32(vec![1.0, 2.0]),
        ));
        assert_eq!(doc.dispose_orphan_accessors(), 1);
        assert!(doc.accessor(orphan).is_none());
        assert_eq!(doc.accessor_count(), 2);
    }

    #[test]
    fn test_root_nodes_prefers_default_scene() {
        let mut doc = Document::new();
        let a = doc.add_node(Node::default());
        let b = doc.add_node(Node::default());
        doc.scenes.push(Scene {
            name: None,
            nodes: vec![a],
        });
        doc.scenes.push(Scene {
            name: None,
            nodes: vec![b],
        });
        assert_eq!(doc.root_nodes().len(), 2);
        doc.default_scene = Some(1);
        assert_eq!(doc.root_nodes(), vec![b]);
    }

    #[test]
    fn test_extension_registration() {
        let mut doc = Document::new();
        doc.mark_extension_used("KHR_texture_basisu", true);
        assert!(doc.extension_used("KHR_texture_basisu"));
        assert!(doc.extension_required("KHR_texture_basisu"));
        doc.mark_extension_used("KHR_mesh_quantization", false);
        assert!(!doc.extension_required("KHR_mesh_quantization"));
    }

    #[test]
    fn test_node_trs_resolves_matrix() {
        let mut node = Node::default();
        node.matrix = Some(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        let (t, r, s) = node.trs();
        assert!((t - Vec3::new(1.0, 2.0, 3.0)).length() < 1e-6);
        assert!((r.length() - 1.0).abs() < 1e-6);
        assert!((s - Vec3::ONE).length() < 1e-6);
    }
}
