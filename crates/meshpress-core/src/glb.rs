//! glTF 2.0 binary container I/O
//!
//! `read` parses a `.glb` into a [`Document`]; `write` serializes the
//! mutated document back, repacking a single BIN buffer from live entities
//! and performing any deferred Draco encoding.
//!
//! GLB layout:
//! - 12 byte header: magic `glTF`, version 2, total length
//! - JSON chunk (`{length, 0x4E4F534A, data}`)
//! - optional BIN chunk (`{length, 0x004E4942, data}`)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use bytemuck::cast_slice;
use glam::{Mat4, Quat, Vec3};
use gltf_json as json;
use gltf_json::validation::{Checked, USize64};
use log::warn;

use crate::document::{
    Accessor, AccessorId, AlphaMode, Animation, AnimationChannel, AnimationSampler, AttributeData,
    ComponentType, Document, ElementType, Interpolation, Material, MaterialId, Mesh, MeshId,
    MorphTarget, Node, NodeId, Primitive, PrimitiveMode, Scene, Semantic, Skin, TargetPath,
    Texture, TextureBinding, TextureId,
};
use crate::{OptimizeError, Result, MAX_INPUT_SIZE};

const GLB_MAGIC: u32 = 0x4654_6C67;
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

pub const EXT_DRACO: &str = "KHR_draco_mesh_compression";
pub const EXT_BASISU: &str = "KHR_texture_basisu";
pub const EXT_QUANTIZATION: &str = "KHR_mesh_quantization";

/// Read a `.glb` file into a document, enforcing the input size cap.
pub fn read(path: &Path) -> Result<Document> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| OptimizeError::InvalidFile(format!("cannot stat {}: {e}", path.display())))?;
    if metadata.len() > MAX_INPUT_SIZE {
        return Err(OptimizeError::FileTooLarge {
            size: metadata.len(),
            limit: MAX_INPUT_SIZE,
        });
    }
    let bytes = std::fs::read(path)
        .map_err(|e| OptimizeError::InvalidFile(format!("cannot read {}: {e}", path.display())))?;
    from_glb_bytes(&bytes)
}

/// Serialize the document to a `.glb` file. Returns the byte size written.
pub fn write(path: &Path, doc: &mut Document) -> Result<u64> {
    let bytes = to_glb_bytes(doc)?;
    std::fs::write(path, &bytes).map_err(|e| OptimizeError::WriteFailed(e.to_string()))?;
    Ok(bytes.len() as u64)
}

// ------------------------------------------------------------------
// Container parsing
// ------------------------------------------------------------------

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Parse a GLB byte buffer into a document.
pub fn from_glb_bytes(bytes: &[u8]) -> Result<Document> {
    if bytes.len() as u64 > MAX_INPUT_SIZE {
        return Err(OptimizeError::FileTooLarge {
            size: bytes.len() as u64,
            limit: MAX_INPUT_SIZE,
        });
    }
    if bytes.len() < 12 {
        return Err(OptimizeError::InvalidFile(
            "truncated container: missing 12-byte header".into(),
        ));
    }

    let magic = read_u32(bytes, 0).unwrap_or(0);
    if magic != GLB_MAGIC {
        return Err(OptimizeError::InvalidFile(format!(
            "bad magic 0x{magic:08X}, expected 0x{GLB_MAGIC:08X}"
        )));
    }
    let version = read_u32(bytes, 4).unwrap_or(0);
    if version != GLB_VERSION {
        return Err(OptimizeError::InvalidFile(format!(
            "unsupported container version {version}"
        )));
    }
    let declared_length = read_u32(bytes, 8).unwrap_or(0) as usize;
    if declared_length != bytes.len() {
        return Err(OptimizeError::InvalidFile(format!(
            "declared length {declared_length} does not match actual size {}",
            bytes.len()
        )));
    }

    let mut offset = 12;
    let mut json_chunk: Option<&[u8]> = None;
    let mut bin_chunk: Option<&[u8]> = None;

    while offset + 8 <= bytes.len() {
        let chunk_len = read_u32(bytes, offset).unwrap_or(0) as usize;
        let chunk_type = read_u32(bytes, offset + 4).unwrap_or(0);
        let data_start = offset + 8;
        let data_end = data_start
            .checked_add(chunk_len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                OptimizeError::InvalidFile(format!(
                    "chunk at offset {offset} overruns the container"
                ))
            })?;
        let data = &bytes[data_start..data_end];
        match chunk_type {
            CHUNK_JSON if json_chunk.is_none() => json_chunk = Some(data),
            CHUNK_BIN if bin_chunk.is_none() => bin_chunk = Some(data),
            // Unknown chunk types are skipped per the container spec.
            _ => {}
        }
        offset = data_end;
    }

    let json_chunk =
        json_chunk.ok_or_else(|| OptimizeError::InvalidFile("missing JSON chunk".into()))?;
    let root: json::Root = serde_json::from_slice(json_chunk)
        .map_err(|e| OptimizeError::InvalidFile(format!("unparseable JSON chunk: {e}")))?;
    import_root(&root, bin_chunk.unwrap_or(&[]))
}

fn checked<T: Clone>(value: &Checked<T>, what: &str) -> Result<T> {
    match value {
        Checked::Valid(v) => Ok(v.clone()),
        Checked::Invalid => Err(OptimizeError::InvalidFile(format!("invalid {what} value"))),
    }
}

fn component_from_json(ct: json::accessor::ComponentType) -> ComponentType {
    match ct {
        json::accessor::ComponentType::I8 => ComponentType::I8,
        json::accessor::ComponentType::U8 => ComponentType::U8,
        json::accessor::ComponentType::I16 => ComponentType::I16,
        json::accessor::ComponentType::U16 => ComponentType::U16,
        json::accessor::ComponentType::U32 => ComponentType::U32,
        json::accessor::ComponentType::F32 => ComponentType::F32,
    }
}

fn element_from_json(t: json::accessor::Type) -> ElementType {
    match t {
        json::accessor::Type::Scalar => ElementType::Scalar,
        json::accessor::Type::Vec2 => ElementType::Vec2,
        json::accessor::Type::Vec3 => ElementType::Vec3,
        json::accessor::Type::Vec4 => ElementType::Vec4,
        json::accessor::Type::Mat2 => ElementType::Mat2,
        json::accessor::Type::Mat3 => ElementType::Mat3,
        json::accessor::Type::Mat4 => ElementType::Mat4,
    }
}

fn value_to_bounds(value: &Option<serde_json::Value>) -> Option<Vec<f64>> {
    value.as_ref().and_then(|v| {
        v.as_array()
            .map(|arr| arr.iter().filter_map(|x| x.as_f64()).collect())
    })
}

/// Raw bytes of a buffer view within the BIN chunk.
fn view_bytes<'a>(
    root: &json::Root,
    blob: &'a [u8],
    view_index: usize,
) -> Result<(&'a [u8], Option<usize>)> {
    let view = root
        .buffer_views
        .get(view_index)
        .ok_or_else(|| OptimizeError::InvalidFile(format!("buffer view {view_index} missing")))?;
    if view.buffer.value() != 0 {
        return Err(OptimizeError::InvalidFile(
            "external buffers are not supported in binary containers".into(),
        ));
    }
    let offset = view.byte_offset.map(|o| o.0 as usize).unwrap_or(0);
    let length = view.byte_length.0 as usize;
    let data = blob.get(offset..offset + length).ok_or_else(|| {
        OptimizeError::InvalidFile(format!("buffer view {view_index} overruns the BIN chunk"))
    })?;
    Ok((data, view.byte_stride.map(|s| s.0)))
}

/// Decode one accessor into typed element data, honoring interleaved strides.
fn decode_accessor(root: &json::Root, blob: &[u8], acc: &json::Accessor) -> Result<Accessor> {
    if acc.sparse.is_some() {
        return Err(OptimizeError::InvalidFile(
            "sparse accessors are not supported".into(),
        ));
    }
    let component = component_from_json(checked(&acc.component_type, "componentType")?.0);
    let element = element_from_json(checked(&acc.type_, "accessor type")?);
    let count = acc.count.0 as usize;
    let components = element.components();
    let comp_size = component.byte_size();
    let elem_size = components * comp_size;

    let mut raw = vec![0u8; count * elem_size];
    if let Some(view_index) = acc.buffer_view {
        let (data, stride) = view_bytes(root, blob, view_index.value())?;
        let stride = stride.unwrap_or(elem_size);
        let base = acc.byte_offset.map(|o| o.0 as usize).unwrap_or(0);
        for i in 0..count {
            let src = base + i * stride;
            let chunk = data.get(src..src + elem_size).ok_or_else(|| {
                OptimizeError::InvalidFile("accessor overruns its buffer view".into())
            })?;
            raw[i * elem_size..(i + 1) * elem_size].copy_from_slice(chunk);
        }
    }
    // Accessors without a buffer view are zero-filled per the format spec.

    let scalars = count * components;
    let data = match component {
        ComponentType::I8 => {
            AttributeData::I8(raw.iter().map(|&b| b as i8).take(scalars).collect())
        }
        ComponentType::U8 => AttributeData::U8(raw),
        ComponentType::I16 => AttributeData::I16(
            raw.chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        ComponentType::U16 => AttributeData::U16(
            raw.chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        ComponentType::U32 => AttributeData::U32(
            raw.chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        ComponentType::F32 => AttributeData::F32(
            raw.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
    };

    Ok(Accessor {
        name: acc.name.clone(),
        element,
        normalized: acc.normalized,
        data,
        min: value_to_bounds(&acc.min),
        max: value_to_bounds(&acc.max),
    })
}

fn semantic_from_json(sem: &json::mesh::Semantic) -> Semantic {
    match sem {
        json::mesh::Semantic::Positions => Semantic::Position,
        json::mesh::Semantic::Normals => Semantic::Normal,
        json::mesh::Semantic::Tangents => Semantic::Tangent,
        json::mesh::Semantic::TexCoords(n) => Semantic::TexCoord(*n),
        json::mesh::Semantic::Colors(n) => Semantic::Color(*n),
        json::mesh::Semantic::Joints(n) => Semantic::Joints(*n),
        json::mesh::Semantic::Weights(n) => Semantic::Weights(*n),
        json::mesh::Semantic::Extras(name) => Semantic::Custom(format!("_{name}")),
    }
}

fn semantic_to_json(sem: &Semantic) -> json::mesh::Semantic {
    match sem {
        Semantic::Position => json::mesh::Semantic::Positions,
        Semantic::Normal => json::mesh::Semantic::Normals,
        Semantic::Tangent => json::mesh::Semantic::Tangents,
        Semantic::TexCoord(n) => json::mesh::Semantic::TexCoords(*n),
        Semantic::Color(n) => json::mesh::Semantic::Colors(*n),
        Semantic::Joints(n) => json::mesh::Semantic::Joints(*n),
        Semantic::Weights(n) => json::mesh::Semantic::Weights(*n),
        Semantic::Custom(label) => {
            json::mesh::Semantic::Extras(label.trim_start_matches('_').to_string())
        }
    }
}

fn mode_from_json(mode: json::mesh::Mode) -> PrimitiveMode {
    match mode {
        json::mesh::Mode::Points => PrimitiveMode::Points,
        json::mesh::Mode::Lines => PrimitiveMode::Lines,
        json::mesh::Mode::LineLoop => PrimitiveMode::LineLoop,
        json::mesh::Mode::LineStrip => PrimitiveMode::LineStrip,
        json::mesh::Mode::Triangles => PrimitiveMode::Triangles,
        json::mesh::Mode::TriangleStrip => PrimitiveMode::TriangleStrip,
        json::mesh::Mode::TriangleFan => PrimitiveMode::TriangleFan,
    }
}

fn mode_to_json(mode: PrimitiveMode) -> json::mesh::Mode {
    match mode {
        PrimitiveMode::Points => json::mesh::Mode::Points,
        PrimitiveMode::Lines => json::mesh::Mode::Lines,
        PrimitiveMode::LineLoop => json::mesh::Mode::LineLoop,
        PrimitiveMode::LineStrip => json::mesh::Mode::LineStrip,
        PrimitiveMode::Triangles => json::mesh::Mode::Triangles,
        PrimitiveMode::TriangleStrip => json::mesh::Mode::TriangleStrip,
        PrimitiveMode::TriangleFan => json::mesh::Mode::TriangleFan,
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        "image/jpeg"
    } else if bytes.starts_with(&[0xAB, 0x4B, 0x54, 0x58, 0x20, 0x32, 0x30, 0xBB]) {
        "image/ktx2"
    } else if bytes.len() > 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

fn binding_from_info(info: &json::texture::Info) -> TextureBinding {
    TextureBinding {
        texture: TextureId(info.index.value()),
        tex_coord: info.tex_coord,
    }
}

fn import_material(mat: &json::Material) -> Result<Material> {
    let pbr = &mat.pbr_metallic_roughness;
    Ok(Material {
        name: mat.name.clone(),
        base_color_factor: pbr.base_color_factor.0,
        metallic_factor: pbr.metallic_factor.0,
        roughness_factor: pbr.roughness_factor.0,
        emissive_factor: mat.emissive_factor.0,
        alpha_mode: match checked(&mat.alpha_mode, "alphaMode")? {
            json::material::AlphaMode::Opaque => AlphaMode::Opaque,
            json::material::AlphaMode::Mask => AlphaMode::Mask,
            json::material::AlphaMode::Blend => AlphaMode::Blend,
        },
        alpha_cutoff: mat.alpha_cutoff.map(|c| c.0),
        double_sided: mat.double_sided,
        base_color: pbr.base_color_texture.as_ref().map(binding_from_info),
        normal: mat.normal_texture.as_ref().map(|n| TextureBinding {
            texture: TextureId(n.index.value()),
            tex_coord: n.tex_coord,
        }),
        normal_scale: mat.normal_texture.as_ref().map(|n| n.scale).unwrap_or(1.0),
        metallic_roughness: pbr
            .metallic_roughness_texture
            .as_ref()
            .map(binding_from_info),
        occlusion: mat.occlusion_texture.as_ref().map(|o| TextureBinding {
            texture: TextureId(o.index.value()),
            tex_coord: o.tex_coord,
        }),
        occlusion_strength: mat
            .occlusion_texture
            .as_ref()
            .map(|o| o.strength.0)
            .unwrap_or(1.0),
        emissive: mat.emissive_texture.as_ref().map(binding_from_info),
    })
}

fn import_root(root: &json::Root, blob: &[u8]) -> Result<Document> {
    let mut doc = Document::new();
    doc.generator = root.asset.generator.clone();
    doc.copyright = root.asset.copyright.clone();

    // Buffers: a binary container carries exactly one embedded buffer.
    for buffer in &root.buffers {
        if buffer.uri.is_some() {
            return Err(OptimizeError::InvalidFile(
                "external buffer URIs are not supported".into(),
            ));
        }
    }

    // Accessors first; arena ids line up with JSON indices.
    for acc in &root.accessors {
        doc.add_accessor(decode_accessor(root, blob, acc)?);
    }

    // Textures own their image bytes and sampler settings.
    for tex in &root.textures {
        let image = root
            .images
            .get(tex.source.value())
            .ok_or_else(|| OptimizeError::InvalidFile("texture references missing image".into()))?;
        if image.uri.is_some() {
            return Err(OptimizeError::InvalidFile(
                "external image URIs are not supported".into(),
            ));
        }
        let bytes = match image.buffer_view {
            Some(view) => view_bytes(root, blob, view.value())?.0.to_vec(),
            None => Vec::new(),
        };
        let mime = image
            .mime_type
            .as_ref()
            .map(|m| m.0.clone())
            .unwrap_or_else(|| sniff_mime(&bytes).to_string());
        let sampler = tex
            .sampler
            .and_then(|s| root.samplers.get(s.value()).cloned());
        doc.add_texture(Texture {
            name: tex.name.clone().or_else(|| image.name.clone()),
            mime,
            bytes,
            sampler,
        });
    }

    for mat in &root.materials {
        let imported = import_material(mat)?;
        for binding in imported.bindings() {
            if binding.texture.0 >= root.textures.len() {
                return Err(OptimizeError::InvalidFile(
                    "material references missing texture".into(),
                ));
            }
        }
        doc.add_material(imported);
    }

    for mesh in &root.meshes {
        let mut primitives = Vec::with_capacity(mesh.primitives.len());
        for prim in &mesh.primitives {
            if let Some(ext) = &prim.extensions {
                if ext.others.contains_key(EXT_DRACO) {
                    return Err(OptimizeError::InvalidFile(
                        "Draco-compressed input is not supported".into(),
                    ));
                }
            }
            let mut imported = Primitive::new(mode_from_json(checked(&prim.mode, "mode")?));
            for (sem, idx) in &prim.attributes {
                let sem = checked(sem, "attribute semantic")?;
                imported
                    .attributes
                    .insert(semantic_from_json(&sem), AccessorId(idx.value()));
            }
            imported.indices = prim.indices.map(|i| AccessorId(i.value()));
            imported.material = prim.material.map(|m| MaterialId(m.value()));
            for target in prim.targets.as_deref().unwrap_or(&[]) {
                imported.targets.push(MorphTarget {
                    position: target.positions.map(|i| AccessorId(i.value())),
                    normal: target.normals.map(|i| AccessorId(i.value())),
                    tangent: target.tangents.map(|i| AccessorId(i.value())),
                });
            }

            // An indexed primitive must not address past its vertex data.
            if let (Some(indices), Some(position)) = (imported.indices, imported.position()) {
                let vertex_count = doc
                    .accessor(position)
                    .map(|a| a.count() as u32)
                    .unwrap_or(0);
                let max_index = doc
                    .accessor(indices)
                    .map(|a| a.data.to_u32_vec().into_iter().max().unwrap_or(0))
                    .unwrap_or(0);
                if vertex_count > 0 && max_index >= vertex_count {
                    return Err(OptimizeError::InvalidFile(format!(
                        "index {max_index} out of range for {vertex_count} vertices"
                    )));
                }
            }
            primitives.push(imported);
        }
        doc.add_mesh(Mesh {
            name: mesh.name.clone(),
            primitives,
        });
    }

    for node in &root.nodes {
        let mut imported = Node {
            name: node.name.clone(),
            translation: node.translation.map(Vec3::from_array).unwrap_or(Vec3::ZERO),
            rotation: node
                .rotation
                .map(|r| Quat::from_array(r.0))
                .unwrap_or(Quat::IDENTITY),
            scale: node.scale.map(Vec3::from_array).unwrap_or(Vec3::ONE),
            matrix: node.matrix.map(|m| Mat4::from_cols_array(&m)),
            children: Vec::new(),
            mesh: node.mesh.map(|m| MeshId(m.value())),
            skin: node.skin.map(|s| s.value()),
            camera: node.camera.map(|c| c.value()),
        };
        if let Some(children) = &node.children {
            imported.children = children.iter().map(|c| NodeId(c.value())).collect();
        }
        doc.add_node(imported);
    }

    for scene in &root.scenes {
        doc.scenes.push(Scene {
            name: scene.name.clone(),
            nodes: scene.nodes.iter().map(|n| NodeId(n.value())).collect(),
        });
    }
    doc.default_scene = root.scene.map(|s| s.value());

    for skin in &root.skins {
        doc.skins.push(Skin {
            name: skin.name.clone(),
            inverse_bind_matrices: skin.inverse_bind_matrices.map(|i| AccessorId(i.value())),
            joints: skin.joints.iter().map(|j| NodeId(j.value())).collect(),
            skeleton: skin.skeleton.map(|s| NodeId(s.value())),
        });
    }

    for anim in &root.animations {
        let mut imported = Animation {
            name: anim.name.clone(),
            samplers: Vec::with_capacity(anim.samplers.len()),
            channels: Vec::with_capacity(anim.channels.len()),
        };
        for sampler in &anim.samplers {
            imported.samplers.push(AnimationSampler {
                input: AccessorId(sampler.input.value()),
                output: AccessorId(sampler.output.value()),
                interpolation: match checked(&sampler.interpolation, "interpolation")? {
                    json::animation::Interpolation::Linear => Interpolation::Linear,
                    json::animation::Interpolation::Step => Interpolation::Step,
                    json::animation::Interpolation::CubicSpline => Interpolation::CubicSpline,
                },
            });
        }
        for channel in &anim.channels {
            imported.channels.push(AnimationChannel {
                sampler: channel.sampler.value(),
                node: NodeId(channel.target.node.value()),
                path: match checked(&channel.target.path, "target path")? {
                    json::animation::Property::Translation => TargetPath::Translation,
                    json::animation::Property::Rotation => TargetPath::Rotation,
                    json::animation::Property::Scale => TargetPath::Scale,
                    json::animation::Property::MorphTargetWeights => {
                        TargetPath::MorphTargetWeights
                    }
                },
            });
        }
        doc.animations.push(imported);
    }

    doc.cameras = root.cameras.clone();

    if doc
        .iter_textures()
        .any(|(_, tex)| tex.mime == "image/ktx2")
    {
        doc.mark_extension_used(EXT_BASISU, true);
    }
    let quantized = doc.iter_meshes().any(|(_, mesh)| {
        mesh.primitives.iter().any(|prim| {
            prim.attributes.iter().any(|(sem, id)| {
                doc.accessor(*id)
                    .map(|acc| needs_quantization_extension(sem, acc))
                    .unwrap_or(false)
            })
        })
    });
    if quantized {
        doc.mark_extension_used(EXT_QUANTIZATION, true);
    }

    Ok(doc)
}

// ------------------------------------------------------------------
// Serialization
// ------------------------------------------------------------------

struct BufferPacker {
    data: Vec<u8>,
    views: Vec<json::buffer::View>,
}

impl BufferPacker {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            views: Vec::new(),
        }
    }

    /// Append bytes as a new 4-byte-aligned buffer view, returning its index.
    fn push_view(&mut self, bytes: &[u8], name: Option<String>) -> u32 {
        let padding = (4 - (self.data.len() % 4)) % 4;
        self.data.extend(std::iter::repeat(0u8).take(padding));
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(bytes);

        let index = self.views.len() as u32;
        self.views.push(json::buffer::View {
            buffer: json::Index::new(0),
            byte_offset: Some(USize64::from(offset)),
            byte_length: USize64::from(bytes.len() as u64),
            byte_stride: None,
            target: None,
            extensions: None,
            extras: Default::default(),
            name,
        });
        index
    }
}

fn component_to_json(ct: ComponentType) -> json::accessor::ComponentType {
    match ct {
        ComponentType::I8 => json::accessor::ComponentType::I8,
        ComponentType::U8 => json::accessor::ComponentType::U8,
        ComponentType::I16 => json::accessor::ComponentType::I16,
        ComponentType::U16 => json::accessor::ComponentType::U16,
        ComponentType::U32 => json::accessor::ComponentType::U32,
        ComponentType::F32 => json::accessor::ComponentType::F32,
    }
}

fn element_to_json(t: ElementType) -> json::accessor::Type {
    match t {
        ElementType::Scalar => json::accessor::Type::Scalar,
        ElementType::Vec2 => json::accessor::Type::Vec2,
        ElementType::Vec3 => json::accessor::Type::Vec3,
        ElementType::Vec4 => json::accessor::Type::Vec4,
        ElementType::Mat2 => json::accessor::Type::Mat2,
        ElementType::Mat3 => json::accessor::Type::Mat3,
        ElementType::Mat4 => json::accessor::Type::Mat4,
    }
}

fn attribute_bytes(data: &AttributeData) -> Vec<u8> {
    match data {
        AttributeData::I8(v) => cast_slice(v).to_vec(),
        AttributeData::U8(v) => v.clone(),
        AttributeData::I16(v) => cast_slice(v).to_vec(),
        AttributeData::U16(v) => cast_slice(v).to_vec(),
        AttributeData::U32(v) => cast_slice(v).to_vec(),
        AttributeData::F32(v) => cast_slice(v).to_vec(),
    }
}

/// Per-component min/max over the stored (possibly quantized) values.
fn component_bounds(acc: &Accessor) -> Option<(Vec<f64>, Vec<f64>)> {
    let components = acc.element.components();
    let count = acc.count();
    if count == 0 {
        return None;
    }
    let fetch = |i: usize| -> f64 {
        match &acc.data {
            AttributeData::I8(v) => v[i] as f64,
            AttributeData::U8(v) => v[i] as f64,
            AttributeData::I16(v) => v[i] as f64,
            AttributeData::U16(v) => v[i] as f64,
            AttributeData::U32(v) => v[i] as f64,
            AttributeData::F32(v) => v[i] as f64,
        }
    };
    let mut min = vec![f64::MAX; components];
    let mut max = vec![f64::MIN; components];
    for i in 0..count {
        for c in 0..components {
            let v = fetch(i * components + c);
            min[c] = min[c].min(v);
            max[c] = max[c].max(v);
        }
    }
    Some((min, max))
}

fn info_from_binding(
    binding: &TextureBinding,
    texture_map: &HashMap<TextureId, u32>,
) -> Option<json::texture::Info> {
    texture_map.get(&binding.texture).map(|&idx| {
        json::texture::Info {
            index: json::Index::new(idx),
            tex_coord: binding.tex_coord,
            extensions: None,
            extras: Default::default(),
        }
    })
}

fn export_material(
    material: &Material,
    texture_map: &HashMap<TextureId, u32>,
) -> json::Material {
    json::Material {
        name: material.name.clone(),
        alpha_cutoff: material.alpha_cutoff.map(json::material::AlphaCutoff),
        alpha_mode: Checked::Valid(match material.alpha_mode {
            AlphaMode::Opaque => json::material::AlphaMode::Opaque,
            AlphaMode::Mask => json::material::AlphaMode::Mask,
            AlphaMode::Blend => json::material::AlphaMode::Blend,
        }),
        double_sided: material.double_sided,
        pbr_metallic_roughness: json::material::PbrMetallicRoughness {
            base_color_factor: json::material::PbrBaseColorFactor(material.base_color_factor),
            base_color_texture: material
                .base_color
                .as_ref()
                .and_then(|b| info_from_binding(b, texture_map)),
            metallic_factor: json::material::StrengthFactor(material.metallic_factor),
            roughness_factor: json::material::StrengthFactor(material.roughness_factor),
            metallic_roughness_texture: material
                .metallic_roughness
                .as_ref()
                .and_then(|b| info_from_binding(b, texture_map)),
            extensions: None,
            extras: Default::default(),
        },
        normal_texture: material.normal.as_ref().and_then(|b| {
            texture_map
                .get(&b.texture)
                .map(|&idx| json::material::NormalTexture {
                    index: json::Index::new(idx),
                    scale: material.normal_scale,
                    tex_coord: b.tex_coord,
                    extensions: None,
                    extras: Default::default(),
                })
        }),
        occlusion_texture: material.occlusion.as_ref().and_then(|b| {
            texture_map
                .get(&b.texture)
                .map(|&idx| json::material::OcclusionTexture {
                    index: json::Index::new(idx),
                    strength: json::material::StrengthFactor(material.occlusion_strength),
                    tex_coord: b.tex_coord,
                    extensions: None,
                    extras: Default::default(),
                })
        }),
        emissive_texture: material
            .emissive
            .as_ref()
            .and_then(|b| info_from_binding(b, texture_map)),
        emissive_factor: json::material::EmissiveFactor(material.emissive_factor),
        extensions: None,
        extras: Default::default(),
    }
}

/// True when the accessor's storage type needs KHR_mesh_quantization for the
/// given attribute semantic.
fn needs_quantization_extension(sem: &Semantic, acc: &Accessor) -> bool {
    match sem {
        Semantic::Position | Semantic::Normal | Semantic::Tangent => {
            acc.component() != ComponentType::F32
        }
        Semantic::TexCoord(_) => !matches!(
            acc.component(),
            ComponentType::F32 | ComponentType::U8 | ComponentType::U16
        ),
        _ => false,
    }
}

/// Serialize the document to GLB bytes. Draco-flagged primitives are encoded
/// here, through the process-wide encoder.
pub fn to_glb_bytes(doc: &mut Document) -> Result<Vec<u8>> {
    // Accessors referenced only through draco-compressed primitives carry no
    // buffer view; everything else gets packed.
    let mut draco_only: HashSet<AccessorId> = HashSet::new();
    let mut plain_refs: HashSet<AccessorId> = HashSet::new();
    for (_, mesh) in doc.iter_meshes() {
        for prim in &mesh.primitives {
            let target = if prim.draco.is_some() {
                &mut draco_only
            } else {
                &mut plain_refs
            };
            for id in prim.attributes.values() {
                target.insert(*id);
            }
            if let Some(id) = prim.indices {
                target.insert(id);
            }
        }
    }
    for skin in &doc.skins {
        if let Some(id) = skin.inverse_bind_matrices {
            plain_refs.insert(id);
        }
    }
    for anim in &doc.animations {
        for sampler in &anim.samplers {
            plain_refs.insert(sampler.input);
            plain_refs.insert(sampler.output);
        }
    }
    draco_only.retain(|id| !plain_refs.contains(id));

    let mut packer = BufferPacker::new();
    let mut accessors: Vec<json::Accessor> = Vec::new();
    let mut accessor_map: HashMap<AccessorId, u32> = HashMap::new();

    let mut quantization_used = false;
    for (_, mesh) in doc.iter_meshes() {
        for prim in &mesh.primitives {
            for (sem, id) in &prim.attributes {
                if let Some(acc) = doc.accessor(*id) {
                    if needs_quantization_extension(sem, acc) {
                        quantization_used = true;
                    }
                }
            }
        }
    }

    for (id, acc) in doc.iter_accessors() {
        let view = if draco_only.contains(&id) {
            None
        } else {
            let bytes = attribute_bytes(&acc.data);
            Some(json::Index::new(
                packer.push_view(&bytes, acc.name.clone()),
            ))
        };

        // POSITION bounds are mandatory; recompute them from current data.
        let (min, max) = match (acc.min.clone(), acc.max.clone()) {
            (Some(min), Some(max)) => (Some(min), Some(max)),
            _ => component_bounds(acc)
                .map(|(min, max)| (Some(min), Some(max)))
                .unwrap_or((None, None)),
        };

        let index = accessors.len() as u32;
        accessors.push(json::Accessor {
            buffer_view: view,
            byte_offset: None,
            component_type: Checked::Valid(json::accessor::GenericComponentType(
                component_to_json(acc.component()),
            )),
            count: USize64::from(acc.count() as u64),
            type_: Checked::Valid(element_to_json(acc.element)),
            min: min.map(|v| serde_json::json!(v)),
            max: max.map(|v| serde_json::json!(v)),
            normalized: acc.normalized,
            sparse: None,
            extensions: None,
            extras: Default::default(),
            name: acc.name.clone(),
        });
        accessor_map.insert(id, index);
    }

    // Textures: one image per texture, samplers deduplicated by identity of
    // their serialized form.
    let mut images: Vec<json::Image> = Vec::new();
    let mut samplers: Vec<json::texture::Sampler> = Vec::new();
    let mut textures: Vec<json::Texture> = Vec::new();
    let mut texture_map: HashMap<TextureId, u32> = HashMap::new();
    let mut basisu_used = false;

    for (id, tex) in doc.iter_textures() {
        if tex.mime == "image/ktx2" {
            basisu_used = true;
        }
        let view_index = packer.push_view(&tex.bytes, tex.name.clone());
        let image_index = images.len() as u32;
        images.push(json::Image {
            buffer_view: Some(json::Index::new(view_index)),
            mime_type: Some(json::image::MimeType(tex.mime.clone())),
            name: tex.name.clone(),
            uri: None,
            extensions: None,
            extras: Default::default(),
        });
        let sampler_index = tex.sampler.as_ref().map(|sampler| {
            let serialized = serde_json::to_string(sampler).unwrap_or_default();
            let existing = samplers
                .iter()
                .position(|s| serde_json::to_string(s).unwrap_or_default() == serialized);
            match existing {
                Some(i) => i as u32,
                None => {
                    samplers.push(sampler.clone());
                    (samplers.len() - 1) as u32
                }
            }
        });
        let texture_index = textures.len() as u32;
        textures.push(json::Texture {
            name: tex.name.clone(),
            sampler: sampler_index.map(json::Index::new),
            source: json::Index::new(image_index),
            extensions: None,
            extras: Default::default(),
        });
        texture_map.insert(id, texture_index);
    }

    let mut materials: Vec<json::Material> = Vec::new();
    let mut material_map: HashMap<MaterialId, u32> = HashMap::new();
    for (id, material) in doc.iter_materials() {
        material_map.insert(id, materials.len() as u32);
        materials.push(export_material(material, &texture_map));
    }

    // Meshes, with deferred draco encoding per flagged primitive.
    let mut draco_used = false;
    let mut meshes: Vec<json::Mesh> = Vec::new();
    let mut mesh_map: HashMap<MeshId, u32> = HashMap::new();
    for (id, mesh) in doc.iter_meshes() {
        let mut primitives = Vec::with_capacity(mesh.primitives.len());
        for prim in &mesh.primitives {
            let mut attributes = BTreeMap::new();
            for (sem, acc_id) in &prim.attributes {
                if let Some(&index) = accessor_map.get(acc_id) {
                    attributes.insert(
                        Checked::Valid(semantic_to_json(sem)),
                        json::Index::new(index),
                    );
                }
            }

            let extensions = match &prim.draco {
                Some(settings) => {
                    draco_used = true;
                    let encoded = crate::draco::encoder()
                        .encode_primitive(doc, prim, settings)
                        .map_err(|e| OptimizeError::WriteFailed(e.to_string()))?;
                    let view_index = packer.push_view(&encoded.bytes, None);
                    let mut draco_attributes = serde_json::Map::new();
                    for (sem, draco_id) in &encoded.attribute_order {
                        draco_attributes
                            .insert(sem.label(), serde_json::json!(draco_id));
                    }
                    let mut others = serde_json::Map::new();
                    others.insert(
                        EXT_DRACO.to_string(),
                        serde_json::json!({
                            "bufferView": view_index,
                            "attributes": draco_attributes,
                        }),
                    );
                    Some(json::extensions::mesh::Primitive { others })
                }
                None => None,
            };

            primitives.push(json::mesh::Primitive {
                attributes,
                indices: prim
                    .indices
                    .and_then(|i| accessor_map.get(&i))
                    .map(|&i| json::Index::new(i)),
                material: prim
                    .material
                    .and_then(|m| material_map.get(&m))
                    .map(|&m| json::Index::new(m)),
                mode: Checked::Valid(mode_to_json(prim.mode)),
                targets: if prim.targets.is_empty() {
                    None
                } else {
                    Some(
                        prim.targets
                            .iter()
                            .map(|t| json::mesh::MorphTarget {
                                positions: t
                                    .position
                                    .and_then(|i| accessor_map.get(&i))
                                    .map(|&i| json::Index::new(i)),
                                normals: t
                                    .normal
                                    .and_then(|i| accessor_map.get(&i))
                                    .map(|&i| json::Index::new(i)),
                                tangents: t
                                    .tangent
                                    .and_then(|i| accessor_map.get(&i))
                                    .map(|&i| json::Index::new(i)),
                            })
                            .collect(),
                    )
                },
                extensions,
                extras: Default::default(),
            });
        }
        mesh_map.insert(id, meshes.len() as u32);
        meshes.push(json::Mesh {
            name: mesh.name.clone(),
            primitives,
            weights: None,
            extensions: None,
            extras: Default::default(),
        });
    }

    let mut nodes: Vec<json::Node> = Vec::new();
    let mut node_map: HashMap<NodeId, u32> = HashMap::new();
    for (id, _) in doc.iter_nodes() {
        node_map.insert(id, nodes.len() as u32);
        nodes.push(json::Node {
            camera: None,
            children: None,
            matrix: None,
            mesh: None,
            rotation: None,
            scale: None,
            translation: None,
            skin: None,
            weights: None,
            name: None,
            extensions: None,
            extras: Default::default(),
        });
    }
    for (id, node) in doc.iter_nodes() {
        let children: Vec<json::Index<json::Node>> = node
            .children
            .iter()
            .filter_map(|c| node_map.get(c))
            .map(|&c| json::Index::new(c))
            .collect();
        let exported = &mut nodes[node_map[&id] as usize];
        exported.name = node.name.clone();
        exported.camera = node.camera.map(|c| json::Index::new(c as u32));
        exported.skin = node.skin.map(|s| json::Index::new(s as u32));
        exported.mesh = node
            .mesh
            .and_then(|m| mesh_map.get(&m))
            .map(|&m| json::Index::new(m));
        exported.children = if children.is_empty() {
            None
        } else {
            Some(children)
        };
        if let Some(matrix) = node.matrix {
            exported.matrix = Some(matrix.to_cols_array());
        } else {
            if node.translation != Vec3::ZERO {
                exported.translation = Some(node.translation.to_array());
            }
            if node.rotation != Quat::IDENTITY {
                exported.rotation =
                    Some(json::scene::UnitQuaternion(node.rotation.to_array()));
            }
            if node.scale != Vec3::ONE {
                exported.scale = Some(node.scale.to_array());
            }
        }
    }

    let scenes: Vec<json::Scene> = doc
        .scenes
        .iter()
        .map(|scene| json::Scene {
            name: scene.name.clone(),
            nodes: scene
                .nodes
                .iter()
                .filter_map(|n| node_map.get(n))
                .map(|&n| json::Index::new(n))
                .collect(),
            extensions: None,
            extras: Default::default(),
        })
        .collect();

    let skins: Vec<json::Skin> = doc
        .skins
        .iter()
        .map(|skin| json::Skin {
            name: skin.name.clone(),
            inverse_bind_matrices: skin
                .inverse_bind_matrices
                .and_then(|i| accessor_map.get(&i))
                .map(|&i| json::Index::new(i)),
            joints: skin
                .joints
                .iter()
                .filter_map(|j| node_map.get(j))
                .map(|&j| json::Index::new(j))
                .collect(),
            skeleton: skin
                .skeleton
                .and_then(|s| node_map.get(&s))
                .map(|&s| json::Index::new(s)),
            extensions: None,
            extras: Default::default(),
        })
        .collect();

    let animations: Vec<json::Animation> = doc
        .animations
        .iter()
        .map(|anim| {
            let channels = anim
                .channels
                .iter()
                .filter_map(|channel| {
                    let node = node_map.get(&channel.node)?;
                    Some(json::animation::Channel {
                        sampler: json::Index::new(channel.sampler as u32),
                        target: json::animation::Target {
                            node: json::Index::new(*node),
                            path: Checked::Valid(match channel.path {
                                TargetPath::Translation => json::animation::Property::Translation,
                                TargetPath::Rotation => json::animation::Property::Rotation,
                                TargetPath::Scale => json::animation::Property::Scale,
                                TargetPath::MorphTargetWeights => {
                                    json::animation::Property::MorphTargetWeights
                                }
                            }),
                            extensions: None,
                            extras: Default::default(),
                        },
                        extensions: None,
                        extras: Default::default(),
                    })
                })
                .collect();
            let samplers = anim
                .samplers
                .iter()
                .filter_map(|sampler| {
                    let input = accessor_map.get(&sampler.input)?;
                    let output = accessor_map.get(&sampler.output)?;
                    Some(json::animation::Sampler {
                        input: json::Index::new(*input),
                        output: json::Index::new(*output),
                        interpolation: Checked::Valid(match sampler.interpolation {
                            Interpolation::Linear => json::animation::Interpolation::Linear,
                            Interpolation::Step => json::animation::Interpolation::Step,
                            Interpolation::CubicSpline => {
                                json::animation::Interpolation::CubicSpline
                            }
                        }),
                        extensions: None,
                        extras: Default::default(),
                    })
                })
                .collect();
            json::Animation {
                name: anim.name.clone(),
                channels,
                samplers,
                extensions: None,
                extras: Default::default(),
            }
        })
        .collect();

    // Record derived extension usage on the document so it survives the run.
    if basisu_used {
        doc.mark_extension_used(EXT_BASISU, true);
    }
    if draco_used {
        doc.mark_extension_used(EXT_DRACO, true);
    }
    if quantization_used {
        doc.mark_extension_used(EXT_QUANTIZATION, true);
    }

    if !meshes.is_empty() && doc.iter_nodes().all(|(_, n)| n.mesh.is_none()) {
        warn!(
            "serializing {} meshes with no referencing nodes",
            meshes.len()
        );
    }

    let root = json::Root {
        accessors,
        buffers: vec![json::Buffer {
            byte_length: USize64::from(packer.data.len() as u64),
            uri: None,
            extensions: None,
            extras: Default::default(),
            name: None,
        }],
        buffer_views: packer.views,
        meshes,
        materials,
        textures,
        images,
        samplers,
        nodes,
        scenes,
        scene: doc.default_scene.map(|s| json::Index::new(s as u32)),
        skins,
        animations,
        cameras: doc.cameras.clone(),
        extensions_used: doc.extensions_used().cloned().collect(),
        extensions_required: doc.extensions_required().cloned().collect(),
        asset: json::Asset {
            version: "2.0".into(),
            generator: Some(
                doc.generator
                    .clone()
                    .unwrap_or_else(|| "meshpress".into()),
            ),
            copyright: doc.copyright.clone(),
            min_version: None,
            extensions: None,
            extras: Default::default(),
        },
        extensions: None,
        extras: Default::default(),
    };

    let json_string =
        serde_json::to_string(&root).map_err(|e| OptimizeError::WriteFailed(e.to_string()))?;
    let json_bytes = json_string.as_bytes();

    // Pad JSON with spaces and BIN with zeros to 4-byte alignment.
    let json_padding = (4 - (json_bytes.len() % 4)) % 4;
    let json_length = json_bytes.len() + json_padding;
    let bin_padding = (4 - (packer.data.len() % 4)) % 4;
    let bin_length = packer.data.len() + bin_padding;

    let total_length = 12 + 8 + json_length + 8 + bin_length;
    let mut output = Vec::with_capacity(total_length);

    output.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    output.extend_from_slice(&GLB_VERSION.to_le_bytes());
    output.extend_from_slice(&(total_length as u32).to_le_bytes());

    output.extend_from_slice(&(json_length as u32).to_le_bytes());
    output.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    output.extend_from_slice(json_bytes);
    output.extend(std::iter::repeat(0x20u8).take(json_padding));

    output.extend_from_slice(&(bin_length as u32).to_le_bytes());
    output.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    output.extend_from_slice(&packer.data);
    output.extend(std::iter::repeat(0u8).take(bin_padding));

    Ok(output)
}
