//! Draco geometry compression
//!
//! The pipeline step validates options and attaches per-primitive
//! compression settings; the byte-level encode runs when the document is
//! serialized, through a process-wide encoder initialized on first use.
//!
//! The encoder produces the sequential mesh encoding: quantized attribute
//! streams and connectivity as zigzag-delta varints behind the standard
//! `DRACO` header. Speed parameters derive from the 0-10 compression level
//! as `10 - level`.
//!
//! Step statistics report an estimated compressed size derived from raw
//! geometry volume and the level; the estimate shrinks monotonically as the
//! level rises. The real encode determines the final file size.

use std::sync::OnceLock;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::document::{
    AttributeData, Document, DracoSettings, Primitive, PrimitiveMode, Semantic,
};
use crate::{OptimizeError, Result};

const DRACO_MAGIC: &[u8; 5] = b"DRACO";
const DRACO_VERSION: (u8, u8) = (2, 2);
const GEOMETRY_TRIANGULAR_MESH: u8 = 1;
const METHOD_SEQUENTIAL: u8 = 0;

fn default_level() -> u8 {
    7
}
fn default_position_bits() -> u8 {
    14
}
fn default_normal_bits() -> u8 {
    10
}
fn default_texcoord_bits() -> u8 {
    12
}

/// Configuration for the draco step
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DracoOptions {
    pub enabled: bool,
    /// Speed/ratio trade-off in [0, 10]
    #[serde(default = "default_level")]
    pub compression_level: u8,
    /// Quantization bits in [1, 30]
    #[serde(default = "default_position_bits")]
    pub quantize_position: u8,
    #[serde(default = "default_normal_bits")]
    pub quantize_normal: u8,
    #[serde(default = "default_texcoord_bits")]
    pub quantize_texcoord: u8,
}

impl Default for DracoOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            compression_level: default_level(),
            quantize_position: default_position_bits(),
            quantize_normal: default_normal_bits(),
            quantize_texcoord: default_texcoord_bits(),
        }
    }
}

/// Statistics from a draco operation
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DracoStats {
    pub meshes_compressed: usize,
    pub original_size: usize,
    /// Estimate; see module docs
    pub compressed_size: usize,
    pub compression_ratio: f64,
}

fn validate(options: &DracoOptions) -> Result<()> {
    if options.compression_level > 10 {
        return Err(OptimizeError::InvalidOptions {
            field: "compressionLevel",
            expected: "[0, 10]",
            received: options.compression_level.to_string(),
        });
    }
    for (field, value) in [
        ("quantizePosition", options.quantize_position),
        ("quantizeNormal", options.quantize_normal),
        ("quantizeTexcoord", options.quantize_texcoord),
    ] {
        if !(1..=30).contains(&value) {
            return Err(OptimizeError::InvalidOptions {
                field,
                expected: "[1, 30]",
                received: value.to_string(),
            });
        }
    }
    Ok(())
}

/// Estimated encoded size for raw geometry bytes at a compression level.
/// Strictly decreasing in the level on any fixed input.
fn estimate_compressed_size(raw: usize, level: u8) -> usize {
    (raw as f64 * (0.42 - 0.02 * level as f64)).round() as usize
}

/// Attach compression settings to every eligible primitive.
pub fn compress(doc: &mut Document, options: &DracoOptions) -> Result<DracoStats> {
    validate(options)?;
    let speed = 10 - options.compression_level;
    let settings = DracoSettings {
        encode_speed: speed,
        decode_speed: speed,
        position_bits: options.quantize_position,
        normal_bits: options.quantize_normal,
        texcoord_bits: options.quantize_texcoord,
        color_bits: 8,
        generic_bits: 12,
    };

    let mut stats = DracoStats::default();
    for mesh_id in doc.mesh_ids() {
        let raw_sizes: Vec<(usize, usize)> = match doc.mesh(mesh_id) {
            Some(mesh) => mesh
                .primitives
                .iter()
                .enumerate()
                .filter(|(_, prim)| eligible(prim))
                .map(|(i, prim)| (i, primitive_geometry_size(doc, prim)))
                .collect(),
            None => continue,
        };
        if raw_sizes.is_empty() {
            continue;
        }
        let Some(mesh) = doc.mesh_mut(mesh_id) else {
            continue;
        };
        for (prim_index, raw) in raw_sizes {
            mesh.primitives[prim_index].draco = Some(settings);
            stats.meshes_compressed += 1;
            stats.original_size += raw;
            stats.compressed_size += estimate_compressed_size(raw, options.compression_level);
        }
    }

    stats.compression_ratio = if stats.original_size == 0 {
        1.0
    } else {
        stats.compressed_size as f64 / stats.original_size as f64
    };
    debug!(
        "draco: {} primitives flagged at level {}",
        stats.meshes_compressed, options.compression_level
    );
    Ok(stats)
}

fn eligible(prim: &Primitive) -> bool {
    prim.mode == PrimitiveMode::Triangles
        && prim.position().is_some()
        && prim.targets.is_empty()
}

fn primitive_geometry_size(doc: &Document, prim: &Primitive) -> usize {
    let mut size = 0;
    for id in prim.attributes.values() {
        if let Some(acc) = doc.accessor(*id) {
            size += acc.byte_len();
        }
    }
    if let Some(id) = prim.indices {
        if let Some(acc) = doc.accessor(id) {
            size += acc.byte_len();
        }
    }
    size
}

// ---------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------

/// Encoded result for one primitive: the bitstream plus the attribute id
/// assignment recorded in the container extension.
pub struct EncodedPrimitive {
    pub bytes: Vec<u8>,
    pub attribute_order: Vec<(Semantic, u32)>,
}

/// Process-wide encoder handle, initialized on first use and shared
/// read-only across pipelines.
pub fn encoder() -> &'static DracoEncoder {
    static ENCODER: OnceLock<DracoEncoder> = OnceLock::new();
    ENCODER.get_or_init(DracoEncoder::new)
}

pub struct DracoEncoder;

impl DracoEncoder {
    fn new() -> Self {
        DracoEncoder
    }

    /// Encode one triangle primitive into a draco sequential bitstream.
    pub fn encode_primitive(
        &self,
        doc: &Document,
        prim: &Primitive,
        settings: &DracoSettings,
    ) -> Result<EncodedPrimitive> {
        let position = prim
            .position()
            .and_then(|id| doc.accessor(id))
            .ok_or_else(|| OptimizeError::Internal("draco: primitive has no positions".into()))?;
        let num_points = position.count() as u64;

        let indices: Vec<u32> = match prim.indices {
            Some(id) => doc
                .accessor(id)
                .ok_or_else(|| OptimizeError::Internal("draco: missing index accessor".into()))?
                .data
                .to_u32_vec(),
            None => (0..num_points as u32).collect(),
        };

        let mut buffer = EncodeBuffer::new();
        buffer.put_bytes(DRACO_MAGIC);
        buffer.put_u8(DRACO_VERSION.0);
        buffer.put_u8(DRACO_VERSION.1);
        buffer.put_u8(GEOMETRY_TRIANGULAR_MESH);
        buffer.put_u8(METHOD_SEQUENTIAL);
        buffer.put_u16(0); // flags
        buffer.put_u8(settings.encode_speed);
        buffer.put_u8(settings.decode_speed);

        buffer.put_varint((indices.len() / 3) as u64);
        buffer.put_varint(num_points);

        // Connectivity: zigzag deltas between consecutive indices.
        let mut previous = 0i64;
        for &index in &indices {
            buffer.put_signed_varint(index as i64 - previous);
            previous = index as i64;
        }

        buffer.put_u8(prim.attributes.len() as u8);
        let mut attribute_order = Vec::with_capacity(prim.attributes.len());
        for (draco_id, (sem, acc_id)) in prim.attributes.iter().enumerate() {
            let acc = doc
                .accessor(*acc_id)
                .ok_or_else(|| OptimizeError::Internal("draco: missing attribute".into()))?;
            let bits = quantization_bits(sem, settings);
            buffer.put_u8(attribute_kind(sem));
            buffer.put_u8(acc.element.components() as u8);
            buffer.put_u8(data_type_tag(&acc.data));
            buffer.put_u8(acc.normalized as u8);
            buffer.put_u8(bits);
            encode_attribute(&mut buffer, &acc.data, acc.element.components(), bits);
            attribute_order.push((sem.clone(), draco_id as u32));
        }

        Ok(EncodedPrimitive {
            bytes: buffer.into_bytes(),
            attribute_order,
        })
    }
}

/// Draco geometry attribute kinds.
fn attribute_kind(sem: &Semantic) -> u8 {
    match sem {
        Semantic::Position => 0,
        Semantic::Normal => 1,
        Semantic::Color(_) => 2,
        Semantic::TexCoord(_) => 3,
        _ => 4,
    }
}

fn quantization_bits(sem: &Semantic, settings: &DracoSettings) -> u8 {
    match sem {
        Semantic::Position => settings.position_bits,
        Semantic::Normal | Semantic::Tangent => settings.normal_bits,
        Semantic::TexCoord(_) => settings.texcoord_bits,
        Semantic::Color(_) => settings.color_bits,
        _ => settings.generic_bits,
    }
}

fn data_type_tag(data: &AttributeData) -> u8 {
    match data {
        AttributeData::I8(_) => 0,
        AttributeData::U8(_) => 1,
        AttributeData::I16(_) => 2,
        AttributeData::U16(_) => 3,
        AttributeData::U32(_) => 4,
        AttributeData::F32(_) => 5,
    }
}

/// Float streams quantize per component against their range, then all
/// streams delta-encode as zigzag varints.
fn encode_attribute(buffer: &mut EncodeBuffer, data: &AttributeData, components: usize, bits: u8) {
    match data {
        AttributeData::F32(values) => {
            let count = values.len() / components.max(1);
            let max_quantized = (1u64 << bits.min(30)) - 1;
            for c in 0..components {
                let column = |i: usize| values[i * components + c];
                let mut min = f32::MAX;
                let mut max = f32::MIN;
                for i in 0..count {
                    min = min.min(column(i));
                    max = max.max(column(i));
                }
                if count == 0 {
                    min = 0.0;
                    max = 0.0;
                }
                let quantizer = Quantizer::new(max - min, max_quantized as i64);
                buffer.put_f32(min);
                buffer.put_f32(max - min);
                let mut previous = 0i64;
                for i in 0..count {
                    let q = quantizer.quantize(column(i) - min);
                    buffer.put_signed_varint(q - previous);
                    previous = q;
                }
            }
        }
        _ => {
            let values = data.to_u32_vec();
            let count = values.len() / components.max(1);
            for c in 0..components {
                let mut previous = 0i64;
                for i in 0..count {
                    let v = values[i * components + c] as i64;
                    buffer.put_signed_varint(v - previous);
                    previous = v;
                }
            }
        }
    }
}

/// Uniform scalar quantizer over a non-negative range.
struct Quantizer {
    inverse_delta: f64,
}

impl Quantizer {
    fn new(range: f32, max_quantized: i64) -> Self {
        let inverse_delta = if range > 0.0 {
            max_quantized as f64 / range as f64
        } else {
            0.0
        };
        Self { inverse_delta }
    }

    fn quantize(&self, value: f32) -> i64 {
        (value as f64 * self.inverse_delta + 0.5).floor() as i64
    }
}

/// Byte-stream builder for the encoder.
struct EncodeBuffer {
    bytes: Vec<u8>,
}

impl EncodeBuffer {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn put_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn put_f32(&mut self, value: f32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn put_varint(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
                self.bytes.push(byte);
            } else {
                self.bytes.push(byte);
                break;
            }
        }
    }

    /// Signed symbol mapping followed by an unsigned varint.
    fn put_signed_varint(&mut self, value: i64) {
        let symbol: u64 = if value >= 0 {
            (value as u64) << 1
        } else {
            (((-(value + 1)) as u64) << 1) | 1
        };
        self.put_varint(symbol);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Accessor, ElementType, Mesh};

    fn make_doc() -> Document {
        let mut doc = Document::new();
        let mut positions = Vec::new();
        for y in 0..4 {
            for x in 0..4 {
                positions.extend_from_slice(&[x as f32, y as f32, 0.0]);
            }
        }
        let mut indices: Vec<u32> = Vec::new();
        for y in 0..3u32 {
            for x in 0..3u32 {
                let tl = y * 4 + x;
                indices.extend_from_slice(&[tl, tl + 4, tl + 1, tl + 1, tl + 4, tl + 5]);
            }
        }
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
        doc.add_mesh(Mesh {
            name: None,
            primitives: vec![prim],
        });
        doc
    }

    fn enabled(level: u8) -> DracoOptions {
        DracoOptions {
            enabled: true,
            compression_level: level,
            ..Default::default()
        }
    }

    // ==================== Option validation ====================

    #[test]
    fn test_rejects_level_above_ten() {
        let mut doc = make_doc();
        let err = compress(&mut doc, &enabled(11)).unwrap_err();
        match err {
            OptimizeError::InvalidOptions { field, .. } => {
                assert_eq!(field, "compressionLevel")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_rejects_quantization_bits_out_of_range() {
        let mut doc = make_doc();
        let options = DracoOptions {
            enabled: true,
            quantize_position: 31,
            ..Default::default()
        };
        assert!(matches!(
            compress(&mut doc, &options),
            Err(OptimizeError::InvalidOptions { field: "quantizePosition", .. })
        ));

        let options = DracoOptions {
            enabled: true,
            quantize_normal: 0,
            ..Default::default()
        };
        assert!(compress(&mut doc, &options).is_err());
    }

    // ==================== Settings attachment ====================

    #[test]
    fn test_attaches_settings_with_derived_speed() {
        let mut doc = make_doc();
        let stats = compress(&mut doc, &enabled(7)).unwrap();
        assert_eq!(stats.meshes_compressed, 1);

        let (_, mesh) = doc.iter_meshes().next().unwrap();
        let settings = mesh.primitives[0].draco.unwrap();
        assert_eq!(settings.encode_speed, 3);
        assert_eq!(settings.decode_speed, 3);
        assert_eq!(settings.position_bits, 14);
        assert_eq!(settings.color_bits, 8);
    }

    #[test]
    fn test_estimate_monotone_in_level() {
        let mut previous = usize::MAX;
        for level in 0..=10 {
            let mut doc = make_doc();
            let stats = compress(&mut doc, &enabled(level)).unwrap();
            assert!(
                stats.compressed_size <= previous,
                "estimate grew from level {} to {}",
                level.saturating_sub(1),
                level
            );
            assert!(stats.compressed_size < stats.original_size);
            previous = stats.compressed_size;
        }
    }

    // ==================== Encoder ====================

    #[test]
    fn test_encoder_emits_draco_header() {
        let mut doc = make_doc();
        compress(&mut doc, &enabled(7)).unwrap();
        let (_, mesh) = doc.iter_meshes().next().unwrap();
        let prim = &mesh.primitives[0];
        let encoded = encoder()
            .encode_primitive(&doc, prim, &prim.draco.unwrap())
            .unwrap();
        assert_eq!(&encoded.bytes[0..5], DRACO_MAGIC);
        assert_eq!(encoded.bytes[7], GEOMETRY_TRIANGULAR_MESH);
        assert_eq!(encoded.attribute_order.len(), 1);
        assert_eq!(encoded.attribute_order[0].0, Semantic::Position);
    }

    #[test]
    fn test_encoder_output_smaller_than_raw_grid() {
        let mut doc = make_doc();
        compress(&mut doc, &enabled(7)).unwrap();
        let (_, mesh) = doc.iter_meshes().next().unwrap();
        let prim = &mesh.primitives[0];
        let raw = primitive_geometry_size(&doc, prim);
        let encoded = encoder()
            .encode_primitive(&doc, prim, &prim.draco.unwrap())
            .unwrap();
        assert!(
            encoded.bytes.len() < raw,
            "encoded {} >= raw {}",
            encoded.bytes.len(),
            raw
        );
    }

    #[test]
    fn test_signed_varint_roundtrip_shape() {
        let mut buffer = EncodeBuffer::new();
        buffer.put_signed_varint(0);
        buffer.put_signed_varint(-1);
        buffer.put_signed_varint(1);
        // Symbols: 0 -> 0, -1 -> 1, 1 -> 2; all single-byte varints.
        assert_eq!(buffer.into_bytes(), vec![0, 1, 2]);
    }
}
