use crate::bs_read::ByteStreamReadBuffer;
use crate::bs_write::ByteStreamWriteBuffer;
use crate::node::{FloatPrecision, Node, NodeId, NodeTree};
use crate::{Error, Result, SourceDestBuffer};
use std::collections::HashSet;

/// Number of bits needed to store all integers between min and max.
pub fn bits_needed(min: i64, max: i64) -> u32 {
    let range = max.wrapping_sub(min) as u64;
    (64 - range.leading_zeros()).max(1)
}

/// Bit-pack codec of a single prototype field.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FieldCodec {
    Integer {
        min: i64,
        max: i64,
        bits: u32,
    },
    ScaledInteger {
        min: i64,
        max: i64,
        bits: u32,
        scale: f64,
        offset: f64,
    },
    Float {
        precision: FloatPrecision,
        min: f64,
        max: f64,
    },
}

impl FieldCodec {
    pub fn from_node(node: &Node) -> Result<Self> {
        match node {
            Node::Integer { min, max, .. } => Ok(FieldCodec::Integer {
                min: *min,
                max: *max,
                bits: bits_needed(*min, *max),
            }),
            Node::ScaledInteger {
                min,
                max,
                scale,
                offset,
                ..
            } => Ok(FieldCodec::ScaledInteger {
                min: *min,
                max: *max,
                bits: bits_needed(*min, *max),
                scale: *scale,
                offset: *offset,
            }),
            Node::Float {
                precision, min, max, ..
            } => Ok(FieldCodec::Float {
                precision: *precision,
                min: *min,
                max: *max,
            }),
            Node::String { .. } => {
                Error::not_implemented("String fields in compressed vectors are not supported")
            }
            other => Err(Error::BadPrototype {
                reason: format!("Prototype contains unsupported {} node", other.type_name()),
            }),
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            FieldCodec::Integer { bits, .. } | FieldCodec::ScaledInteger { bits, .. } => *bits,
            FieldCodec::Float {
                precision: FloatPrecision::Single,
                ..
            } => 32,
            FieldCodec::Float {
                precision: FloatPrecision::Double,
                ..
            } => 64,
        }
    }

    /// Takes the value at the given index from the buffer and appends it to the stream.
    pub fn encode(
        &self,
        buffer: &SourceDestBuffer,
        index: usize,
        stream: &mut ByteStreamWriteBuffer,
    ) -> Result<()> {
        match self {
            FieldCodec::Integer { min, max, bits } => {
                let value = buffer.get_integer(index)?;
                stream.push(pack_integer(value, *min, *max)?, *bits);
            }
            FieldCodec::ScaledInteger {
                min,
                max,
                bits,
                scale,
                offset,
            } => {
                let raw = buffer.get_scaled_raw(index, *scale, *offset)?;
                stream.push(pack_integer(raw, *min, *max)?, *bits);
            }
            FieldCodec::Float {
                precision,
                min,
                max,
            } => {
                let value = buffer.get_real(index)?;
                if *precision == FloatPrecision::Single
                    && value.is_finite()
                    && value.abs() > f32::MAX as f64
                {
                    Err(Error::Real64TooLarge {
                        reason: format!(
                            "Value {value} of '{}' exceeds single precision",
                            buffer.path_name()
                        ),
                    })?
                }
                if value < *min || value > *max {
                    Err(Error::ValueOutOfBounds {
                        reason: format!(
                            "Value {value} of '{}' is not inside bounds [{min}, {max}]",
                            buffer.path_name()
                        ),
                    })?
                }
                match precision {
                    FloatPrecision::Single => stream.push((value as f32).to_bits() as u64, 32),
                    FloatPrecision::Double => stream.push(value.to_bits(), 64),
                }
            }
        }
        Ok(())
    }

    /// Extracts the next value from the stream and stores it at the given buffer index.
    pub fn decode(
        &self,
        stream: &mut ByteStreamReadBuffer,
        buffer: &mut SourceDestBuffer,
        index: usize,
    ) -> Result<()> {
        let raw = stream
            .extract(self.bits())
            .ok_or_else(|| Error::Internal {
                reason: format!("Bytestream of '{}' ran out of data", buffer.path_name()),
            })?;
        match self {
            FieldCodec::Integer { min, max, .. } => {
                buffer.set_integer(index, unpack_integer(raw, *min, *max)?)
            }
            FieldCodec::ScaledInteger {
                min,
                max,
                scale,
                offset,
                ..
            } => buffer.set_scaled(index, unpack_integer(raw, *min, *max)?, *scale, *offset),
            FieldCodec::Float {
                precision: FloatPrecision::Single,
                ..
            } => buffer.set_real(index, f32::from_bits(raw as u32) as f64),
            FieldCodec::Float {
                precision: FloatPrecision::Double,
                ..
            } => buffer.set_real(index, f64::from_bits(raw)),
        }
    }
}

/// Maps a bounded integer to its unsigned distance from the minimum.
pub fn pack_integer(value: i64, min: i64, max: i64) -> Result<u64> {
    if value < min || value > max {
        Err(Error::ValueOutOfBounds {
            reason: format!("Value {value} is not inside bounds [{min}, {max}]"),
        })?
    }
    Ok(value.wrapping_sub(min) as u64)
}

/// Inverse of [`pack_integer`], rejects values outside the bounds.
pub fn unpack_integer(raw: u64, min: i64, max: i64) -> Result<i64> {
    let value = min.wrapping_add(raw as i64);
    if raw > max.wrapping_sub(min) as u64 {
        Err(Error::ValueOutOfBounds {
            reason: format!("Decoded value {value} is not inside bounds [{min}, {max}]"),
        })?
    }
    Ok(value)
}

/// Codec and buffer of one bytestream.
#[derive(Clone, Debug)]
pub(crate) struct FieldBinding {
    pub codec: FieldCodec,
    /// Index into the buffer list, none if the field is not transferred.
    pub buffer: Option<usize>,
}

/// Matches buffers against the prototype terminals, in bytestream order.
///
/// Writers need a buffer for every terminal, readers may skip fields.
pub(crate) fn bind_buffers(
    tree: &NodeTree,
    prototype: NodeId,
    buffers: &[SourceDestBuffer],
    require_all: bool,
) -> Result<Vec<FieldBinding>> {
    let terminals = tree.terminals(prototype)?;
    if terminals.is_empty() {
        Err(Error::BadPrototype {
            reason: String::from("Prototype has no fields"),
        })?
    }

    let mut paths = HashSet::new();
    for buffer in buffers {
        let path = normalize_path(buffer.path_name());
        if !paths.insert(path) {
            Err(Error::BufferDuplicatePathName {
                reason: format!("Multiple buffers for path '{}'", buffer.path_name()),
            })?
        }
        if !terminals.iter().any(|(p, _)| p == path) {
            Err(Error::PathUndefined {
                reason: format!("Prototype has no field '{}'", buffer.path_name()),
            })?
        }
    }
    if let Some(first) = buffers.first() {
        if let Some(other) = buffers.iter().find(|b| b.capacity() != first.capacity()) {
            Err(Error::BufferSizeMismatch {
                reason: format!(
                    "Buffer '{}' has capacity {}, but '{}' has {}",
                    other.path_name(),
                    other.capacity(),
                    first.path_name(),
                    first.capacity()
                ),
            })?
        }
    }

    let mut bindings = Vec::with_capacity(terminals.len());
    for (path, id) in &terminals {
        let codec = FieldCodec::from_node(tree.get(*id)?)?;
        let buffer = buffers
            .iter()
            .position(|b| normalize_path(b.path_name()) == path);
        if buffer.is_none() && require_all {
            Err(Error::NoBufferForElement {
                reason: format!("No buffer supplied for field '{path}'"),
            })?
        }
        bindings.push(FieldBinding { codec, buffer });
    }
    Ok(bindings)
}

fn normalize_path(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferData;
    use proptest::prelude::*;

    #[test]
    fn bit_widths() {
        assert_eq!(bits_needed(0, 0), 1);
        assert_eq!(bits_needed(0, 1), 1);
        assert_eq!(bits_needed(0, 2), 2);
        assert_eq!(bits_needed(0, 1023), 10);
        assert_eq!(bits_needed(0, 1024), 11);
        assert_eq!(bits_needed(-128, 127), 8);
        assert_eq!(bits_needed(i64::MIN, i64::MAX), 64);
    }

    #[test]
    fn integer_bounds() {
        assert_eq!(pack_integer(5, 5, 10).unwrap(), 0);
        assert_eq!(pack_integer(i64::MAX, i64::MIN, i64::MAX).unwrap(), u64::MAX);
        assert!(matches!(
            pack_integer(11, 5, 10).unwrap_err(),
            Error::ValueOutOfBounds { .. }
        ));
        assert!(matches!(
            unpack_integer(7, 0, 5).unwrap_err(),
            Error::ValueOutOfBounds { .. }
        ));
    }

    #[test]
    fn codec_from_nodes() {
        let codec = FieldCodec::from_node(&Node::integer(0, 0, 1023).unwrap()).unwrap();
        assert_eq!(codec.bits(), 10);
        assert_eq!(FieldCodec::from_node(&Node::single(0.0)).unwrap().bits(), 32);
        assert_eq!(FieldCodec::from_node(&Node::double(0.0)).unwrap().bits(), 64);
        assert!(matches!(
            FieldCodec::from_node(&Node::string("a")).unwrap_err(),
            Error::NotImplemented { .. }
        ));
        assert!(matches!(
            FieldCodec::from_node(&Node::structure()).unwrap_err(),
            Error::BadPrototype { .. }
        ));
    }

    #[test]
    fn single_precision_too_large() {
        let codec = FieldCodec::from_node(&Node::single(0.0)).unwrap();
        let buffer = SourceDestBuffer::new("x", BufferData::Real64(vec![1e300]));
        let mut stream = ByteStreamWriteBuffer::new();
        assert!(matches!(
            codec.encode(&buffer, 0, &mut stream).unwrap_err(),
            Error::Real64TooLarge { .. }
        ));
    }

    #[test]
    fn float_bounds() {
        let node = Node::float(0.0, FloatPrecision::Double, -1.0, 1.0).unwrap();
        let codec = FieldCodec::from_node(&node).unwrap();
        let buffer = SourceDestBuffer::new("x", BufferData::Real64(vec![0.5, 1.5]));
        let mut stream = ByteStreamWriteBuffer::new();
        codec.encode(&buffer, 0, &mut stream).unwrap();
        assert!(matches!(
            codec.encode(&buffer, 1, &mut stream).unwrap_err(),
            Error::ValueOutOfBounds { .. }
        ));
    }

    #[test]
    fn scaled_integer_decodes_scaled() {
        let node = Node::scaled_integer(0, 0, 1023, 0.001, 0.0).unwrap();
        let codec = FieldCodec::from_node(&node).unwrap();
        let mut writer = ByteStreamWriteBuffer::new();
        writer.push(500, codec.bits());
        let mut stream = ByteStreamReadBuffer::new();
        stream.append(&writer.take_bytes());

        let mut buffer =
            SourceDestBuffer::new("x", BufferData::Real64(vec![0.0])).with_scaling(true);
        codec.decode(&mut stream, &mut buffer, 0).unwrap();
        assert_eq!(buffer.data(), &BufferData::Real64(vec![0.5]));
    }

    #[test]
    fn scaled_out_of_bounds() {
        let node = Node::scaled_integer(0, 0, 1023, 0.001, 0.0).unwrap();
        let codec = FieldCodec::from_node(&node).unwrap();
        let buffer = SourceDestBuffer::new("x", BufferData::Real64(vec![1.024])).with_scaling(true);
        let mut stream = ByteStreamWriteBuffer::new();
        assert!(matches!(
            codec.encode(&buffer, 0, &mut stream).unwrap_err(),
            Error::ValueOutOfBounds { .. }
        ));
    }

    fn prototype() -> (NodeTree, NodeId) {
        let mut tree = NodeTree::new();
        let prototype = tree.add(Node::structure());
        tree.insert(prototype, "x", Node::integer(0, 0, 1023).unwrap())
            .unwrap();
        tree.insert(prototype, "y", Node::double(0.0)).unwrap();
        (tree, prototype)
    }

    #[test]
    fn binding_rules() {
        let (tree, prototype) = prototype();
        let x = SourceDestBuffer::new("x", BufferData::Int64(vec![0; 4]));
        let y = SourceDestBuffer::new("/y", BufferData::Real64(vec![0.0; 4]));

        let bindings = bind_buffers(&tree, prototype, &[y.clone(), x.clone()], true).unwrap();
        assert_eq!(bindings[0].buffer, Some(1));
        assert_eq!(bindings[1].buffer, Some(0));

        let err = bind_buffers(&tree, prototype, &[x.clone()], true).unwrap_err();
        assert!(matches!(err, Error::NoBufferForElement { .. }));
        let bindings = bind_buffers(&tree, prototype, &[x.clone()], false).unwrap();
        assert_eq!(bindings[1].buffer, None);

        let err = bind_buffers(&tree, prototype, &[x.clone(), x.clone()], true).unwrap_err();
        assert!(matches!(err, Error::BufferDuplicatePathName { .. }));

        let z = SourceDestBuffer::new("z", BufferData::Real64(vec![0.0; 4]));
        let err = bind_buffers(&tree, prototype, &[x.clone(), z], false).unwrap_err();
        assert!(matches!(err, Error::PathUndefined { .. }));

        let short = SourceDestBuffer::new("y", BufferData::Real64(vec![0.0; 3]));
        let err = bind_buffers(&tree, prototype, &[x, short], true).unwrap_err();
        assert!(matches!(err, Error::BufferSizeMismatch { .. }));
    }

    proptest! {
        #[test]
        fn integer_round_trip(
            min in -1_000_000_i64..1_000_000,
            span in 0_i64..100_000,
            pos in 0.0..=1.0_f64,
        ) {
            let max = min + span;
            let value = min + (span as f64 * pos) as i64;
            let node = Node::integer(value, min, max).unwrap();
            let codec = FieldCodec::from_node(&node).unwrap();

            let source = SourceDestBuffer::new("v", BufferData::Int64(vec![value, min, max]));
            let mut writer = ByteStreamWriteBuffer::new();
            for i in 0..3 {
                codec.encode(&source, i, &mut writer).unwrap();
            }
            prop_assert_eq!(writer.byte_len(), (3 * codec.bits() as usize).div_ceil(8));

            let mut stream = ByteStreamReadBuffer::new();
            stream.append(&writer.take_bytes());
            let mut dest = SourceDestBuffer::new("v", BufferData::Int64(vec![0; 3]));
            for i in 0..3 {
                codec.decode(&mut stream, &mut dest, i).unwrap();
            }
            prop_assert_eq!(dest.data(), source.data());
        }

        #[test]
        fn out_of_range_is_rejected(
            min in -1000_i64..1000,
            span in 0_i64..1000,
            above in 1_i64..1000,
        ) {
            let node = Node::integer(min, min, min + span).unwrap();
            let codec = FieldCodec::from_node(&node).unwrap();
            let values = vec![min + span + above, min - above];
            let source = SourceDestBuffer::new("v", BufferData::Int64(values));
            let mut writer = ByteStreamWriteBuffer::new();
            let above_max = codec.encode(&source, 0, &mut writer);
            prop_assert!(
                matches!(above_max, Err(Error::ValueOutOfBounds { .. })),
                "value above maximum accepted"
            );
            let below_min = codec.encode(&source, 1, &mut writer);
            prop_assert!(
                matches!(below_min, Err(Error::ValueOutOfBounds { .. })),
                "value below minimum accepted"
            );
        }
    }
}
