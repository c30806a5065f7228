use crate::{Error, Result};

/// Typed memory for one field of a record block transfer.
#[derive(Clone, Debug, PartialEq)]
pub enum BufferData {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    Bool(Vec<bool>),
    Real32(Vec<f32>),
    Real64(Vec<f64>),
    UString(Vec<String>),
}

impl BufferData {
    pub fn len(&self) -> usize {
        match self {
            BufferData::Int8(v) => v.len(),
            BufferData::UInt8(v) => v.len(),
            BufferData::Int16(v) => v.len(),
            BufferData::UInt16(v) => v.len(),
            BufferData::Int32(v) => v.len(),
            BufferData::UInt32(v) => v.len(),
            BufferData::Int64(v) => v.len(),
            BufferData::Bool(v) => v.len(),
            BufferData::Real32(v) => v.len(),
            BufferData::Real64(v) => v.len(),
            BufferData::UString(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn type_name(&self) -> &'static str {
        match self {
            BufferData::Int8(_) => "Int8",
            BufferData::UInt8(_) => "UInt8",
            BufferData::Int16(_) => "Int16",
            BufferData::UInt16(_) => "UInt16",
            BufferData::Int32(_) => "Int32",
            BufferData::UInt32(_) => "UInt32",
            BufferData::Int64(_) => "Int64",
            BufferData::Bool(_) => "Bool",
            BufferData::Real32(_) => "Real32",
            BufferData::Real64(_) => "Real64",
            BufferData::UString(_) => "UString",
        }
    }
}

enum Number {
    Integer(i64),
    Real(f64),
}

/// Binds user memory to a prototype field for reading or writing records.
///
/// Conversion between integer and floating point memory must be requested explicitly.
/// Scaling applies scale and offset of scaled integer fields to the memory values.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceDestBuffer {
    path_name: String,
    data: BufferData,
    do_conversion: bool,
    do_scaling: bool,
}

impl SourceDestBuffer {
    pub fn new(path_name: impl Into<String>, data: BufferData) -> Self {
        Self {
            path_name: path_name.into(),
            data,
            do_conversion: false,
            do_scaling: false,
        }
    }

    /// Allows conversion between integer and floating point representations.
    pub fn with_conversion(mut self, do_conversion: bool) -> Self {
        self.do_conversion = do_conversion;
        self
    }

    /// Stores scaled values in memory instead of raw integers for scaled integer fields.
    pub fn with_scaling(mut self, do_scaling: bool) -> Self {
        self.do_scaling = do_scaling;
        self
    }

    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn do_conversion(&self) -> bool {
        self.do_conversion
    }

    pub fn do_scaling(&self) -> bool {
        self.do_scaling
    }

    pub fn data(&self) -> &BufferData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut BufferData {
        &mut self.data
    }

    pub fn into_data(self) -> BufferData {
        self.data
    }

    fn number(&self, index: usize) -> Result<Number> {
        let value = match &self.data {
            BufferData::Int8(v) => v.get(index).map(|v| Number::Integer(*v as i64)),
            BufferData::UInt8(v) => v.get(index).map(|v| Number::Integer(*v as i64)),
            BufferData::Int16(v) => v.get(index).map(|v| Number::Integer(*v as i64)),
            BufferData::UInt16(v) => v.get(index).map(|v| Number::Integer(*v as i64)),
            BufferData::Int32(v) => v.get(index).map(|v| Number::Integer(*v as i64)),
            BufferData::UInt32(v) => v.get(index).map(|v| Number::Integer(*v as i64)),
            BufferData::Int64(v) => v.get(index).map(|v| Number::Integer(*v)),
            BufferData::Bool(v) => v.get(index).map(|v| Number::Integer(*v as i64)),
            BufferData::Real32(v) => v.get(index).map(|v| Number::Real(*v as f64)),
            BufferData::Real64(v) => v.get(index).map(|v| Number::Real(*v)),
            BufferData::UString(_) => Err(Error::ExpectingNumeric {
                reason: format!("Buffer '{}' holds strings", self.path_name),
            })?,
        };
        value.ok_or_else(|| Error::Internal {
            reason: format!(
                "Index {index} is outside of buffer '{}' with capacity {}",
                self.path_name,
                self.capacity()
            ),
        })
    }

    fn conversion_required(&self, target: &str) -> Error {
        Error::ConversionRequired {
            reason: format!(
                "Buffer '{}' of type {} needs conversion to {target}",
                self.path_name,
                self.data.type_name()
            ),
        }
    }

    /// Reads a value for an integer field.
    pub(crate) fn get_integer(&self, index: usize) -> Result<i64> {
        match self.number(index)? {
            Number::Integer(v) => Ok(v),
            Number::Real(v) => {
                if !self.do_conversion {
                    Err(self.conversion_required("integer"))?
                }
                real_to_i64(v).ok_or_else(|| Error::ValueNotRepresentable {
                    reason: format!(
                        "Value {v} of buffer '{}' is no 64 bit integer",
                        self.path_name
                    ),
                })
            }
        }
    }

    /// Reads a raw value for a scaled integer field.
    pub(crate) fn get_scaled_raw(&self, index: usize, scale: f64, offset: f64) -> Result<i64> {
        if !self.do_scaling {
            return self.get_integer(index);
        }
        let value = match self.number(index)? {
            Number::Integer(v) => v as f64,
            Number::Real(v) => v,
        };
        raw_from_scaled(value, scale, offset)
    }

    /// Reads a value for a floating point field.
    pub(crate) fn get_real(&self, index: usize) -> Result<f64> {
        match self.number(index)? {
            Number::Real(v) => Ok(v),
            Number::Integer(v) => {
                if !self.do_conversion {
                    Err(self.conversion_required("floating point"))?
                }
                Ok(v as f64)
            }
        }
    }

    /// Stores a value decoded from an integer field.
    pub(crate) fn set_integer(&mut self, index: usize, value: i64) -> Result<()> {
        let path = &self.path_name;
        match &mut self.data {
            BufferData::Int8(v) => store_int(v, index, value, path),
            BufferData::UInt8(v) => store_int(v, index, value, path),
            BufferData::Int16(v) => store_int(v, index, value, path),
            BufferData::UInt16(v) => store_int(v, index, value, path),
            BufferData::Int32(v) => store_int(v, index, value, path),
            BufferData::UInt32(v) => store_int(v, index, value, path),
            BufferData::Int64(v) => store_int(v, index, value, path),
            BufferData::Bool(v) => store(v, index, value != 0, path),
            BufferData::Real32(_) | BufferData::Real64(_) if !self.do_conversion => {
                Err(self.conversion_required("floating point"))
            }
            BufferData::Real32(v) => store(v, index, value as f32, path),
            BufferData::Real64(v) => store(v, index, value as f64, path),
            BufferData::UString(_) => Err(Error::ExpectingNumeric {
                reason: format!("Buffer '{path}' holds strings"),
            }),
        }
    }

    /// Stores a raw value decoded from a scaled integer field.
    pub(crate) fn set_scaled(
        &mut self,
        index: usize,
        raw: i64,
        scale: f64,
        offset: f64,
    ) -> Result<()> {
        if self.do_scaling {
            self.set_real(index, scaled_from_raw(raw, scale, offset))
        } else {
            self.set_integer(index, raw)
        }
    }

    /// Stores a value decoded from a floating point field.
    pub(crate) fn set_real(&mut self, index: usize, value: f64) -> Result<()> {
        let path = &self.path_name;
        match &mut self.data {
            BufferData::Real64(v) => store(v, index, value, path),
            BufferData::Real32(v) => {
                if value.is_finite() && value.abs() > f32::MAX as f64 {
                    Err(Error::ValueNotRepresentable {
                        reason: format!("Value {value} does not fit into buffer '{path}'"),
                    })?
                }
                store(v, index, value as f32, path)
            }
            BufferData::UString(_) => Err(Error::ExpectingNumeric {
                reason: format!("Buffer '{path}' holds strings"),
            }),
            _ if !self.do_conversion => Err(self.conversion_required("integer")),
            BufferData::Bool(v) => store(v, index, value != 0.0, path),
            _ => {
                let integer = real_to_i64(value).ok_or_else(|| Error::ValueNotRepresentable {
                    reason: format!("Value {value} is no 64 bit integer"),
                })?;
                self.set_integer(index, integer)
            }
        }
    }
}

fn store<T>(values: &mut [T], index: usize, value: T, path: &str) -> Result<()> {
    let len = values.len();
    let slot = values.get_mut(index).ok_or_else(|| Error::Internal {
        reason: format!("Index {index} is outside of buffer '{path}' with capacity {len}"),
    })?;
    *slot = value;
    Ok(())
}

fn store_int<T: TryFrom<i64>>(
    values: &mut [T],
    index: usize,
    value: i64,
    path: &str,
) -> Result<()> {
    let converted = T::try_from(value).map_err(|_| Error::ValueNotRepresentable {
        reason: format!("Value {value} does not fit into buffer '{path}'"),
    })?;
    store(values, index, converted, path)
}

/// Truncates towards zero, if the value fits into a 64 bit integer.
fn real_to_i64(value: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is not representable
    if value.is_finite() && value >= i64::MIN as f64 && value < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

/// Maps a scaled value to the closest raw integer value.
pub fn raw_from_scaled(value: f64, scale: f64, offset: f64) -> Result<i64> {
    let raw = ((value - offset) / scale + 0.5).floor();
    real_to_i64(raw).ok_or_else(|| Error::ScaledValueNotRepresentable {
        reason: format!("Value {value} with scale {scale} and offset {offset} has no raw value"),
    })
}

/// Applies scale and offset to a raw integer value.
pub fn scaled_from_raw(raw: i64, scale: f64, offset: f64) -> f64 {
    raw as f64 * scale + offset
}
