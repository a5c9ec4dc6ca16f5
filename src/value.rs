use byteorder::{BigEndian, ByteOrder, LittleEndian};
use half::f16;
use num_complex::Complex;

use crate::error::{NpzError, NpzResult};
use crate::metadata::typestr;
use crate::types::{DType, Endian, Field, ScalarKind, TextEncoding};

// ---------------------------------------------------------------------------
// NpyValue  (one decoded element)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum NpyValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float16(f16),
    Float32(f32),
    Float64(f64),
    Complex64(Complex<f32>),
    Complex128(Complex<f64>),
    /// `S` text with trailing NUL bytes removed.
    Bytes(Vec<u8>),
    /// `U` text with trailing NUL characters removed.
    String(String),
    /// Raw `V` bytes, untouched.
    Opaque(Vec<u8>),
    /// A structured element, fields in declaration order.
    Record(Vec<(String, NpyValue)>),
    /// A field with a sub-array shape, flattened row-major.
    Array(Vec<NpyValue>),
}

impl NpyValue {
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            NpyValue::Bool(true) => Some(1.0),
            NpyValue::Bool(false) => Some(0.0),
            NpyValue::Int8(v) => Some(*v as f64),
            NpyValue::Int16(v) => Some(*v as f64),
            NpyValue::Int32(v) => Some(*v as f64),
            NpyValue::Int64(v) => Some(*v as f64),
            NpyValue::UInt8(v) => Some(*v as f64),
            NpyValue::UInt16(v) => Some(*v as f64),
            NpyValue::UInt32(v) => Some(*v as f64),
            NpyValue::UInt64(v) => Some(*v as f64),
            NpyValue::Float16(v) => Some(v.to_f64()),
            NpyValue::Float32(v) => Some(*v as f64),
            NpyValue::Float64(v) => Some(*v),
            NpyValue::Complex64(c) => Some(c.re as f64),
            NpyValue::Complex128(c) => Some(c.re),
            NpyValue::Bytes(_)
            | NpyValue::String(_)
            | NpyValue::Opaque(_)
            | NpyValue::Record(_)
            | NpyValue::Array(_) => None,
        }
    }

    /// Look up a field of a [`NpyValue::Record`].
    pub fn get(&self, name: &str) -> Option<&NpyValue> {
        match self {
            NpyValue::Record(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NpyValue::String(s) => Some(s),
            NpyValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            NpyValue::Bool(b) => Some(*b as i128),
            NpyValue::Int8(v) => Some(*v as i128),
            NpyValue::Int16(v) => Some(*v as i128),
            NpyValue::Int32(v) => Some(*v as i128),
            NpyValue::Int64(v) => Some(*v as i128),
            NpyValue::UInt8(v) => Some(*v as i128),
            NpyValue::UInt16(v) => Some(*v as i128),
            NpyValue::UInt32(v) => Some(*v as i128),
            NpyValue::UInt64(v) => Some(*v as i128),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            NpyValue::Bool(_) => "bool",
            NpyValue::Int8(_)
            | NpyValue::Int16(_)
            | NpyValue::Int32(_)
            | NpyValue::Int64(_)
            | NpyValue::UInt8(_)
            | NpyValue::UInt16(_)
            | NpyValue::UInt32(_)
            | NpyValue::UInt64(_) => "integer",
            NpyValue::Float16(_) | NpyValue::Float32(_) | NpyValue::Float64(_) => "float",
            NpyValue::Complex64(_) | NpyValue::Complex128(_) => "complex",
            NpyValue::Bytes(_) => "bytes",
            NpyValue::String(_) => "string",
            NpyValue::Opaque(_) => "opaque",
            NpyValue::Record(_) => "record",
            NpyValue::Array(_) => "array",
        }
    }
}

fn mismatch(dtype: &DType, value: &NpyValue) -> NpzError {
    NpzError::TypeConversion(format!(
        "cannot store {} value as {dtype}",
        value.kind_name()
    ))
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn read_with<T>(
    endian: Endian,
    bytes: &[u8],
    read_le: fn(&[u8]) -> T,
    read_be: fn(&[u8]) -> T,
) -> T {
    if endian.is_big() {
        read_be(bytes)
    } else {
        read_le(bytes)
    }
}

fn write_with<T>(
    endian: Endian,
    out: &mut Vec<u8>,
    width: usize,
    value: T,
    write_le: fn(&mut [u8], T),
    write_be: fn(&mut [u8], T),
) {
    let start = out.len();
    out.resize(start + width, 0);
    if endian.is_big() {
        write_be(&mut out[start..], value)
    } else {
        write_le(&mut out[start..], value)
    }
}

/// `read_as!(endian, bytes, read_u32)` picks `LittleEndian::read_u32` or
/// `BigEndian::read_u32`.
macro_rules! read_as {
    ($endian:expr, $bytes:expr, $read:ident) => {
        read_with($endian, $bytes, LittleEndian::$read, BigEndian::$read)
    };
}

macro_rules! write_as {
    ($endian:expr, $out:expr, $width:expr, $value:expr, $write:ident) => {
        write_with($endian, $out, $width, $value, LittleEndian::$write, BigEndian::$write)
    };
}

/// Split `bytes` into `count` consecutive items of `item` bytes.
fn items(bytes: &[u8], item: usize, count: usize) -> impl Iterator<Item = &[u8]> {
    (0..count).map(move |i| &bytes[i * item..(i + 1) * item])
}

/// Decode one element of `dtype` from exactly `dtype.item_size()` bytes.
pub fn decode_element(dtype: &DType, bytes: &[u8]) -> NpzResult<NpyValue> {
    dtype.validate()?;
    if bytes.len() != dtype.item_size() {
        return Err(NpzError::TypeConversion(format!(
            "element of {dtype} needs {} bytes, got {}",
            dtype.item_size(),
            bytes.len()
        )));
    }
    match dtype {
        DType::Primitive {
            kind,
            width,
            endian,
        } => Ok(decode_scalar(*kind, *width, *endian, bytes)),
        DType::Complex {
            component_width,
            endian,
        } => Ok(match component_width {
            4 => NpyValue::Complex64(Complex::new(
                read_as!(*endian, &bytes[..4], read_f32),
                read_as!(*endian, &bytes[4..], read_f32),
            )),
            _ => NpyValue::Complex128(Complex::new(
                read_as!(*endian, &bytes[..8], read_f64),
                read_as!(*endian, &bytes[8..], read_f64),
            )),
        }),
        DType::Text {
            encoding: TextEncoding::Bytes,
            ..
        } => {
            let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
            Ok(NpyValue::Bytes(bytes[..end].to_vec()))
        }
        DType::Text {
            encoding: TextEncoding::Unicode,
            endian,
            ..
        } => {
            let mut units: Vec<u32> = bytes
                .chunks_exact(4)
                .map(|c| read_as!(*endian, c, read_u32))
                .collect();
            while units.last() == Some(&0) {
                units.pop();
            }
            let text = units
                .into_iter()
                .map(|u| {
                    char::from_u32(u).ok_or_else(|| {
                        NpzError::TypeConversion(format!("invalid code point {u:#x} in {dtype}"))
                    })
                })
                .collect::<NpzResult<String>>()?;
            Ok(NpyValue::String(text))
        }
        DType::Opaque { .. } => Ok(NpyValue::Opaque(bytes.to_vec())),
        DType::Structured(st) => {
            let mut record = Vec::with_capacity(st.fields().len());
            for field in st.fields() {
                let slice = &bytes[field.offset..field.offset + field.size()];
                record.push((field.name.clone(), decode_field(field, slice)?));
            }
            Ok(NpyValue::Record(record))
        }
    }
}

fn decode_scalar(kind: ScalarKind, width: usize, endian: Endian, bytes: &[u8]) -> NpyValue {
    match (kind, width) {
        (ScalarKind::Bool, _) => NpyValue::Bool(bytes[0] != 0),
        (ScalarKind::Int, 1) => NpyValue::Int8(bytes[0] as i8),
        (ScalarKind::Int, 2) => NpyValue::Int16(read_as!(endian, bytes, read_i16)),
        (ScalarKind::Int, 4) => NpyValue::Int32(read_as!(endian, bytes, read_i32)),
        (ScalarKind::Int, _) => NpyValue::Int64(read_as!(endian, bytes, read_i64)),
        (ScalarKind::UInt, 1) => NpyValue::UInt8(bytes[0]),
        (ScalarKind::UInt, 2) => NpyValue::UInt16(read_as!(endian, bytes, read_u16)),
        (ScalarKind::UInt, 4) => NpyValue::UInt32(read_as!(endian, bytes, read_u32)),
        (ScalarKind::UInt, _) => NpyValue::UInt64(read_as!(endian, bytes, read_u64)),
        (ScalarKind::Float, 2) => {
            NpyValue::Float16(f16::from_bits(read_as!(endian, bytes, read_u16)))
        }
        (ScalarKind::Float, 4) => NpyValue::Float32(read_as!(endian, bytes, read_f32)),
        (ScalarKind::Float, _) => NpyValue::Float64(read_as!(endian, bytes, read_f64)),
    }
}

/// Decode a field's bytes, honoring its sub-array shape.
pub(crate) fn decode_field(field: &Field, bytes: &[u8]) -> NpzResult<NpyValue> {
    if field.shape.is_empty() {
        return decode_element(&field.dtype, bytes);
    }
    items(bytes, field.dtype.item_size(), field.count())
        .map(|chunk| decode_element(&field.dtype, chunk))
        .collect::<NpzResult<Vec<_>>>()
        .map(NpyValue::Array)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Append the `dtype.item_size()` bytes representing `value` to `out`.
pub fn encode_element(dtype: &DType, value: &NpyValue, out: &mut Vec<u8>) -> NpzResult<()> {
    dtype.validate()?;
    match dtype {
        DType::Primitive {
            kind,
            width,
            endian,
        } => encode_scalar(dtype, *kind, *width, *endian, value, out),
        DType::Complex {
            component_width,
            endian,
        } => {
            let (re, im) = match value {
                NpyValue::Complex64(c) => (c.re as f64, c.im as f64),
                NpyValue::Complex128(c) => (c.re, c.im),
                other => (other.to_f64().ok_or_else(|| mismatch(dtype, value))?, 0.0),
            };
            if *component_width == 4 {
                write_as!(*endian, out, 4, re as f32, write_f32);
                write_as!(*endian, out, 4, im as f32, write_f32);
            } else {
                write_as!(*endian, out, 8, re, write_f64);
                write_as!(*endian, out, 8, im, write_f64);
            }
            Ok(())
        }
        DType::Text {
            encoding: TextEncoding::Bytes,
            length,
            ..
        } => {
            let raw = match value {
                NpyValue::Bytes(b) => b.as_slice(),
                NpyValue::String(s) if s.is_ascii() => s.as_bytes(),
                _ => return Err(mismatch(dtype, value)),
            };
            if raw.len() > *length {
                return Err(NpzError::TypeConversion(format!(
                    "{} bytes do not fit in {dtype}",
                    raw.len()
                )));
            }
            out.extend_from_slice(raw);
            out.resize(out.len() + length - raw.len(), 0);
            Ok(())
        }
        DType::Text {
            encoding: TextEncoding::Unicode,
            length,
            endian,
        } => {
            let NpyValue::String(s) = value else {
                return Err(mismatch(dtype, value));
            };
            let count = s.chars().count();
            if count > *length {
                return Err(NpzError::TypeConversion(format!(
                    "{count} characters do not fit in {dtype}"
                )));
            }
            for c in s.chars() {
                write_as!(*endian, out, 4, c as u32, write_u32);
            }
            out.resize(out.len() + (length - count) * 4, 0);
            Ok(())
        }
        DType::Opaque { size } => match value {
            NpyValue::Opaque(raw) | NpyValue::Bytes(raw) if raw.len() <= *size => {
                out.extend_from_slice(raw);
                out.resize(out.len() + size - raw.len(), 0);
                Ok(())
            }
            _ => Err(mismatch(dtype, value)),
        },
        DType::Structured(st) => {
            let NpyValue::Record(entries) = value else {
                return Err(mismatch(dtype, value));
            };
            if let Some((name, _)) = entries.iter().find(|(n, _)| st.field(n).is_none()) {
                return Err(NpzError::TypeConversion(format!(
                    "record has no field {name:?} in {dtype}"
                )));
            }
            let start = out.len();
            for field in st.fields() {
                let entry = value.get(&field.name).ok_or_else(|| {
                    NpzError::TypeConversion(format!("record is missing field {:?}", field.name))
                })?;
                out.resize(start + field.offset, 0);
                encode_field(field, entry, out)?;
            }
            out.resize(start + st.item_size(), 0);
            Ok(())
        }
    }
}

fn encode_field(field: &Field, value: &NpyValue, out: &mut Vec<u8>) -> NpzResult<()> {
    if field.shape.is_empty() {
        return encode_element(&field.dtype, value, out);
    }
    match value {
        NpyValue::Array(items) if items.len() == field.count() => {
            for item in items {
                encode_element(&field.dtype, item, out)?;
            }
            Ok(())
        }
        _ => Err(NpzError::TypeConversion(format!(
            "field {:?} expects {} values of shape {:?}",
            field.name,
            field.count(),
            field.shape
        ))),
    }
}

fn encode_scalar(
    dtype: &DType,
    kind: ScalarKind,
    width: usize,
    endian: Endian,
    value: &NpyValue,
    out: &mut Vec<u8>,
) -> NpzResult<()> {
    match kind {
        ScalarKind::Bool => match value {
            NpyValue::Bool(b) => {
                out.push(*b as u8);
                Ok(())
            }
            _ => Err(mismatch(dtype, value)),
        },
        ScalarKind::Int | ScalarKind::UInt => {
            let v = value.as_i128().ok_or_else(|| mismatch(dtype, value))?;
            let bits = (width * 8) as u32;
            let (min, max) = if kind == ScalarKind::Int {
                (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
            } else {
                (0, (1i128 << bits) - 1)
            };
            if v < min || v > max {
                return Err(NpzError::TypeConversion(format!("{v} out of range for {dtype}")));
            }
            match width {
                1 => out.push(v as u8),
                2 => write_as!(endian, out, 2, v as u16, write_u16),
                4 => write_as!(endian, out, 4, v as u32, write_u32),
                _ => write_as!(endian, out, 8, v as u64, write_u64),
            }
            Ok(())
        }
        ScalarKind::Float => {
            let v = match value {
                NpyValue::Complex64(_) | NpyValue::Complex128(_) => None,
                other => other.to_f64(),
            }
            .ok_or_else(|| mismatch(dtype, value))?;
            match width {
                2 => write_as!(endian, out, 2, f16::from_f64(v).to_bits(), write_u16),
                4 => write_as!(endian, out, 4, v as f32, write_f32),
                _ => write_as!(endian, out, 8, v, write_f64),
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Element  (typed bulk access)
// ---------------------------------------------------------------------------

/// A Rust scalar type with a fixed element layout.
pub trait Element: Copy {
    /// Little-endian (or byte-order free) dtype used when writing.
    fn dtype() -> DType;

    fn read(endian: Endian, bytes: &[u8]) -> Self;

    fn write_le(self, out: &mut Vec<u8>);

    /// Whether elements of `dtype` can be read as `Self`, ignoring byte order.
    fn matches(dtype: &DType) -> bool {
        let strip = |d: &DType| typestr(d).map(|s| s[1..].to_string());
        !dtype.is_structured() && strip(dtype).is_some() && strip(dtype) == strip(&Self::dtype())
    }
}

impl Element for bool {
    fn dtype() -> DType {
        DType::primitive(ScalarKind::Bool, 1, Endian::NotApplicable)
    }
    fn read(_: Endian, bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
}

impl Element for i8 {
    fn dtype() -> DType {
        DType::primitive(ScalarKind::Int, 1, Endian::NotApplicable)
    }
    fn read(_: Endian, bytes: &[u8]) -> Self {
        bytes[0] as i8
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
}

impl Element for u8 {
    fn dtype() -> DType {
        DType::primitive(ScalarKind::UInt, 1, Endian::NotApplicable)
    }
    fn read(_: Endian, bytes: &[u8]) -> Self {
        bytes[0]
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self);
    }
}

macro_rules! impl_element {
    ($t:ty, $kind:expr, $width:expr, $read:ident, $write:ident) => {
        impl Element for $t {
            fn dtype() -> DType {
                DType::primitive($kind, $width, Endian::Little)
            }
            fn read(endian: Endian, bytes: &[u8]) -> Self {
                read_as!(endian, bytes, $read)
            }
            fn write_le(self, out: &mut Vec<u8>) {
                write_as!(Endian::Little, out, $width, self, $write)
            }
        }
    };
}

impl_element!(i16, ScalarKind::Int, 2, read_i16, write_i16);
impl_element!(i32, ScalarKind::Int, 4, read_i32, write_i32);
impl_element!(i64, ScalarKind::Int, 8, read_i64, write_i64);
impl_element!(u16, ScalarKind::UInt, 2, read_u16, write_u16);
impl_element!(u32, ScalarKind::UInt, 4, read_u32, write_u32);
impl_element!(u64, ScalarKind::UInt, 8, read_u64, write_u64);
impl_element!(f32, ScalarKind::Float, 4, read_f32, write_f32);
impl_element!(f64, ScalarKind::Float, 8, read_f64, write_f64);

impl Element for f16 {
    fn dtype() -> DType {
        DType::primitive(ScalarKind::Float, 2, Endian::Little)
    }
    fn read(endian: Endian, bytes: &[u8]) -> Self {
        f16::from_bits(read_as!(endian, bytes, read_u16))
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_bits().to_le_bytes());
    }
}

impl Element for Complex<f32> {
    fn dtype() -> DType {
        DType::Complex {
            component_width: 4,
            endian: Endian::Little,
        }
    }
    fn read(endian: Endian, bytes: &[u8]) -> Self {
        Complex::new(f32::read(endian, &bytes[..4]), f32::read(endian, &bytes[4..8]))
    }
    fn write_le(self, out: &mut Vec<u8>) {
        self.re.write_le(out);
        self.im.write_le(out);
    }
}

impl Element for Complex<f64> {
    fn dtype() -> DType {
        DType::Complex {
            component_width: 8,
            endian: Endian::Little,
        }
    }
    fn read(endian: Endian, bytes: &[u8]) -> Self {
        Complex::new(f64::read(endian, &bytes[..8]), f64::read(endian, &bytes[8..16]))
    }
    fn write_le(self, out: &mut Vec<u8>) {
        self.re.write_le(out);
        self.im.write_le(out);
    }
}

/// Byte order a dtype's scalars are stored in; `None` for multi-field layouts.
pub(crate) fn scalar_endian(dtype: &DType) -> Option<Endian> {
    match dtype {
        DType::Primitive { endian, .. }
        | DType::Complex { endian, .. }
        | DType::Text { endian, .. } => Some(*endian),
        DType::Opaque { .. } => Some(Endian::NotApplicable),
        DType::Structured(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;

    #[test]
    fn test_decode_big_endian_int() {
        let dtype = DType::primitive(ScalarKind::Int, 4, Endian::Big);
        let v = decode_element(&dtype, &[0, 0, 1, 2]).unwrap();
        assert_eq!(v, NpyValue::Int32(258));
    }

    #[test]
    fn test_text_strips_trailing_nul() {
        let s = decode_element(&DType::bytes(5), b"ab\0\0\0").unwrap();
        assert_eq!(s, NpyValue::Bytes(b"ab".to_vec()));

        let mut out = Vec::new();
        encode_element(&DType::unicode(3), &NpyValue::String("hé".into()), &mut out).unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(&out[4..8], &[0xe9, 0, 0, 0]);
        assert_eq!(
            decode_element(&DType::unicode(3), &out).unwrap(),
            NpyValue::String("hé".into())
        );
    }

    #[test]
    fn test_text_too_long() {
        let mut out = Vec::new();
        let err = encode_element(&DType::bytes(2), &NpyValue::Bytes(b"abc".to_vec()), &mut out);
        assert!(matches!(err, Err(NpzError::TypeConversion(_))));
    }

    #[test]
    fn test_integer_range_checked() {
        let dtype = DType::primitive(ScalarKind::UInt, 1, Endian::NotApplicable);
        let mut out = Vec::new();
        assert!(encode_element(&dtype, &NpyValue::Int32(255), &mut out).is_ok());
        assert!(encode_element(&dtype, &NpyValue::Int32(256), &mut out).is_err());
        assert!(encode_element(&dtype, &NpyValue::Int8(-1), &mut out).is_err());
        assert_eq!(out, vec![255]);
    }

    #[test]
    fn test_unsupported_widths_are_rejected() {
        let odd = DType::primitive(ScalarKind::Int, 3, Endian::Little);
        assert!(matches!(
            decode_element(&odd, &[1, 2, 3]),
            Err(NpzError::InvalidDType(_))
        ));

        let zero = DType::primitive(ScalarKind::UInt, 0, Endian::Little);
        let mut out = Vec::new();
        assert!(matches!(
            encode_element(&zero, &NpyValue::UInt8(1), &mut out),
            Err(NpzError::InvalidDType(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_record_with_gap_and_sub_array() {
        let i2 = DType::primitive(ScalarKind::Int, 2, Endian::Little);
        let dtype = DType::structured_with_layout(
            vec![
                Field::new("a", i2.clone()),
                Field::new("b", i2.clone()).with_shape(vec![2]).at_offset(4),
            ],
            Some(10),
        )
        .unwrap();
        let record = NpyValue::Record(vec![
            ("a".into(), NpyValue::Int16(1)),
            ("b".into(), NpyValue::Array(vec![NpyValue::Int16(2), NpyValue::Int16(3)])),
        ]);
        let mut out = Vec::new();
        encode_element(&dtype, &record, &mut out).unwrap();
        assert_eq!(out, vec![1, 0, 0, 0, 2, 0, 3, 0, 0, 0]);
        assert_eq!(decode_element(&dtype, &out).unwrap(), record);
    }

    #[test]
    fn test_record_missing_field() {
        let dtype = DType::structured(vec![Field::new("x", u8::dtype())]).unwrap();
        let mut out = Vec::new();
        let err = encode_element(&dtype, &NpyValue::Record(vec![]), &mut out);
        assert!(err.is_err());
    }

    #[test]
    fn test_element_matches_ignores_byte_order() {
        assert!(i32::matches(&DType::primitive(ScalarKind::Int, 4, Endian::Big)));
        assert!(!i32::matches(&DType::primitive(ScalarKind::UInt, 4, Endian::Little)));
        assert!(Complex::<f64>::matches(&DType::Complex {
            component_width: 8,
            endian: Endian::Native
        }));
    }
}
