use std::io::{Read, Write};

use bytes::Bytes;

use crate::error::{NpzError, NpzResult};
use crate::metadata::ArrayHeader;
use crate::types::{ArrayOrder, DType, Field};
use crate::value::{Element, NpyValue, decode_element, decode_field, encode_element, scalar_endian};

/// A single array: its header plus the raw element bytes in storage order.
///
/// Equality ignores the header's format version.
#[derive(Debug, Clone)]
pub struct NpyArray {
    header: ArrayHeader,
    data: Bytes,
}

impl PartialEq for NpyArray {
    fn eq(&self, other: &Self) -> bool {
        self.header.dtype == other.header.dtype
            && self.header.shape == other.header.shape
            && self.header.order == other.header.order
            && self.data == other.data
    }
}

/// Most elements a zero-sized dtype may expand to when values are collected.
/// Such payloads are empty, so the declared shape alone would size the
/// allocation.
const MAX_ZERO_SIZED_ELEMENTS: usize = 1 << 20;

fn expected_len(header: &ArrayHeader) -> NpzResult<usize> {
    header.payload_len().ok_or_else(|| {
        NpzError::InvalidDType(format!(
            "shape {:?} of {} overflows the addressable size",
            header.shape, header.dtype
        ))
    })
}

impl NpyArray {
    pub fn new(
        dtype: DType,
        shape: impl Into<Vec<usize>>,
        order: ArrayOrder,
        data: impl Into<Bytes>,
    ) -> NpzResult<Self> {
        Self::from_parts(ArrayHeader::new(dtype, shape, order), data)
    }

    /// Pair a header with its payload, checking that the lengths agree.
    pub fn from_parts(header: ArrayHeader, data: impl Into<Bytes>) -> NpzResult<Self> {
        header.dtype.validate()?;
        let data = data.into();
        let expected = expected_len(&header)?;
        if data.len() != expected {
            return Err(NpzError::PayloadSizeMismatch {
                expected: expected as u64,
                actual: data.len() as u64,
            });
        }
        Ok(Self { header, data })
    }

    /// Build a little-endian array from typed values given in storage order.
    pub fn from_elements<T: Element>(
        shape: impl Into<Vec<usize>>,
        order: ArrayOrder,
        values: &[T],
    ) -> NpzResult<Self> {
        let dtype = T::dtype();
        let mut data = Vec::with_capacity(values.len() * dtype.item_size());
        for v in values {
            v.write_le(&mut data);
        }
        Self::new(dtype, shape, order, data)
    }

    /// Build an array of any dtype from decoded values given in storage order.
    pub fn from_values(
        dtype: DType,
        shape: impl Into<Vec<usize>>,
        order: ArrayOrder,
        values: &[NpyValue],
    ) -> NpzResult<Self> {
        dtype.validate()?;
        let mut data = Vec::with_capacity(values.len() * dtype.item_size());
        for v in values {
            encode_element(&dtype, v, &mut data)?;
        }
        Self::new(dtype, shape, order, data)
    }

    pub fn header(&self) -> &ArrayHeader {
        &self.header
    }

    pub fn dtype(&self) -> &DType {
        &self.header.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.header.shape
    }

    pub fn order(&self) -> ArrayOrder {
        self.header.order
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_parts(self) -> (ArrayHeader, Bytes) {
        (self.header, self.data)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.header.element_count().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Serialisation
    // -----------------------------------------------------------------------

    /// Encode the complete `.npy` byte stream.
    pub fn encode(&self) -> NpzResult<Vec<u8>> {
        let mut out = self.header.encode()?;
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> NpzResult<()> {
        writer.write_all(&self.header.encode()?)?;
        writer.write_all(&self.data)?;
        Ok(())
    }

    /// Decode a complete `.npy` byte stream. Bytes beyond the payload are an
    /// error.
    pub fn decode(bytes: &[u8]) -> NpzResult<Self> {
        let (header, offset) = ArrayHeader::decode(bytes)?;
        let expected = expected_len(&header)?;
        let available = bytes.len() - offset;
        if available < expected {
            return Err(NpzError::TruncatedPayload {
                offset: offset as u64,
                expected: expected as u64,
                available: available as u64,
            });
        }
        if available > expected {
            return Err(NpzError::PayloadSizeMismatch {
                expected: expected as u64,
                actual: available as u64,
            });
        }
        tracing::trace!(shape = ?header.shape, dtype = %header.dtype, "decoded array");
        Ok(Self {
            header,
            data: Bytes::copy_from_slice(&bytes[offset..]),
        })
    }

    /// Read one array from a stream, consuming exactly its header and payload.
    pub fn read_from<R: Read>(reader: &mut R) -> NpzResult<Self> {
        let (header, offset) = ArrayHeader::read_from(reader)?;
        let expected = expected_len(&header)?;
        let mut data = Vec::with_capacity(expected.min(1 << 24));
        reader.by_ref().take(expected as u64).read_to_end(&mut data)?;
        if data.len() < expected {
            return Err(NpzError::TruncatedPayload {
                offset: offset as u64,
                expected: expected as u64,
                available: data.len() as u64,
            });
        }
        Ok(Self {
            header,
            data: data.into(),
        })
    }

    // -----------------------------------------------------------------------
    // Element access
    // -----------------------------------------------------------------------

    /// Flat storage position of a multi-dimensional index.
    pub fn ravel_index(&self, index: &[usize]) -> NpzResult<usize> {
        let shape = self.shape();
        if index.len() != shape.len() || index.iter().zip(shape).any(|(i, d)| i >= d) {
            return Err(NpzError::IndexOutOfBounds {
                index: index.to_vec(),
                shape: shape.to_vec(),
            });
        }
        Ok(linear_index(shape, self.order(), index))
    }

    /// Multi-dimensional index of a flat storage position.
    pub fn unravel_index(&self, flat: usize) -> NpzResult<Vec<usize>> {
        if flat >= self.len() {
            return Err(NpzError::IndexOutOfBounds {
                index: vec![flat],
                shape: self.shape().to_vec(),
            });
        }
        let shape = self.shape();
        let mut index = vec![0; shape.len()];
        let mut rest = flat;
        let dims: Box<dyn Iterator<Item = usize>> = match self.order() {
            ArrayOrder::C => Box::new((0..shape.len()).rev()),
            ArrayOrder::F => Box::new(0..shape.len()),
        };
        for axis in dims {
            index[axis] = rest % shape[axis];
            rest /= shape[axis];
        }
        Ok(index)
    }

    fn element_bytes(&self, flat: usize) -> &[u8] {
        let item = self.dtype().item_size();
        &self.data[flat * item..(flat + 1) * item]
    }

    /// Number of elements the collecting accessors will produce.
    fn collected_len(&self) -> NpzResult<usize> {
        let len = self.len();
        if self.dtype().item_size() == 0 && len > MAX_ZERO_SIZED_ELEMENTS {
            return Err(NpzError::TypeConversion(format!(
                "refusing to expand {len} elements of zero-sized {}",
                self.dtype()
            )));
        }
        Ok(len)
    }

    pub fn get(&self, index: &[usize]) -> NpzResult<NpyValue> {
        let flat = self.ravel_index(index)?;
        decode_element(self.dtype(), self.element_bytes(flat))
    }

    /// Every element, in storage order.
    pub fn values(&self) -> NpzResult<Vec<NpyValue>> {
        (0..self.collected_len()?)
            .map(|i| decode_element(self.dtype(), self.element_bytes(i)))
            .collect()
    }

    /// Values of a (possibly nested) structured field for every element.
    pub fn field(&self, path: &[&str]) -> NpzResult<Vec<NpyValue>> {
        let (offset, field) = resolve_field(self.dtype(), path)?;
        let (item, size) = (self.dtype().item_size(), field.size());
        (0..self.collected_len()?)
            .map(|i| {
                let start = i * item + offset;
                decode_field(field, &self.data[start..start + size])
            })
            .collect()
    }

    /// Typed copy of every element, in storage order.
    pub fn to_vec<T: Element>(&self) -> NpzResult<Vec<T>> {
        let dtype = self.dtype();
        let endian = match scalar_endian(dtype) {
            Some(e) if T::matches(dtype) => e,
            _ => {
                return Err(NpzError::TypeConversion(format!(
                    "cannot read {dtype} as {}",
                    std::any::type_name::<T>()
                )));
            }
        };
        let item = dtype.item_size();
        Ok(self.data.chunks_exact(item).map(|c| T::read(endian, c)).collect())
    }

    pub fn to_f64_vec(&self) -> NpzResult<Vec<f64>> {
        self.values()?
            .iter()
            .map(|v| {
                v.to_f64().ok_or_else(|| {
                    NpzError::TypeConversion(format!("Cannot convert {} to f64", self.dtype()))
                })
            })
            .collect()
    }
}

fn resolve_field<'a>(dtype: &'a DType, path: &[&str]) -> NpzResult<(usize, &'a Field)> {
    let missing = || NpzError::NotFound(format!("field {}", path.join(".")));
    let (first, rest) = path.split_first().ok_or_else(missing)?;
    let field = dtype.field(first).ok_or_else(missing)?;
    if rest.is_empty() {
        return Ok((field.offset, field));
    }
    if !field.shape.is_empty() {
        return Err(NpzError::TypeConversion(format!(
            "cannot select into sub-array field {first:?}"
        )));
    }
    let (offset, inner) = resolve_field(&field.dtype, rest).map_err(|e| match e {
        NpzError::NotFound(_) => missing(),
        other => other,
    })?;
    Ok((field.offset + offset, inner))
}

// ---------------------------------------------------------------------------
// Index math
// ---------------------------------------------------------------------------

/// Element strides for the given shape and order.
pub fn strides(shape: &[usize], order: ArrayOrder) -> Vec<usize> {
    let scan = |state: &mut usize, dim: &usize| {
        let stride = *state;
        *state *= *dim;
        Some(stride)
    };
    match order {
        ArrayOrder::C => {
            let mut s: Vec<usize> = shape.iter().rev().scan(1usize, scan).collect();
            s.reverse();
            s
        }
        ArrayOrder::F => shape.iter().scan(1usize, scan).collect(),
    }
}

pub fn linear_index(shape: &[usize], order: ArrayOrder, indices: &[usize]) -> usize {
    let s = strides(shape, order);
    indices.iter().zip(s.iter()).map(|(i, s)| i * s).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endian, ScalarKind};

    #[test]
    fn test_strides() {
        assert_eq!(strides(&[2, 3, 4], ArrayOrder::C), vec![12, 4, 1]);
        assert_eq!(strides(&[2, 3, 4], ArrayOrder::F), vec![1, 2, 6]);
        assert_eq!(strides(&[], ArrayOrder::C), Vec::<usize>::new());
    }

    #[test]
    fn test_payload_length_checked() {
        let err = NpyArray::new(u16::dtype(), vec![3], ArrayOrder::C, vec![0u8; 5]).unwrap_err();
        assert!(matches!(
            err,
            NpzError::PayloadSizeMismatch {
                expected: 6,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_fortran_indexing() {
        // storage order for F: (0,0) (1,0) (0,1) (1,1) (0,2) (1,2)
        let arr =
            NpyArray::from_elements(vec![2, 3], ArrayOrder::F, &[0i32, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(arr.get(&[1, 2]).unwrap(), NpyValue::Int32(5));
        assert_eq!(arr.get(&[0, 1]).unwrap(), NpyValue::Int32(2));
        assert_eq!(arr.unravel_index(3).unwrap(), vec![1, 1]);
        assert_eq!(arr.ravel_index(&[1, 0]).unwrap(), 1);
        assert!(matches!(arr.get(&[2, 0]), Err(NpzError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn test_scalar_array() {
        let arr = NpyArray::from_elements(Vec::<usize>::new(), ArrayOrder::C, &[7.5f64]).unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr.get(&[]).unwrap(), NpyValue::Float64(7.5));
        assert_eq!(arr.unravel_index(0).unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn test_to_vec_big_endian() {
        let dtype = DType::primitive(ScalarKind::Int, 2, Endian::Big);
        let arr = NpyArray::new(dtype, vec![2], ArrayOrder::C, vec![0, 1, 1, 0]).unwrap();
        assert_eq!(arr.to_vec::<i16>().unwrap(), vec![1, 256]);
        assert!(arr.to_vec::<u16>().is_err());
        assert_eq!(arr.to_f64_vec().unwrap(), vec![1.0, 256.0]);
    }

    #[test]
    fn test_nested_field_selection() {
        let inner = DType::structured(vec![
            Field::new("x", f32::dtype()),
            Field::new("y", f32::dtype()),
        ])
        .unwrap();
        let dtype = DType::structured(vec![
            Field::new("id", u8::dtype()),
            Field::new("pos", inner),
        ])
        .unwrap();
        let rec = |id: u8, x: f32, y: f32| {
            NpyValue::Record(vec![
                ("id".into(), NpyValue::UInt8(id)),
                (
                    "pos".into(),
                    NpyValue::Record(vec![
                        ("x".into(), NpyValue::Float32(x)),
                        ("y".into(), NpyValue::Float32(y)),
                    ]),
                ),
            ])
        };
        let records = [rec(1, 0.5, 1.5), rec(2, 2.5, 3.5)];
        let arr = NpyArray::from_values(dtype, vec![2], ArrayOrder::C, &records).unwrap();
        assert_eq!(arr.data().len(), 18);
        assert_eq!(
            arr.field(&["pos", "y"]).unwrap(),
            vec![NpyValue::Float32(1.5), NpyValue::Float32(3.5)]
        );
        assert!(matches!(arr.field(&["pos", "z"]), Err(NpzError::NotFound(_))));
        assert_eq!(arr.get(&[1]).unwrap().get("id"), Some(&NpyValue::UInt8(2)));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let arr = NpyArray::from_elements(vec![2], ArrayOrder::C, &[1u8, 2]).unwrap();
        let mut bytes = arr.encode().unwrap();
        assert_eq!(NpyArray::decode(&bytes).unwrap(), arr);
        bytes.push(0);
        assert!(matches!(
            NpyArray::decode(&bytes),
            Err(NpzError::PayloadSizeMismatch { .. })
        ));
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            NpyArray::decode(&bytes),
            Err(NpzError::TruncatedPayload { expected: 2, available: 1, .. })
        ));
    }

    #[test]
    fn test_zero_sized_elements_are_bounded() {
        let empty = DType::Opaque { size: 0 };
        let few = NpyArray::new(empty, vec![3], ArrayOrder::C, Vec::new()).unwrap();
        assert_eq!(few.values().unwrap(), vec![NpyValue::Opaque(Vec::new()); 3]);

        let huge = NpyArray::new(
            DType::bytes(0),
            vec![1_000_000_000_000_000],
            ArrayOrder::C,
            Vec::new(),
        )
        .unwrap();
        let bytes = huge.encode().unwrap();
        assert_eq!(bytes.len(), 128);
        let back = NpyArray::decode(&bytes).unwrap();
        assert_eq!(back.len(), 1_000_000_000_000_000);
        assert!(matches!(back.values(), Err(NpzError::TypeConversion(_))));
        assert!(matches!(back.to_f64_vec(), Err(NpzError::TypeConversion(_))));
        assert!(back.get(&[999]).is_ok());
    }
}
