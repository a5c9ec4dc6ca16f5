//! The fixed preamble of a single-array stream: magic, version, header length
//! and the padded header dict.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{NpzError, NpzResult};
use crate::metadata::descr::{descr_from_literal, write_descr};
use crate::metadata::literal::{Literal, LiteralValue, parse_literal, write_tuple};
use crate::types::{ArrayOrder, DType};

pub const MAGIC: [u8; 6] = *b"\x93NUMPY";

/// The payload always starts at a multiple of this many bytes.
pub const ALIGNMENT: usize = 64;

// ---------------------------------------------------------------------------
// FormatVersion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatVersion {
    pub major: u8,
    pub minor: u8,
}

impl FormatVersion {
    /// 2-byte header length, ASCII header text.
    pub const V1_0: FormatVersion = FormatVersion { major: 1, minor: 0 };
    /// 4-byte header length, ASCII header text.
    pub const V2_0: FormatVersion = FormatVersion { major: 2, minor: 0 };
    /// 4-byte header length, UTF-8 header text.
    pub const V3_0: FormatVersion = FormatVersion { major: 3, minor: 0 };

    pub fn is_supported(&self) -> bool {
        matches!(*self, Self::V1_0 | Self::V2_0 | Self::V3_0)
    }

    /// Width in bytes of the header-length field.
    pub fn length_field_size(&self) -> usize {
        if self.major == 1 { 2 } else { 4 }
    }

    /// Bytes before the header text: magic, version and length field.
    pub fn prefix_len(&self) -> usize {
        MAGIC.len() + 2 + self.length_field_size()
    }

    fn check(&self) -> NpzResult<()> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(NpzError::UnsupportedVersion {
                major: self.major,
                minor: self.minor,
            })
        }
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::V1_0
    }
}

// ---------------------------------------------------------------------------
// ArrayHeader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayHeader {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub order: ArrayOrder,
    /// On write this is a minimum; a later version is chosen when the header
    /// does not fit it.
    pub version: FormatVersion,
}

impl ArrayHeader {
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>, order: ArrayOrder) -> Self {
        Self {
            dtype,
            shape: shape.into(),
            order,
            version: FormatVersion::V1_0,
        }
    }

    /// Number of elements; 1 for a zero-dimensional array. `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
    }

    /// Expected payload length in bytes. `None` on overflow.
    pub fn payload_len(&self) -> Option<usize> {
        self.element_count()
            .and_then(|n| n.checked_mul(self.dtype.item_size()))
    }

    /// The unpadded header dict, keys in sorted order.
    pub fn header_text(&self) -> String {
        let mut out = String::from("{'descr': ");
        write_descr(&mut out, &self.dtype);
        out.push_str(", 'fortran_order': ");
        out.push_str(if self.order.is_fortran() { "True" } else { "False" });
        out.push_str(", 'shape': ");
        write_tuple(&mut out, &self.shape);
        out.push_str(", }");
        out
    }

    /// Serialise the full preamble (magic through the terminating newline).
    pub fn encode(&self) -> NpzResult<Vec<u8>> {
        self.version.check()?;
        self.dtype.validate()?;

        let text = self.header_text();
        let required = if !text.is_ascii() {
            FormatVersion::V3_0
        } else if padded_len(FormatVersion::V1_0, text.len()) - FormatVersion::V1_0.prefix_len()
            > u16::MAX as usize
        {
            FormatVersion::V2_0
        } else {
            FormatVersion::V1_0
        };
        let version = self.version.max(required);
        tracing::trace!(
            text_len = text.len(),
            major = version.major,
            minor = version.minor,
            "selected header version"
        );

        let prefix = version.prefix_len();
        let total = padded_len(version, text.len());
        let header_len = total - prefix;

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&MAGIC);
        out.push(version.major);
        out.push(version.minor);
        if version.length_field_size() == 2 {
            out.write_u16::<LittleEndian>(header_len as u16)?;
        } else {
            let len = u32::try_from(header_len).map_err(|_| {
                NpzError::header(prefix, format!("header of {header_len} bytes is too long"))
            })?;
            out.write_u32::<LittleEndian>(len)?;
        }
        out.extend_from_slice(text.as_bytes());
        out.resize(total - 1, b' ');
        out.push(b'\n');
        Ok(out)
    }

    /// Parse a preamble from the start of `bytes`. Returns the header and the
    /// offset at which the payload begins.
    pub fn decode(bytes: &[u8]) -> NpzResult<(ArrayHeader, usize)> {
        let mut reader = bytes;
        Self::read_from(&mut reader)
    }

    /// Read a preamble from `reader`, consuming exactly the preamble bytes.
    pub fn read_from<R: Read>(reader: &mut R) -> NpzResult<(ArrayHeader, usize)> {
        let mut magic = [0u8; 6];
        let n = read_fully(reader, &mut magic)?;
        if n < MAGIC.len() || magic != MAGIC {
            return Err(NpzError::BadMagic {
                found: magic[..n].to_vec(),
            });
        }

        let mut raw_version = [0u8; 2];
        if read_fully(reader, &mut raw_version)? < 2 {
            return Err(NpzError::header(MAGIC.len(), "stream ends before the version"));
        }
        let version = FormatVersion {
            major: raw_version[0],
            minor: raw_version[1],
        };
        version.check()?;

        let prefix = version.prefix_len();
        let header_len = if version.length_field_size() == 2 {
            reader.read_u16::<LittleEndian>().map(usize::from)
        } else {
            reader.read_u32::<LittleEndian>().map(|n| n as usize)
        }
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                NpzError::header(8, "stream ends inside the header length")
            }
            _ => NpzError::Io(e),
        })?;

        // Bounded by what is actually present, not by the declared length.
        let mut raw = Vec::new();
        reader.by_ref().take(header_len as u64).read_to_end(&mut raw)?;
        if raw.len() < header_len {
            return Err(NpzError::header(
                prefix + raw.len(),
                format!(
                    "header declares {header_len} bytes but only {} are present",
                    raw.len()
                ),
            ));
        }

        let data_offset = prefix + header_len;
        if data_offset % ALIGNMENT != 0 {
            tracing::warn!(data_offset, "array payload is not 64-byte aligned");
        }

        let text = header_text_from_bytes(raw, version, prefix)?;
        let (dtype, order, shape) = parse_header_text(&text, prefix)?;
        Ok((
            ArrayHeader {
                dtype,
                shape,
                order,
                version,
            },
            data_offset,
        ))
    }
}

/// Total preamble size for `text_len` bytes of header text: the text plus a
/// terminating newline, rounded up to [`ALIGNMENT`].
fn padded_len(version: FormatVersion, text_len: usize) -> usize {
    (version.prefix_len() + text_len + 1).div_ceil(ALIGNMENT) * ALIGNMENT
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn header_text_from_bytes(
    raw: Vec<u8>,
    version: FormatVersion,
    prefix: usize,
) -> NpzResult<String> {
    if version == FormatVersion::V3_0 {
        String::from_utf8(raw).map_err(|e| {
            NpzError::header(
                prefix + e.utf8_error().valid_up_to(),
                "header text is not valid UTF-8",
            )
        })
    } else {
        // Latin-1.
        Ok(raw.iter().map(|&b| b as char).collect())
    }
}

/// Split a header dict into descriptor, element order and shape. `base` is
/// the stream offset of the first text byte, used for error offsets.
pub fn parse_header_text(text: &str, base: usize) -> NpzResult<(DType, ArrayOrder, Vec<usize>)> {
    let text = text.trim_end();
    let lit = parse_literal(text).map_err(|e| NpzError::header(base + e.offset, e.reason))?;
    let LiteralValue::Dict(entries) = &lit.value else {
        return Err(NpzError::header(
            base + lit.offset,
            format!("header must be a dict, found {}", lit.kind_name()),
        ));
    };

    let mut descr = None;
    let mut order = None;
    let mut shape = None;
    for (key, value) in entries {
        let at = base + key.offset;
        match key.as_str() {
            Some("descr") if descr.is_none() => {
                descr = Some(descr_from_literal(value, text, base)?)
            }
            Some("fortran_order") if order.is_none() => {
                order = Some(match value.value {
                    LiteralValue::Bool(true) => ArrayOrder::F,
                    LiteralValue::Bool(false) => ArrayOrder::C,
                    _ => {
                        return Err(NpzError::header(
                            base + value.offset,
                            format!(
                                "'fortran_order' must be True or False, found {}",
                                value.kind_name()
                            ),
                        ));
                    }
                });
            }
            Some("shape") if shape.is_none() => shape = Some(parse_shape(value, base)?),
            Some(k @ ("descr" | "fortran_order" | "shape")) => {
                return Err(NpzError::header(at, format!("duplicate key '{k}'")));
            }
            Some(other) => return Err(NpzError::header(at, format!("unexpected key '{other}'"))),
            None => return Err(NpzError::header(at, "header keys must be strings")),
        }
    }

    let missing = |key: &str| NpzError::header(base, format!("header is missing '{key}'"));
    Ok((
        descr.ok_or_else(|| missing("descr"))?,
        order.ok_or_else(|| missing("fortran_order"))?,
        shape.ok_or_else(|| missing("shape"))?,
    ))
}

fn parse_shape(lit: &Literal, base: usize) -> NpzResult<Vec<usize>> {
    let LiteralValue::Tuple(dims) = &lit.value else {
        return Err(NpzError::header(
            base + lit.offset,
            format!("'shape' must be a tuple, found {}", lit.kind_name()),
        ));
    };
    dims.iter()
        .map(|d| match d.value {
            LiteralValue::Int(n) if n >= 0 => usize::try_from(n)
                .map_err(|_| NpzError::header(base + d.offset, "dimension out of range")),
            _ => Err(NpzError::header(
                base + d.offset,
                "dimensions must be non-negative integers",
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endian, Field, ScalarKind};

    fn i8_header(shape: &[usize]) -> ArrayHeader {
        ArrayHeader::new(
            DType::primitive(ScalarKind::Int, 8, Endian::Little),
            shape,
            ArrayOrder::C,
        )
    }

    #[test]
    fn encodes_canonical_preamble() {
        let bytes = i8_header(&[2, 3]).encode().unwrap();
        assert_eq!(&bytes[..8], b"\x93NUMPY\x01\x00");
        assert_eq!(bytes.len() % ALIGNMENT, 0);
        assert_eq!(bytes.last(), Some(&b'\n'));
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!(header_len + 10, bytes.len());

        let text = std::str::from_utf8(&bytes[10..]).unwrap();
        assert!(text.starts_with("{'descr': '<i8', 'fortran_order': False, 'shape': (2, 3), }"));

        let (decoded, offset) = ArrayHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, i8_header(&[2, 3]));
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn shapes_render_as_tuples() {
        let text = i8_header(&[5]).header_text();
        assert!(text.contains("'shape': (5,)"));
        let text = i8_header(&[]).header_text();
        assert!(text.contains("'shape': ()"));
    }

    fn wide_struct(fields: usize) -> DType {
        let f8 = DType::primitive(ScalarKind::Float, 8, Endian::Little);
        DType::structured(
            (0..fields)
                .map(|i| Field::new(format!("field_{i:05}"), f8.clone()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn long_headers_switch_to_four_byte_length() {
        let small = ArrayHeader::new(wide_struct(100), [1], ArrayOrder::C);
        let bytes = small.encode().unwrap();
        assert_eq!(bytes[6], 1);

        let large = ArrayHeader::new(wide_struct(4000), [1], ArrayOrder::C);
        assert!(large.header_text().len() > u16::MAX as usize);
        let bytes = large.encode().unwrap();
        assert_eq!(&bytes[6..8], &[2, 0]);
        assert_eq!(bytes.len() % ALIGNMENT, 0);
        let (decoded, offset) = ArrayHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.version, FormatVersion::V2_0);
        assert_eq!(decoded.dtype, large.dtype);
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn non_ascii_names_use_utf8_version() {
        let dt = DType::structured(vec![Field::new(
            "température",
            DType::primitive(ScalarKind::Float, 4, Endian::Little),
        )])
        .unwrap();
        let header = ArrayHeader::new(dt, [3], ArrayOrder::C);
        let bytes = header.encode().unwrap();
        assert_eq!(&bytes[6..8], &[3, 0]);
        let (decoded, _) = ArrayHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.dtype, header.dtype);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let err = ArrayHeader::decode(b"\x93NUMPZ\x01\x00").unwrap_err();
        assert!(matches!(err, NpzError::BadMagic { .. }));
        let err = ArrayHeader::decode(b"\x93NU").unwrap_err();
        assert!(matches!(err, NpzError::BadMagic { ref found } if found.len() == 3));

        let mut bytes = i8_header(&[1]).encode().unwrap();
        bytes[6] = 4;
        let err = ArrayHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, NpzError::UnsupportedVersion { major: 4, minor: 0 }));
    }

    #[test]
    fn rejects_truncated_header_without_allocating() {
        let mut bytes = b"\x93NUMPY\x02\x00".to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"{'descr'");
        let err = ArrayHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, NpzError::MalformedHeader { .. }));
    }

    #[test]
    fn accepts_legacy_alignment() {
        let text = b"{'descr': '<f4', 'fortran_order': True, 'shape': (4,), }      \n";
        let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
        bytes.extend_from_slice(&(text.len() as u16).to_le_bytes());
        bytes.extend_from_slice(text);
        let (header, offset) = ArrayHeader::decode(&bytes).unwrap();
        assert_eq!(header.order, ArrayOrder::F);
        assert_eq!(header.shape, vec![4]);
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn header_dict_must_have_exact_keys() {
        assert!(parse_header_text("{'descr': '<f4', 'shape': (4,)}", 10).is_err());
        assert!(
            parse_header_text("{'descr': '<f4', 'fortran_order': False, 'shape': (4,), 'x': 1}", 10)
                .is_err()
        );
        let text = "{'descr': '<f4', 'fortran_order': 0, 'shape': (4,)}";
        let err = parse_header_text(text, 10).unwrap_err();
        assert!(matches!(err, NpzError::MalformedHeader { offset: 44, .. }));
        let text = "{'descr': '<f4', 'fortran_order': False, 'shape': 4}";
        let err = parse_header_text(text, 10).unwrap_err();
        assert!(matches!(err, NpzError::MalformedHeader { .. }));
        // Keys in any order are accepted.
        let (dt, order, shape) =
            parse_header_text("{'shape': (), 'fortran_order': False, 'descr': '>u2'}", 10).unwrap();
        assert_eq!(dt, DType::primitive(ScalarKind::UInt, 2, Endian::Big));
        assert_eq!(order, ArrayOrder::C);
        assert!(shape.is_empty());
    }

    #[test]
    fn descriptor_errors_carry_stream_offsets() {
        let text = "{'descr': '<q8', 'fortran_order': False, 'shape': ()}";
        let err = parse_header_text(text, 10).unwrap_err();
        let NpzError::MalformedDescriptor { offset, fragment, .. } = err else {
            panic!("expected MalformedDescriptor");
        };
        assert_eq!(offset, 20);
        assert_eq!(fragment, "'<q8'");
    }
}
