//! The `descr` entry of an array header: either a quoted type string such as
//! `'<f8'` or a list of `(name, descr[, shape])` field tuples.

use std::fmt;

use crate::error::{NpzError, NpzResult};
use crate::metadata::literal::{Literal, LiteralValue, parse_literal, write_str, write_tuple};
use crate::types::{DType, Endian, Field, ScalarKind, StructType, TextEncoding};

// ---------------------------------------------------------------------------
// Type strings
// ---------------------------------------------------------------------------

/// Intermediate parsed representation of a type string.
#[derive(Debug)]
struct TypeStr {
    byte_order: char,
    type_code: char,
    size: usize,
}

/// Parse a bare type string (e.g. `"<f8"`, `">c8"`, `"|b1"`, `"<U16"`) into a
/// [`DType`].
pub fn parse_typestr(s: &str) -> Result<DType, String> {
    let ts = parse_type_str(s)?;
    type_str_to_dtype(&ts)
}

fn parse_type_str(s: &str) -> Result<TypeStr, String> {
    let mut chars = s.chars();
    let byte_order = chars
        .next()
        .ok_or_else(|| "empty type string".to_string())?;
    if Endian::from_marker(byte_order).is_none() {
        return Err(format!("invalid byte order {byte_order:?}"));
    }
    let type_code = chars
        .next()
        .ok_or_else(|| format!("type string too short: {s}"))?;
    let rest = chars.as_str();
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid byte size {rest:?}"));
    }
    let size: usize = rest
        .parse()
        .map_err(|_| format!("byte size out of range: {rest}"))?;
    Ok(TypeStr {
        byte_order,
        type_code,
        size,
    })
}

fn type_str_to_dtype(ts: &TypeStr) -> Result<DType, String> {
    let endian = Endian::from_marker(ts.byte_order)
        .ok_or_else(|| format!("invalid byte order {:?}", ts.byte_order))?;
    let dtype = match ts.type_code {
        'b' => DType::primitive(ScalarKind::Bool, ts.size, endian),
        'i' => DType::primitive(ScalarKind::Int, ts.size, endian),
        'u' => DType::primitive(ScalarKind::UInt, ts.size, endian),
        'f' => DType::primitive(ScalarKind::Float, ts.size, endian),
        'c' => match ts.size {
            8 | 16 => DType::Complex {
                component_width: ts.size / 2,
                endian,
            },
            other => return Err(format!("unsupported complex width {other}")),
        },
        'S' => DType::Text {
            encoding: TextEncoding::Bytes,
            length: ts.size,
            endian,
        },
        'U' => DType::Text {
            encoding: TextEncoding::Unicode,
            length: ts.size,
            endian,
        },
        'V' => {
            if endian != Endian::NotApplicable {
                return Err(format!("void type must use '|', got {:?}", ts.byte_order));
            }
            DType::Opaque { size: ts.size }
        }
        other => return Err(format!("unrecognized kind {other:?}")),
    };
    dtype.validate().map_err(|e| match e {
        NpzError::InvalidDType(msg) => msg,
        other => other.to_string(),
    })?;
    Ok(dtype)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse descriptor text (the Python literal stored under `descr`).
pub fn parse_descr(text: &str) -> NpzResult<DType> {
    let lit = parse_literal(text).map_err(|e| {
        let fragment = text.get(e.offset..).unwrap_or_default();
        NpzError::descriptor(e.offset, fragment, e.reason)
    })?;
    descr_from_literal(&lit, text, 0)
}

/// Interpret an already-parsed literal as a descriptor. `src` is the text the
/// literal was parsed from; `base` is added to every reported offset.
pub fn descr_from_literal(lit: &Literal, src: &str, base: usize) -> NpzResult<DType> {
    let ctx = Ctx { src, base };
    match &lit.value {
        LiteralValue::Str(s) => parse_typestr(s).map_err(|reason| ctx.error(lit, reason)),
        LiteralValue::List(items) => ctx.fields(lit, items),
        _ => Err(ctx.error(
            lit,
            format!("expected a type string or field list, found {}", lit.kind_name()),
        )),
    }
}

struct Ctx<'a> {
    src: &'a str,
    base: usize,
}

impl Ctx<'_> {
    fn error(&self, lit: &Literal, reason: impl Into<String>) -> NpzError {
        let fragment = self.src.get(lit.offset..lit.end).unwrap_or_default();
        NpzError::descriptor(self.base + lit.offset, fragment, reason)
    }

    fn fields(&self, list: &Literal, items: &[Literal]) -> NpzResult<DType> {
        if items.is_empty() {
            return Err(self.error(list, "empty field list"));
        }

        let mut fields: Vec<Field> = Vec::with_capacity(items.len());
        let mut cursor = 0usize;
        let mut after_padding = false;
        for item in items {
            let LiteralValue::Tuple(parts) = &item.value else {
                return Err(self.error(item, "expected a (name, type[, shape]) tuple"));
            };
            if parts.len() < 2 || parts.len() > 3 {
                return Err(self.error(
                    item,
                    format!("field tuple must have 2 or 3 entries, found {}", parts.len()),
                ));
            }

            let name = parts[0]
                .as_str()
                .ok_or_else(|| self.error(&parts[0], "field name must be a string"))?;

            let dtype = match &parts[1].value {
                LiteralValue::Str(s) => {
                    parse_typestr(s).map_err(|reason| self.error(&parts[1], reason))?
                }
                LiteralValue::List(sub) => self.fields(&parts[1], sub)?,
                _ => {
                    return Err(self.error(
                        &parts[1],
                        format!("unsupported field type {}", parts[1].kind_name()),
                    ));
                }
            };

            let shape = match parts.get(2) {
                Some(lit) => self.sub_shape(lit)?,
                None => Vec::new(),
            };

            let field = Field::new(name, dtype).with_shape(shape).at_offset(cursor);
            cursor = field
                .end()
                .ok_or_else(|| self.error(item, "field size overflows"))?;

            // Unnamed void entries are alignment padding. Only the form the
            // serialiser writes is accepted: one non-empty entry per gap.
            if name.is_empty() && matches!(field.dtype, DType::Opaque { .. }) {
                if after_padding {
                    return Err(self.error(item, "adjacent padding entries"));
                }
                if field.size() == 0 {
                    return Err(self.error(item, "empty padding entry"));
                }
                after_padding = true;
                continue;
            }
            after_padding = false;
            if name.is_empty() {
                return Err(self.error(&parts[0], "empty field name"));
            }
            if fields.iter().any(|f| f.name == name) {
                return Err(self.error(&parts[0], format!("duplicate field name {name:?}")));
            }
            fields.push(field);
        }

        if fields.is_empty() {
            return Err(self.error(list, "field list holds only padding"));
        }

        DType::structured_with_layout(fields, Some(cursor))
            .map_err(|e| self.error(list, e.to_string()))
    }

    fn sub_shape(&self, lit: &Literal) -> NpzResult<Vec<usize>> {
        let dims = match &lit.value {
            LiteralValue::Tuple(dims) => dims.as_slice(),
            _ => return Err(self.error(lit, "field shape must be a tuple")),
        };
        dims.iter()
            .map(|d| match d.value {
                LiteralValue::Int(n) if n >= 0 => usize::try_from(n)
                    .map_err(|_| self.error(d, "field dimension out of range")),
                _ => Err(self.error(d, "field dimension must be a non-negative integer")),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Serialisation
// ---------------------------------------------------------------------------

/// Type string of a non-structured dtype, e.g. `<f8`.
pub fn typestr(dtype: &DType) -> Option<String> {
    let (endian, code, size) = match dtype {
        DType::Primitive {
            kind,
            width,
            endian,
        } => (*endian, kind.code(), *width),
        DType::Complex {
            component_width,
            endian,
        } => (*endian, 'c', component_width * 2),
        DType::Text {
            encoding,
            length,
            endian,
        } => (*endian, encoding.code(), *length),
        DType::Opaque { size } => (Endian::NotApplicable, 'V', *size),
        DType::Structured(_) => return None,
    };
    Some(format!("{}{code}{size}", endian.marker()))
}

/// Render the descriptor literal for `dtype`.
pub fn descr_string(dtype: &DType) -> String {
    let mut out = String::new();
    write_descr(&mut out, dtype);
    out
}

pub fn write_descr(out: &mut String, dtype: &DType) {
    match (dtype, typestr(dtype)) {
        (DType::Structured(s), _) => write_fields(out, s),
        (_, Some(ts)) => write_str(out, &ts),
        (_, None) => {}
    }
}

fn write_fields(out: &mut String, s: &StructType) {
    out.push('[');
    let mut first = true;
    let mut cursor = 0usize;
    for field in s.fields() {
        if field.offset > cursor {
            write_padding(out, &mut first, field.offset - cursor);
        }
        separator(out, &mut first);
        out.push('(');
        write_str(out, &field.name);
        out.push_str(", ");
        write_descr(out, &field.dtype);
        if !field.shape.is_empty() {
            out.push_str(", ");
            write_tuple(out, &field.shape);
        }
        out.push(')');
        cursor = field.offset + field.size();
    }
    if s.item_size() > cursor {
        write_padding(out, &mut first, s.item_size() - cursor);
    }
    out.push(']');
}

fn write_padding(out: &mut String, first: &mut bool, size: usize) {
    separator(out, first);
    out.push_str("('', ");
    write_str(out, &format!("|V{size}"));
    out.push(')');
}

fn separator(out: &mut String, first: &mut bool) {
    if !*first {
        out.push_str(", ");
    }
    *first = false;
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&descr_string(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(text: &str) -> DType {
        let dt = parse_descr(text).unwrap();
        assert_eq!(descr_string(&dt), text);
        dt
    }

    #[test]
    fn scalar_type_strings() {
        let dt = roundtrip("'<i8'");
        assert_eq!(dt, DType::primitive(ScalarKind::Int, 8, Endian::Little));

        let dt = roundtrip("'>c8'");
        assert_eq!(
            dt,
            DType::Complex {
                component_width: 4,
                endian: Endian::Big
            }
        );
        assert_eq!(dt.item_size(), 8);

        assert_eq!(roundtrip("'|b1'").item_size(), 1);
        assert_eq!(roundtrip("'<U16'").item_size(), 64);
        assert_eq!(roundtrip("'|S5'").item_size(), 5);
        assert_eq!(roundtrip("'=f4'").item_size(), 4);
        // Single-byte kinds keep whatever marker they were written with.
        roundtrip("'<u1'");
    }

    #[test]
    fn structured_fields() {
        let dt = roundtrip("[('name', '<U16'), ('grades', '<f8', (2,))]");
        assert_eq!(dt.item_size(), 80);
        let grades = dt.field("grades").unwrap();
        assert_eq!(grades.offset, 64);
        assert_eq!(grades.shape, vec![2]);
    }

    #[test]
    fn nested_structured_fields() {
        let text = "[('year', '<u4'), ('countries', [\
                    ('c1', [('country', '<U16'), ('gdp', '<u8')]), \
                    ('c2', [('country', '<U16'), ('gdp', '<u8')]), \
                    ('c3', [('country', '<U16'), ('gdp', '<u8')])])]";
        let dt = roundtrip(text);
        assert_eq!(dt.item_size(), 4 + 3 * 72);
        let countries = dt.field("countries").unwrap();
        assert_eq!(countries.offset, 4);
        let c2 = countries.dtype.field("c2").unwrap();
        assert_eq!(c2.offset, 72);
        assert_eq!(c2.dtype.field("gdp").unwrap().offset, 64);
    }

    #[test]
    fn padding_entries_round_trip() {
        let dt = roundtrip("[('a', '|u1'), ('', '|V7'), ('b', '<f8'), ('', '|V8')]");
        assert_eq!(dt.item_size(), 24);
        let DType::Structured(s) = &dt else {
            panic!("expected struct");
        };
        assert_eq!(s.fields().len(), 2);
        assert_eq!(s.fields()[1].offset, 8);
    }

    #[test]
    fn explicit_layout_serialises_padding() {
        let dt = DType::structured_with_layout(
            vec![
                Field::new("a", DType::primitive(ScalarKind::Int, 2, Endian::Big)),
                Field::new("b", DType::bytes(3)).at_offset(4),
            ],
            Some(8),
        )
        .unwrap();
        assert_eq!(
            descr_string(&dt),
            "[('a', '>i2'), ('', '|V2'), ('b', '|S3'), ('', '|V1')]"
        );
        assert_eq!(parse_descr(&descr_string(&dt)).unwrap(), dt);
    }

    #[test]
    fn rejects_bad_descriptors_with_offsets() {
        let err = parse_descr("'<x4'").unwrap_err();
        assert!(matches!(err, NpzError::MalformedDescriptor { offset: 0, .. }));

        let err = parse_descr("[('a', '<i4'), ('b', '<i3')]").unwrap_err();
        let NpzError::MalformedDescriptor {
            offset, fragment, ..
        } = err
        else {
            panic!("expected MalformedDescriptor");
        };
        assert_eq!(offset, 21);
        assert_eq!(fragment, "'<i3'");

        assert!(parse_descr("'|i4'").is_err());
        assert!(parse_descr("'<c4'").is_err());
        assert!(parse_descr("[('a',)]").is_err());
        assert!(parse_descr("[('a', '<i4'), ('a', '<i4')]").is_err());
        assert!(parse_descr("[]").is_err());
        assert!(parse_descr("[('a', '<i4', (-1,))]").is_err());
        assert!(parse_descr("'<M8[ns]'").is_err());
    }

    #[test]
    fn rejects_non_canonical_field_forms() {
        let text = "[('a', '|u1'), ('', '|V1'), ('', '|V2'), ('b', '<i4')]";
        let err = parse_descr(text).unwrap_err();
        assert!(matches!(err, NpzError::MalformedDescriptor { offset: 28, .. }));

        let err = parse_descr("[('a', '|u1'), ('', '|V0'), ('b', '<i4')]").unwrap_err();
        assert!(matches!(err, NpzError::MalformedDescriptor { offset: 15, .. }));

        let err = parse_descr("[('x', '<f8', 3)]").unwrap_err();
        let NpzError::MalformedDescriptor { offset, fragment, .. } = err else {
            panic!("expected MalformedDescriptor");
        };
        assert_eq!((offset, fragment.as_str()), (14, "3"));
    }
}
