use crate::error::{NpzError, NpzResult};

// ---------------------------------------------------------------------------
// Endian
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
    Native,
    NotApplicable,
}

impl Endian {
    /// Map a descriptor byte-order marker (`<`, `>`, `=`, `|`) to an [`Endian`].
    pub fn from_marker(c: char) -> Option<Self> {
        match c {
            '<' => Some(Endian::Little),
            '>' => Some(Endian::Big),
            '=' => Some(Endian::Native),
            '|' => Some(Endian::NotApplicable),
            _ => None,
        }
    }

    pub fn marker(&self) -> char {
        match self {
            Endian::Little => '<',
            Endian::Big => '>',
            Endian::Native => '=',
            Endian::NotApplicable => '|',
        }
    }

    /// Whether multi-byte values carrying this marker are stored big-endian
    /// on the current host.
    pub fn is_big(&self) -> bool {
        match self {
            Endian::Big => true,
            Endian::Native => cfg!(target_endian = "big"),
            Endian::Little | Endian::NotApplicable => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ArrayOrder
// ---------------------------------------------------------------------------

/// Element order of the payload: `C` is row-major (last index varies
/// fastest), `F` is column-major (first index varies fastest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArrayOrder {
    #[default]
    C,
    F,
}

impl ArrayOrder {
    pub fn is_fortran(&self) -> bool {
        matches!(self, ArrayOrder::F)
    }
}

// ---------------------------------------------------------------------------
// DType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Int,
    UInt,
    Float,
}

impl ScalarKind {
    pub fn code(&self) -> char {
        match self {
            ScalarKind::Bool => 'b',
            ScalarKind::Int => 'i',
            ScalarKind::UInt => 'u',
            ScalarKind::Float => 'f',
        }
    }

    fn allows_width(&self, width: usize) -> bool {
        match self {
            ScalarKind::Bool => width == 1,
            ScalarKind::Int | ScalarKind::UInt => matches!(width, 1 | 2 | 4 | 8),
            ScalarKind::Float => matches!(width, 2 | 4 | 8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextEncoding {
    /// One byte per character (`S`).
    Bytes,
    /// Four-byte UTF-32 code units (`U`).
    Unicode,
}

impl TextEncoding {
    pub fn code(&self) -> char {
        match self {
            TextEncoding::Bytes => 'S',
            TextEncoding::Unicode => 'U',
        }
    }

    pub fn unit_size(&self) -> usize {
        match self {
            TextEncoding::Bytes => 1,
            TextEncoding::Unicode => 4,
        }
    }
}

/// Binary layout of one array element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DType {
    Primitive {
        kind: ScalarKind,
        width: usize,
        endian: Endian,
    },
    /// Complex number made of two floats of `component_width` bytes each.
    Complex {
        component_width: usize,
        endian: Endian,
    },
    /// Fixed-width text of `length` characters.
    Text {
        encoding: TextEncoding,
        length: usize,
        endian: Endian,
    },
    /// Raw bytes (`|V<n>`).
    Opaque { size: usize },
    Structured(StructType),
}

impl DType {
    pub fn primitive(kind: ScalarKind, width: usize, endian: Endian) -> Self {
        DType::Primitive {
            kind,
            width,
            endian,
        }
    }

    /// Little-endian unicode text of `length` characters (`<U{length}`).
    pub fn unicode(length: usize) -> Self {
        DType::Text {
            encoding: TextEncoding::Unicode,
            length,
            endian: Endian::Little,
        }
    }

    /// Byte text of `length` bytes (`|S{length}`).
    pub fn bytes(length: usize) -> Self {
        DType::Text {
            encoding: TextEncoding::Bytes,
            length,
            endian: Endian::NotApplicable,
        }
    }

    /// Structured type with fields packed tightly in declaration order. Any
    /// offsets already set on `fields` are ignored.
    pub fn structured(fields: Vec<Field>) -> NpzResult<Self> {
        let mut cursor = 0usize;
        let mut packed = Vec::with_capacity(fields.len());
        for mut field in fields {
            field.offset = cursor;
            cursor = field
                .checked_size()
                .and_then(|size| cursor.checked_add(size))
                .ok_or_else(|| {
                    NpzError::InvalidDType(format!("field '{}' size overflows", field.name))
                })?;
            packed.push(field);
        }
        DType::structured_with_layout(packed, None)
    }

    /// Structured type honouring each field's explicit `offset`. Fields must
    /// be listed in ascending, non-overlapping offset order; `item_size`
    /// defaults to the end of the last field.
    pub fn structured_with_layout(fields: Vec<Field>, item_size: Option<usize>) -> NpzResult<Self> {
        if fields.is_empty() {
            return Err(NpzError::InvalidDType(
                "structured type needs at least one field".into(),
            ));
        }

        let mut cursor = 0usize;
        for (i, field) in fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(NpzError::InvalidDType(format!("field {i} has an empty name")));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(NpzError::InvalidDType(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
            field.dtype.validate()?;
            if field.offset < cursor {
                return Err(NpzError::InvalidDType(format!(
                    "field '{}' at offset {} overlaps the previous field ending at {cursor}",
                    field.name, field.offset
                )));
            }
            cursor = field.end().ok_or_else(|| {
                NpzError::InvalidDType(format!("field '{}' size overflows", field.name))
            })?;
        }

        let item_size = match item_size {
            Some(size) if size < cursor => {
                return Err(NpzError::InvalidDType(format!(
                    "item size {size} is smaller than the field extent {cursor}"
                )));
            }
            Some(size) => size,
            None => cursor,
        };

        Ok(DType::Structured(StructType { fields, item_size }))
    }

    /// Number of bytes one element occupies.
    pub fn item_size(&self) -> usize {
        match self {
            DType::Primitive { width, .. } => *width,
            DType::Complex {
                component_width, ..
            } => component_width * 2,
            DType::Text {
                encoding, length, ..
            } => length.saturating_mul(encoding.unit_size()),
            DType::Opaque { size } => *size,
            DType::Structured(s) => s.item_size,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, DType::Structured(_))
    }

    /// Look up a direct field of a structured type.
    pub fn field(&self, name: &str) -> Option<&Field> {
        match self {
            DType::Structured(s) => s.field(name),
            _ => None,
        }
    }

    /// Check widths and byte-order markers. Multi-byte kinds must carry an
    /// explicit byte order.
    pub fn validate(&self) -> NpzResult<()> {
        match self {
            DType::Primitive {
                kind,
                width,
                endian,
            } => {
                if !kind.allows_width(*width) {
                    return Err(NpzError::InvalidDType(format!(
                        "unsupported width {width} for kind '{}'",
                        kind.code()
                    )));
                }
                require_byte_order(*width > 1, *endian, self)
            }
            DType::Complex {
                component_width,
                endian,
            } => {
                if !matches!(component_width, 4 | 8) {
                    return Err(NpzError::InvalidDType(format!(
                        "unsupported complex component width {component_width}"
                    )));
                }
                require_byte_order(true, *endian, self)
            }
            DType::Text {
                encoding, length, endian,
            } => {
                if length.checked_mul(encoding.unit_size()).is_none() {
                    return Err(NpzError::InvalidDType(format!(
                        "text length {length} overflows"
                    )));
                }
                require_byte_order(encoding.unit_size() > 1, *endian, self)
            }
            DType::Opaque { .. } => Ok(()),
            // Layout was checked when the struct was built.
            DType::Structured(_) => Ok(()),
        }
    }
}

fn require_byte_order(multi_byte: bool, endian: Endian, dtype: &DType) -> NpzResult<()> {
    if multi_byte && endian == Endian::NotApplicable {
        return Err(NpzError::InvalidDType(format!(
            "{dtype:?} needs an explicit byte order"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// StructType / Field
// ---------------------------------------------------------------------------

/// Ordered, offset-positioned fields of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructType {
    fields: Vec<Field>,
    item_size: usize,
}

impl StructType {
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub dtype: DType,
    /// Sub-array shape; empty for a scalar field.
    pub shape: Vec<usize>,
    pub offset: usize,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: Vec::new(),
            offset: 0,
        }
    }

    pub fn with_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.shape = shape.into();
        self
    }

    pub fn at_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Number of dtype elements in the field (1 for scalar fields).
    pub fn count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Byte size of the field including its sub-array shape.
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    pub(crate) fn checked_size(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(self.dtype.item_size(), |acc, d| acc.checked_mul(*d))
    }

    pub(crate) fn end(&self) -> Option<usize> {
        self.checked_size()
            .and_then(|size| self.offset.checked_add(size))
    }
}
