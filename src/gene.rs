//! Gene layouts: fixed-shape records stored in a Spirit's linear memory.
//!
//! Fields are placed in declaration order at the lowest offset satisfying
//! their alignment. A gene aligns to its widest field and its size is padded
//! to a multiple of that alignment, so layouts agree with the ones the DOL
//! compiler emits.
//!
//! | Field type | Stored as        | Size | Alignment |
//! |------------|------------------|------|-----------|
//! | `I32`      | i32              | 4    | 4         |
//! | `I64`      | i64              | 8    | 8         |
//! | `F32`      | f32              | 4    | 4         |
//! | `F64`      | f64              | 8    | 8         |
//! | `Bool`     | i32, nonzero=true| 4    | 4         |
//! | `String`   | i32 address      | 4    | 4         |

use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    I32,
    I64,
    F32,
    F64,
    Bool,
    /// Address of a length-prefixed UTF-8 string; 0 reads back as "".
    String,
}

impl FieldType {
    pub fn size(self) -> u32 {
        match self {
            FieldType::I32 | FieldType::F32 | FieldType::Bool | FieldType::String => 4,
            FieldType::I64 | FieldType::F64 => 8,
        }
    }

    /// Primitive types are naturally aligned.
    pub fn alignment(self) -> u32 {
        self.size()
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::I32 => write!(f, "i32"),
            FieldType::I64 => write!(f, "i64"),
            FieldType::F32 => write!(f, "f32"),
            FieldType::F64 => write!(f, "f64"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::String => write!(f, "string"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub ty: FieldType,
    /// Byte offset from the gene's base address.
    pub offset: u32,
}

/// Immutable layout of one gene. Layouts describe memory, they never own it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneLayout {
    name: String,
    fields: Vec<FieldLayout>,
    size: u32,
    alignment: u32,
}

impl GeneLayout {
    /// Compute the layout for `fields` in declaration order.
    pub fn new<N: Into<String>>(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (N, FieldType)>,
    ) -> Result<Self> {
        let name = name.into();
        let mut seen = HashSet::new();
        let mut laid_out = Vec::new();
        let mut offset = 0u32;
        let mut alignment = 1u32;

        for (field_name, ty) in fields {
            let field_name = field_name.into();
            if !seen.insert(field_name.clone()) {
                return Err(Error::Field {
                    gene: name,
                    field: field_name,
                    reason: "declared more than once".to_string(),
                });
            }
            offset = align_up(offset, ty.alignment());
            laid_out.push(FieldLayout {
                name: field_name,
                ty,
                offset,
            });
            offset += ty.size();
            alignment = alignment.max(ty.alignment());
        }

        Ok(Self {
            name,
            fields: laid_out,
            size: align_up(offset, alignment),
            alignment,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A single field value read from or written to linear memory.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    /// A decoded string field, as produced by reads.
    Str(String),
    /// The address of an already-encoded string, as expected by writes.
    Address(u32),
}

impl FieldValue {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            FieldValue::I32(_) => "i32",
            FieldValue::I64(_) => "i64",
            FieldValue::F32(_) => "f32",
            FieldValue::F64(_) => "f64",
            FieldValue::Bool(_) => "bool",
            FieldValue::Str(_) => "decoded string",
            FieldValue::Address(_) => "string address",
        }
    }
}

/// Field name to value map for one gene instance.
pub type Record = BTreeMap<String, FieldValue>;

/// Round `offset` up to `alignment`, which must be a power of two.
#[inline]
pub fn align_up(offset: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of 2");
    (offset + alignment - 1) & !(alignment - 1)
}
