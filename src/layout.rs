//! Declarative byte layouts.
//!
//! Every fixed-size on-disk structure (boot sectors, partition entries,
//! directory records, MFT headers, attribute headers) is described once as a
//! table of fields and decoded by the single routine [`Layout::decode`].
//! Fields are little-endian unless their kind says otherwise. Derived values
//! are computed afterwards with [`Record::derive`], never while decoding.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{ExhumeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    I8,
    U16,
    /// Kept big-endian so the raw bit layout survives (FAT32 drive description).
    U16Be,
    U32,
    U64,
    Bytes(usize),
}

impl FieldKind {
    pub const fn width(&self) -> usize {
        match self {
            FieldKind::U8 | FieldKind::I8 => 1,
            FieldKind::U16 | FieldKind::U16Be => 2,
            FieldKind::U32 => 4,
            FieldKind::U64 => 8,
            FieldKind::Bytes(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Right after the previous field.
    Sequential,
    /// At a fixed offset from the start of the structure.
    At(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub placement: Placement,
    pub kind: FieldKind,
}

impl Field {
    pub const fn seq(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            placement: Placement::Sequential,
            kind,
        }
    }

    pub const fn at(name: &'static str, offset: usize, kind: FieldKind) -> Self {
        Self {
            name,
            placement: Placement::At(offset),
            kind,
        }
    }

    /// Unnamed padding, consumed but not stored.
    pub const fn skip(width: usize) -> Self {
        Self {
            name: "",
            placement: Placement::Sequential,
            kind: FieldKind::Bytes(width),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Magic {
    pub offset: usize,
    pub bytes: &'static [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub name: &'static str,
    pub fields: &'static [Field],
    pub magic: Option<Magic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Bytes(Vec<u8>),
}

/// The decoded field set of one structure instance.
#[derive(Debug, Clone)]
pub struct Record {
    structure: &'static str,
    values: Vec<(&'static str, Value)>,
}

impl Layout {
    pub const fn new(name: &'static str, fields: &'static [Field]) -> Self {
        Self {
            name,
            fields,
            magic: None,
        }
    }

    /// Terminal magic assertion, checked before any field is decoded.
    pub const fn with_magic(self, offset: usize, bytes: &'static [u8]) -> Self {
        Self {
            name: self.name,
            fields: self.fields,
            magic: Some(Magic { offset, bytes }),
        }
    }

    /// Bytes spanned by the fields and the magic.
    pub fn size(&self) -> usize {
        let mut pos = 0usize;
        let mut end = 0usize;
        for f in self.fields {
            if let Placement::At(off) = f.placement {
                pos = off;
            }
            pos += f.kind.width();
            end = end.max(pos);
        }
        if let Some(m) = self.magic {
            end = end.max(m.offset + m.bytes.len());
        }
        end
    }

    pub fn decode(&self, buf: &[u8]) -> Result<Record> {
        let needed = self.size();
        if buf.len() < needed {
            return Err(ExhumeError::Truncated {
                structure: self.name,
                needed,
                available: buf.len(),
            });
        }

        if let Some(m) = self.magic {
            let found = &buf[m.offset..m.offset + m.bytes.len()];
            if found != m.bytes {
                return Err(ExhumeError::BadMagic {
                    structure: self.name,
                    offset: m.offset,
                    expected: m.bytes.to_vec(),
                    found: found.to_vec(),
                });
            }
        }

        let mut cur = Cursor::new(buf);
        let mut values = Vec::with_capacity(self.fields.len());
        for f in self.fields {
            if let Placement::At(off) = f.placement {
                cur.set_position(off as u64);
            }
            let value = match f.kind {
                FieldKind::U8 => Value::Unsigned(cur.read_u8()?.into()),
                FieldKind::I8 => Value::Signed(cur.read_i8()?.into()),
                FieldKind::U16 => Value::Unsigned(cur.read_u16::<LittleEndian>()?.into()),
                FieldKind::U16Be => Value::Unsigned(cur.read_u16::<BigEndian>()?.into()),
                FieldKind::U32 => Value::Unsigned(cur.read_u32::<LittleEndian>()?.into()),
                FieldKind::U64 => Value::Unsigned(cur.read_u64::<LittleEndian>()?),
                FieldKind::Bytes(n) => {
                    let mut raw = vec![0u8; n];
                    cur.read_exact(&mut raw)?;
                    Value::Bytes(raw)
                }
            };
            if !f.name.is_empty() {
                values.push((f.name, value));
            }
        }

        Ok(Record {
            structure: self.name,
            values,
        })
    }

    /// Decode the structure found `offset` bytes into `buf`.
    pub fn decode_at(&self, buf: &[u8], offset: usize) -> Result<Record> {
        match buf.get(offset..) {
            Some(tail) => self.decode(tail),
            None => Err(ExhumeError::Truncated {
                structure: self.name,
                needed: offset + self.size(),
                available: buf.len(),
            }),
        }
    }
}

impl Record {
    fn get(&self, field: &'static str) -> Result<&Value> {
        self.values
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, v)| v)
            .ok_or(ExhumeError::MissingField {
                structure: self.structure,
                field,
            })
    }

    pub fn uint(&self, field: &'static str) -> Result<u64> {
        match self.get(field)? {
            Value::Unsigned(v) => Ok(*v),
            Value::Signed(v) => Ok(*v as u64),
            Value::Bytes(_) => Err(ExhumeError::MissingField {
                structure: self.structure,
                field,
            }),
        }
    }

    pub fn int(&self, field: &'static str) -> Result<i64> {
        match self.get(field)? {
            Value::Signed(v) => Ok(*v),
            Value::Unsigned(v) => Ok(*v as i64),
            Value::Bytes(_) => Err(ExhumeError::MissingField {
                structure: self.structure,
                field,
            }),
        }
    }

    pub fn bytes(&self, field: &'static str) -> Result<&[u8]> {
        match self.get(field)? {
            Value::Bytes(b) => Ok(b),
            _ => Err(ExhumeError::MissingField {
                structure: self.structure,
                field,
            }),
        }
    }

    /// Fixed-width OEM string: one char per byte, trailing spaces and NULs dropped.
    pub fn text(&self, field: &'static str) -> Result<String> {
        let raw = self.bytes(field)?;
        let s: String = raw.iter().map(|&b| char::from(b)).collect();
        Ok(s.trim_end_matches([' ', '\0']).to_string())
    }

    /// Compute a field from the ones already decoded and store it.
    pub fn derive<F>(&mut self, name: &'static str, compute: F) -> Result<()>
    where
        F: FnOnce(&Record) -> Result<Value>,
    {
        let value = compute(self)?;
        self.values.retain(|(n, _)| *n != name);
        self.values.push((name, value));
        Ok(())
    }
}
