//! Plain images: a type's native static layout, raw addresses included.
//!
//! Direct codec nodes store exactly this image, and views over Direct nodes
//! navigate it.  Indirections read back as [`Value::Address`] and
//! [`Value::RawSlice`]; nothing here ever follows an address.

use byteorder::{ByteOrder, NativeEndian};

use crate::config::IntWidth;
use crate::engine::{load_address, load_uint, store_address, store_uint, sub, sub_mut, Region};
use crate::error::{Error, Result, SchemaError};
use crate::schema::{Kind, Primitive, Schema, TypeId};
use crate::value::Value;

/// Whether `ty` is `u8`, whose sequences read back as [`Value::Bytes`].
pub(crate) fn is_byte(schema: &Schema, ty: TypeId) -> bool {
    matches!(schema.kind(ty), Kind::Primitive(Primitive::U8))
}

pub(crate) fn member_index(names: impl Iterator<Item = impl AsRef<str>>, name: &str) -> Result<usize> {
    names
        .into_iter()
        .position(|n| n.as_ref() == name)
        .ok_or_else(|| Error::NoSuchMember(name.to_owned()))
}

// ── Primitives ───────────────────────────────────────────────────────────────

pub(crate) fn write_primitive(p: Primitive, value: &Value, out: &mut [u8]) -> Result<()> {
    let out = sub_mut(out, 0, p.layout().size)?;
    let out_of_range = |v: &dyn std::fmt::Display| Error::OutOfRange { value: v.to_string(), ty: p.name() };

    match p {
        Primitive::Bool => match value {
            Value::Bool(b) => out[0] = u8::from(*b),
            other => return Err(other.mismatch("bool")),
        },
        Primitive::F32 => match value {
            Value::Float(f) => NativeEndian::write_f32(out, *f as f32),
            other => return Err(other.mismatch("float")),
        },
        Primitive::F64 => match value {
            Value::Float(f) => NativeEndian::write_f64(out, *f),
            other => return Err(other.mismatch("float")),
        },
        _ => {
            let width = p.int_width().unwrap_or(IntWidth::U64);
            let bits = width.size() * 8;
            let raw = if p.is_signed() {
                let v = match value {
                    Value::Int(v) => *v,
                    Value::Uint(v) => i64::try_from(*v).map_err(|_| out_of_range(v))?,
                    other => return Err(other.mismatch("integer")),
                };
                if bits < 64 && (v < -(1i64 << (bits - 1)) || v >= 1i64 << (bits - 1)) {
                    return Err(out_of_range(&v));
                }
                v as u64
            } else {
                let v = match value {
                    Value::Uint(v) => *v,
                    Value::Int(v) => u64::try_from(*v).map_err(|_| out_of_range(v))?,
                    other => return Err(other.mismatch("integer")),
                };
                if v > width.max_value() {
                    return Err(out_of_range(&v));
                }
                v
            };
            store_uint(out, 0, width, raw)?;
        }
    }
    Ok(())
}

pub(crate) fn read_primitive(p: Primitive, bytes: &[u8]) -> Result<Value> {
    let bytes = sub(bytes, 0, p.layout().size)?;
    Ok(match p {
        Primitive::Bool => Value::Bool(bytes[0] != 0),
        Primitive::F32 => Value::Float(f64::from(NativeEndian::read_f32(bytes))),
        Primitive::F64 => Value::Float(NativeEndian::read_f64(bytes)),
        _ => {
            let width = p.int_width().unwrap_or(IntWidth::U64);
            let raw = load_uint(bytes, 0, width)?;
            if p.is_signed() {
                let shift = 64 - width.size() * 8;
                Value::Int(((raw << shift) as i64) >> shift)
            } else {
                Value::Uint(raw)
            }
        }
    })
}

// ── Images ───────────────────────────────────────────────────────────────────

pub(crate) fn write(schema: &Schema, ty: TypeId, value: &Value, out: &mut [u8]) -> Result<()> {
    let def = schema.def(ty);
    let plain = schema.plain(ty);

    match &def.kind {
        Kind::Void => match value {
            Value::Void => Ok(()),
            other => Err(other.mismatch("void")),
        },

        Kind::Primitive(p) => write_primitive(*p, value, out),

        Kind::Enum { repr, variants } => {
            let Value::Enum(name) = value else {
                return Err(value.mismatch("enum variant"));
            };
            let (_, d) = variants
                .iter()
                .find(|(n, _)| n == name)
                .ok_or_else(|| Error::UnknownVariant(name.clone()))?;
            write_primitive(*repr, &Value::Int(*d), out)
        }

        Kind::Pointer { .. } | Kind::UnknownPointer { .. } => {
            let optional = matches!(def.kind, Kind::Pointer { optional: true, .. });
            let (address, present) = match value {
                Value::Address(a) => (*a, 1),
                Value::Null if optional => (0, 0),
                other => return Err(other.mismatch("raw address")),
            };
            store_address(out, 0, address)?;
            if let Some(at) = plain.tag {
                store_uint(out, at, IntWidth::U8, present)?;
            }
            Ok(())
        }

        Kind::Slice { optional, .. } => {
            let (addr, len) = match value {
                Value::RawSlice { addr, len } => (*addr, *len as u64),
                Value::Null if *optional => (0, IntWidth::NATIVE.max_value()),
                other => return Err(other.mismatch("raw slice")),
            };
            store_address(out, plain.offsets[0], addr)?;
            store_uint(out, plain.offsets[1], IntWidth::NATIVE, len)
        }

        Kind::Array { elem, len } => {
            let items = value.items()?;
            if items.len() != *len {
                return Err(Error::LengthMismatch { expected: *len, found: items.len() });
            }
            let es = schema.plain(*elem).layout.size;
            for i in 0..*len {
                write(schema, *elem, &items.get(i), sub_mut(out, i * es, es)?)?;
            }
            Ok(())
        }

        Kind::Record { fields, .. } => {
            for (f, &offset) in fields.iter().zip(&plain.offsets) {
                let size = schema.plain(f.ty).layout.size;
                write(schema, f.ty, value.require_field(&f.name)?, sub_mut(out, offset, size)?)?;
            }
            Ok(())
        }

        Kind::Union { arms, tag } => {
            let size = plain.layout.size;
            match (value, tag, plain.tag) {
                (Value::Bytes(raw), None, _) if raw.len() == size => {
                    sub_mut(out, 0, size)?.copy_from_slice(raw);
                    Ok(())
                }
                (Value::Union(name, inner), _, tag_at) => {
                    let idx = member_index(arms.iter().map(|a| &a.name), name)?;
                    sub_mut(out, 0, size)?.fill(0);
                    if let (Some(width), Some(at)) = (tag, tag_at) {
                        store_uint(out, at, *width, idx as u64)?;
                    }
                    let arm = &arms[idx];
                    let arm_size = schema.plain(arm.ty).layout.size;
                    write(schema, arm.ty, inner, sub_mut(out, plain.offsets[idx], arm_size)?)
                }
                (other, _, _) => Err(other.mismatch("union")),
            }
        }

        Kind::Optional(inner) => {
            let Value::Optional(payload) = value else {
                return Err(value.mismatch("optional"));
            };
            sub_mut(out, 0, plain.layout.size)?.fill(0);
            let tag_at = plain.tag.unwrap_or(0);
            match payload {
                None => store_uint(out, tag_at, IntWidth::U8, 0),
                Some(v) => {
                    store_uint(out, tag_at, IntWidth::U8, 1)?;
                    let size = schema.plain(*inner).layout.size;
                    write(schema, *inner, v, sub_mut(out, plain.offsets[0], size)?)
                }
            }
        }

        Kind::Result { ok } => {
            let Value::Result(result) = value else {
                return Err(value.mismatch("result"));
            };
            sub_mut(out, 0, plain.layout.size)?.fill(0);
            let tag_at = plain.tag.unwrap_or(0);
            match result {
                Ok(v) => {
                    store_uint(out, tag_at, IntWidth::U8, 0)?;
                    let size = schema.plain(*ok).layout.size;
                    write(schema, *ok, v, sub_mut(out, plain.offsets[0], size)?)
                }
                Err(code) => {
                    store_uint(out, tag_at, IntWidth::U8, 1)?;
                    store_uint(out, plain.offsets[1], IntWidth::U16, u64::from(*code))
                }
            }
        }

        Kind::Custom(codec) => {
            if codec.dynamic().is_some() {
                return Err(Error::WrongShape { op: "write", shape: "custom codec with dynamic payload in a raw image" });
            }
            codec.write(value, out, &mut Region::empty(), 0).map(|_| ())
        }

        Kind::Opaque => Err(SchemaError::UnsupportedKind { ty: def.name.clone(), kind: "opaque" }.into()),
    }
}

pub(crate) fn read(schema: &Schema, ty: TypeId, bytes: &[u8]) -> Result<Value> {
    let def = schema.def(ty);
    let plain = schema.plain(ty);

    match &def.kind {
        Kind::Void => Ok(Value::Void),

        Kind::Primitive(p) => read_primitive(*p, bytes),

        Kind::Enum { repr, variants } => {
            let raw = read_primitive(*repr, bytes)?;
            let d = match raw {
                Value::Int(v) => v,
                Value::Uint(v) => i64::try_from(v).map_err(|_| Error::InvalidDiscriminant(v))?,
                _ => return Err(raw.mismatch("integer")),
            };
            variants
                .iter()
                .find(|(_, v)| *v == d)
                .map(|(n, _)| Value::Enum(n.clone()))
                .ok_or(Error::InvalidDiscriminant(d as u64))
        }

        Kind::Pointer { optional, .. } => {
            let address = load_address(bytes, 0)?;
            let present = match plain.tag {
                Some(at) => load_uint(bytes, at, IntWidth::U8)? != 0,
                None => address != 0,
            };
            Ok(if *optional && !present { Value::Null } else { Value::Address(address) })
        }

        Kind::UnknownPointer { .. } => Ok(Value::Address(load_address(bytes, 0)?)),

        Kind::Slice { optional, .. } => {
            let addr = load_address(bytes, plain.offsets[0])?;
            let len = load_uint(bytes, plain.offsets[1], IntWidth::NATIVE)?;
            if *optional && addr == 0 && len == IntWidth::NATIVE.max_value() {
                return Ok(Value::Null);
            }
            Ok(Value::RawSlice { addr, len: len as usize })
        }

        Kind::Array { elem, len } => {
            if is_byte(schema, *elem) {
                return Ok(Value::Bytes(sub(bytes, 0, *len)?.to_vec()));
            }
            let es = schema.plain(*elem).layout.size;
            let items = (0..*len)
                .map(|i| read(schema, *elem, sub(bytes, i * es, es)?))
                .collect::<Result<_>>()?;
            Ok(Value::Seq(items))
        }

        Kind::Record { fields, .. } => {
            let mut out = Vec::with_capacity(fields.len());
            for (f, &offset) in fields.iter().zip(&plain.offsets) {
                let size = schema.plain(f.ty).layout.size;
                out.push((f.name.clone(), read(schema, f.ty, sub(bytes, offset, size)?)?));
            }
            Ok(Value::Record(out))
        }

        Kind::Union { arms, tag } => match (tag, plain.tag) {
            (Some(width), Some(at)) => {
                let idx = load_uint(bytes, at, *width)?;
                let arm = arms.get(idx as usize).ok_or(Error::InvalidDiscriminant(idx))?;
                let size = schema.plain(arm.ty).layout.size;
                let inner = read(schema, arm.ty, sub(bytes, plain.offsets[idx as usize], size)?)?;
                Ok(Value::arm(&arm.name, inner))
            }
            _ => Ok(Value::Bytes(sub(bytes, 0, plain.layout.size)?.to_vec())),
        },

        Kind::Optional(inner) => match load_uint(bytes, plain.tag.unwrap_or(0), IntWidth::U8)? {
            0 => Ok(Value::none()),
            _ => {
                let size = schema.plain(*inner).layout.size;
                Ok(Value::some(read(schema, *inner, sub(bytes, plain.offsets[0], size)?)?))
            }
        },

        Kind::Result { ok } => match load_uint(bytes, plain.tag.unwrap_or(0), IntWidth::U8)? {
            0 => {
                let size = schema.plain(*ok).layout.size;
                Ok(Value::ok(read(schema, *ok, sub(bytes, plain.offsets[0], size)?)?))
            }
            _ => Ok(Value::err(load_uint(bytes, plain.offsets[1], IntWidth::U16)? as u16)),
        },

        Kind::Custom(codec) => codec.read(bytes, &[]),

        Kind::Opaque => Err(SchemaError::UnsupportedKind { ty: def.name.clone(), kind: "opaque" }.into()),
    }
}
