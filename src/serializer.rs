//! Binary serialization of values for persisted compilation artifacts.
//!
//! Tag byte, then a big-endian payload. Only the data kinds a compiled
//! module needs to persist are supported; behavioral kinds (functions,
//! fibers, variables, continuations, pojos, general atoms) have no stable
//! external identity and are rejected.

use std::io::{self, Read, Write};

use byteorder::{BE, ReadBytesExt, WriteBytesExt};
use num::BigInt;
use num::bigint::Sign;

use crate::types::value::{ExtInt, Value, ValueKind};

/// Serialization failures.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
  /// An underlying I/O failure.
  #[error("serialization I/O failure: {0}")]
  Io(#[from] io::Error),
  /// The value kind has no serialized form.
  #[error("value has no serialized form")]
  Unserializable,
  /// The byte stream is not a serialized value.
  #[error("malformed serialized value")]
  Malformed,
}

const TAG_NIL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_NEG_INF: u8 = 2;
const TAG_POS_INF: u8 = 3;
const TAG_CHAR: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_TUPLE: u8 = 6;
const TAG_TRUE: u8 = 7;
const TAG_FALSE: u8 = 8;

/// Serialize a value to bytes.
pub fn serialize(value: &Value) -> Result<Vec<u8>, SerializeError> {
  let mut out = vec![];
  write_value(&mut out, value)?;
  Ok(out)
}

/// Deserialize a value, requiring the whole input to be consumed.
pub fn deserialize(bytes: &[u8]) -> Result<Value, SerializeError> {
  let mut cursor = bytes;
  let value = read_value(&mut cursor)?;
  if cursor.is_empty() { Ok(value) } else { Err(SerializeError::Malformed) }
}

fn write_value(w: &mut impl Write, value: &Value) -> Result<(), SerializeError> {
  if let Some(b) = value.as_boolean() {
    w.write_u8(if b { TAG_TRUE } else { TAG_FALSE })?;
    return Ok(())
  }
  match value.kind() {
    ValueKind::Nil => w.write_u8(TAG_NIL)?,
    ValueKind::Int(ExtInt::NegInf) => w.write_u8(TAG_NEG_INF)?,
    ValueKind::Int(ExtInt::PosInf) => w.write_u8(TAG_POS_INF)?,
    ValueKind::Int(ExtInt::Fin(n)) => {
      w.write_u8(TAG_INT)?;
      let (sign, magnitude) = n.to_bytes_be();
      w.write_i8(match sign {
        Sign::Minus => -1,
        Sign::NoSign => 0,
        Sign::Plus => 1,
      })?;
      w.write_u32::<BE>(magnitude.len() as u32)?;
      w.write_all(&magnitude)?;
    }
    ValueKind::Char(c) => {
      w.write_u8(TAG_CHAR)?;
      w.write_u32::<BE>(*c as u32)?;
    }
    ValueKind::Str(s) => {
      w.write_u8(TAG_STR)?;
      w.write_u32::<BE>(s.len() as u32)?;
      w.write_all(s.as_bytes())?;
    }
    ValueKind::Tuple(t) => {
      w.write_u8(TAG_TUPLE)?;
      w.write_u32::<BE>(t.len() as u32)?;
      for element in t { write_value(w, element)? }
    }
    _ => return Err(SerializeError::Unserializable),
  }
  Ok(())
}

fn read_value(r: &mut impl Read) -> Result<Value, SerializeError> {
  Ok(match r.read_u8()? {
    TAG_NIL => Value::nil(),
    TAG_NEG_INF => Value::ext_int(ExtInt::NegInf),
    TAG_POS_INF => Value::ext_int(ExtInt::PosInf),
    TAG_INT => {
      let sign = match r.read_i8()? {
        -1 => Sign::Minus,
        0 => Sign::NoSign,
        1 => Sign::Plus,
        _ => return Err(SerializeError::Malformed),
      };
      let len = r.read_u32::<BE>()? as usize;
      let mut magnitude = vec![0u8; len];
      r.read_exact(&mut magnitude)?;
      Value::int(BigInt::from_bytes_be(sign, &magnitude))
    }
    TAG_CHAR => {
      let c = char::from_u32(r.read_u32::<BE>()?).ok_or(SerializeError::Malformed)?;
      Value::char(c)
    }
    TAG_STR => {
      let len = r.read_u32::<BE>()? as usize;
      let mut bytes = vec![0u8; len];
      r.read_exact(&mut bytes)?;
      Value::string(String::from_utf8(bytes).map_err(|_| SerializeError::Malformed)?)
    }
    TAG_TUPLE => {
      let len = r.read_u32::<BE>()? as usize;
      let mut elements = Vec::with_capacity(len.min(65536));
      for _ in 0..len { elements.push(read_value(r)?) }
      Value::tuple(elements)
    }
    TAG_TRUE => Value::boolean(true),
    TAG_FALSE => Value::boolean(false),
    _ => return Err(SerializeError::Malformed),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn data_values_round_trip() {
    let values = [
      Value::nil(),
      Value::int(0),
      Value::int(-123_456_789_i64),
      Value::int(BigInt::parse_bytes(b"123456789012345678901234567890", 10)
        .expect("parses")),
      Value::ext_int(ExtInt::PosInf),
      Value::char('\u{1F600}'),
      Value::string("avail"),
      Value::boolean(true),
      Value::tuple([Value::int(1), Value::string("two"),
        Value::tuple([Value::int(3), Value::int(4)])]),
    ];
    for v in &values {
      let bytes = serialize(v).expect("serializes");
      let back = deserialize(&bytes).expect("deserializes");
      assert_eq!(back, *v);
      assert_eq!(back.instance_ty(), v.instance_ty());
    }
  }

  #[test]
  fn behavioral_values_are_rejected() {
    let var = Value::new(ValueKind::Var(
      crate::types::value::Variable::new(crate::types::ty::Ty::any())));
    assert!(matches!(serialize(&var), Err(SerializeError::Unserializable)));
  }
}
