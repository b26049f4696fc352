//! Accessors for hand-built JSON documents.
use bitcoin_hashes::hex::ToHex;
use bitcoin_hashes::{sha256d, Hash, HashEngine};
use microserde::json::{Array, Number, Object, Value};

use peerpool_common::LocalTime;

use crate::error::Error;

/// Encode an optional time as milliseconds since Epoch, with zero meaning "never".
pub fn time_to_json(time: Option<LocalTime>) -> Value {
    Value::Number(Number::U64(time.map_or(0, |t| t.as_millis())))
}

/// Decode a time written by [`time_to_json`].
pub fn time_from_json(v: &Value, name: &str) -> Result<Option<LocalTime>, Error> {
    match as_u64(v, name)? {
        0 => Ok(None),
        ms => Ok(Some(LocalTime::from_millis(ms))),
    }
}

pub fn field<'a>(obj: &'a Object, name: &str) -> Result<&'a Value, Error> {
    obj.get(name)
        .ok_or_else(|| Error::Parse(format!("missing field `{}`", name)))
}

pub fn as_object<'a>(v: &'a Value, name: &str) -> Result<&'a Object, Error> {
    match v {
        Value::Object(obj) => Ok(obj),
        _ => Err(Error::Parse(format!("`{}` is not an object", name))),
    }
}

pub fn as_array<'a>(v: &'a Value, name: &str) -> Result<&'a Array, Error> {
    match v {
        Value::Array(ary) => Ok(ary),
        _ => Err(Error::Parse(format!("`{}` is not an array", name))),
    }
}

pub fn as_str<'a>(v: &'a Value, name: &str) -> Result<&'a str, Error> {
    match v {
        Value::String(s) => Ok(s),
        _ => Err(Error::Parse(format!("`{}` is not a string", name))),
    }
}

pub fn as_u64(v: &Value, name: &str) -> Result<u64, Error> {
    match v {
        Value::Number(Number::U64(n)) => Ok(*n),
        Value::Number(Number::I64(n)) if *n >= 0 => Ok(*n as u64),
        _ => Err(Error::Parse(format!("`{}` is not an unsigned integer", name))),
    }
}


/// Hex-encoded double-SHA256 of every field of a document, except `skip`.
///
/// Values are hashed structurally, so the digest doesn't depend on how the
/// document was formatted.
pub fn digest(obj: &Object, skip: &str) -> String {
    let mut engine = sha256d::Hash::engine();
    let fields = obj.iter().filter(|(k, _)| k.as_str() != skip);

    for (k, v) in fields {
        hash_str(&mut engine, k);
        hash_value(&mut engine, v);
    }
    let hash = sha256d::Hash::from_engine(engine).into_inner();

    hash[..].to_hex()
}

fn hash_str<E: HashEngine>(engine: &mut E, s: &str) {
    engine.input(&(s.len() as u64).to_le_bytes());
    engine.input(s.as_bytes());
}

fn hash_value<E: HashEngine>(engine: &mut E, v: &Value) {
    match v {
        Value::Null => engine.input(b"n"),
        Value::Bool(b) => engine.input(&[b'b', *b as u8]),
        Value::Number(Number::U64(n)) => {
            engine.input(b"u");
            engine.input(&n.to_le_bytes());
        }
        Value::Number(Number::I64(n)) => {
            engine.input(b"i");
            engine.input(&n.to_le_bytes());
        }
        Value::Number(Number::F64(n)) => {
            engine.input(b"f");
            engine.input(&n.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            engine.input(b"s");
            hash_str(engine, s);
        }
        Value::Array(ary) => {
            engine.input(b"a");
            engine.input(&(ary.len() as u64).to_le_bytes());

            for v in ary.iter() {
                hash_value(engine, v);
            }
        }
        Value::Object(obj) => {
            engine.input(b"o");
            engine.input(&(obj.len() as u64).to_le_bytes());

            for (k, v) in obj.iter() {
                hash_str(engine, k);
                hash_value(engine, v);
            }
        }
    }
}
