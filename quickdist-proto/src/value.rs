use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use quickdist_files::{File, MountDescriptor};

/// The closed set of types a message's args and kwargs can hold. Unlike the
/// tool this protocol replaces, which could pickle arbitrary objects, a
/// message here only ever carries one of these -- see the redesign notes in
/// SPEC_FULL.md.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    File(File),
    Mount(MountDescriptor),
}

impl Value {
    pub fn encode(&self) -> Result<Vec<u8>, crate::ProtoError> {
        bincode::serialize(self).map_err(crate::ProtoError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Value, crate::ProtoError> {
        bincode::deserialize(bytes).map_err(crate::ProtoError::Decode)
    }
}

/// Depth-first walk collecting every [`File`] reachable from `value`. A
/// message's value tree is owned end to end (no shared references), so
/// unlike the reference implementation this is walking, there is no way to
/// construct a cycle and nothing to guard against.
pub(crate) fn each_file<'a>(value: &'a Value, out: &mut Vec<&'a File>) {
    match value {
        Value::File(f) => out.push(f),
        Value::List(items) => {
            for item in items {
                each_file(item, out);
            }
        }
        Value::Map(map) => {
            for item in map.values() {
                each_file(item, out);
            }
        }
        _ => {}
    }
}

/// Depth-first walk replacing every [`File`] reachable from `value` with
/// `f(file)`. Used to stage every file a call touches (workdir -> local,
/// local -> temp, temp -> workdir) in place, without a caller having to
/// rebuild the surrounding list/map structure by hand.
pub(crate) fn map_files<E>(
    value: &mut Value,
    f: &mut impl FnMut(&File) -> Result<File, E>,
) -> Result<(), E> {
    match value {
        Value::File(file) => {
            *file = f(file)?;
        }
        Value::List(items) => {
            for item in items {
                map_files(item, f)?;
            }
        }
        Value::Map(map) => {
            for item in map.values_mut() {
                map_files(item, f)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_file_at_top_level() {
        let v = Value::File(File::new("x", None));
        let mut out = Vec::new();
        each_file(&v, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn scalars_yield_nothing() {
        let v = Value::Int(42);
        let mut out = Vec::new();
        each_file(&v, &mut out);
        assert!(out.is_empty());
    }
}
