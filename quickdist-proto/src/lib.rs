//! The wire message format: a `{cmd, args, kwargs}` envelope carrying a
//! closed set of value types, one of which is a file reference that must
//! round-trip intact through encode/decode.

mod value;

pub use value::Value;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Names of the commands the node and client transports exchange. Kept as
/// plain strings on `Message` (matching how a dynamically dispatched
/// handler table looks them up) rather than a closed enum, so a future
/// command doesn't require every intermediate hop to be recompiled.
pub mod cmd {
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const INFO: &str = "INFO";
    pub const SETUP: &str = "SETUP";
    pub const CALL: &str = "CALL";
    pub const MOUNT: &str = "MOUNT";
    pub const OK: &str = "OK";
    pub const ERROR: &str = "ERROR";
    pub const CLOSE: &str = "CLOSE";
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

/// A single request or reply. `args` are positional, `kwargs` are named;
/// both may contain arbitrarily nested [`Value`]s, including files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub cmd: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(cmd: impl Into<String>, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Message {
        Message {
            cmd: cmd.into(),
            args,
            kwargs,
        }
    }

    pub fn simple(cmd: impl Into<String>) -> Message {
        Message::new(cmd, Vec::new(), BTreeMap::new())
    }

    pub fn ok(args: Vec<Value>) -> Message {
        Message::new(cmd::OK, args, BTreeMap::new())
    }

    pub fn error(text: impl Into<String>) -> Message {
        Message::new(cmd::ERROR, vec![Value::Str(text.into())], BTreeMap::new())
    }

    pub fn is_ok(&self) -> bool {
        self.cmd == cmd::OK
    }

    pub fn is_error(&self) -> bool {
        self.cmd == cmd::ERROR
    }

    /// The text of an ERROR reply's first argument, if this is one.
    pub fn error_text(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        match self.args.first() {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        bincode::serialize(self).map_err(ProtoError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, ProtoError> {
        bincode::deserialize(bytes).map_err(ProtoError::Decode)
    }

    /// Visits every [`quickdist_files::File`] reachable from this message's
    /// args and kwargs, depth first. See [`value::each_file`] for the
    /// traversal itself.
    pub fn each_file(&self) -> Vec<&quickdist_files::File> {
        let mut out = Vec::new();
        for v in &self.args {
            value::each_file(v, &mut out);
        }
        for v in self.kwargs.values() {
            value::each_file(v, &mut out);
        }
        out
    }

    /// Replaces every file reachable from this message's args and kwargs
    /// with `f(file)`, in place. Used to stage files between tiers before
    /// or after a call crosses a node boundary.
    pub fn stage_files<E>(&mut self, mut f: impl FnMut(&quickdist_files::File) -> Result<quickdist_files::File, E>) -> Result<(), E> {
        for v in &mut self.args {
            value::map_files(v, &mut f)?;
        }
        for v in self.kwargs.values_mut() {
            value::map_files(v, &mut f)?;
        }
        Ok(())
    }
}

/// The positional and keyword arguments handed across the FFI boundary into
/// a loaded script. Distinct from [`Message`] because a call's args/kwargs
/// need to cross into a worker process with no `cmd` envelope around them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        bincode::serialize(self).map_err(ProtoError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<CallArgs, ProtoError> {
        bincode::deserialize(bytes).map_err(ProtoError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quickdist_files::File;

    #[test]
    fn round_trips_through_bincode() {
        let msg = Message::new(
            cmd::CALL,
            vec![
                Value::Int(1),
                Value::Str("hi".into()),
                Value::File(File::new("data.bin", None)),
            ],
            BTreeMap::from([("flag".to_string(), Value::Bool(true))]),
        );
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn each_file_finds_nested_files() {
        let msg = Message::new(
            cmd::OK,
            vec![Value::List(vec![
                Value::Int(1),
                Value::File(File::new("a", None)),
            ])],
            BTreeMap::from([(
                "out".to_string(),
                Value::Map(BTreeMap::from([(
                    "f".to_string(),
                    Value::File(File::new("b", None)),
                )])),
            )]),
        );
        assert_eq!(msg.each_file().len(), 2);
    }
}
