//! Tagged control message records

use crate::codec::{self, Value, ValueMap};
use crate::error::{ControlError, Result};
use crate::types::VmState;
use log::debug;

/// Reserved key carrying the message type
pub const MTYPE_KEY: &str = "_";

/// One decoded control message: a type tag plus its fields
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    mtype: String,
    fields: ValueMap,
}

impl Message {
    /// Create a message with no fields
    pub fn new(mtype: impl Into<String>) -> Self {
        Self {
            mtype: mtype.into(),
            fields: ValueMap::new(),
        }
    }

    /// Add a field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Decode a raw frame payload.
    ///
    /// The payload must be a map holding a string under [`MTYPE_KEY`]; the
    /// tag is removed from the fields.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let value = codec::decode(data)
            .map_err(|e| ControlError::Protocol(format!("MessagePack decode failure: {}", e)))?;
        let Value::Map(mut fields) = value else {
            return Err(ControlError::Protocol(
                "Received message is not a map object".into(),
            ));
        };
        let mtype = match fields.remove(MTYPE_KEY) {
            Some(Value::String(s)) => s,
            _ => return Err(ControlError::Protocol("Received message without a type".into())),
        };
        debug!("Received message: {}", mtype);
        Ok(Self { mtype, fields })
    }

    /// Encode with the type tag merged in under [`MTYPE_KEY`]
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut map = self.fields.clone();
        map.insert(MTYPE_KEY.to_string(), Value::String(self.mtype.clone()));
        codec::encode(&map)
    }

    /// Message type tag
    pub fn mtype(&self) -> &str {
        &self.mtype
    }

    /// Raw field lookup; nil counts as absent
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self.fields.get(key) {
            Some(Value::Nil) | None => None,
            Some(v) => Some(v),
        }
    }

    fn missing(&self, key: &str) -> ControlError {
        ControlError::Protocol(format!(
            "Missing required value {} in message {}",
            key, self.mtype
        ))
    }

    fn wrong_type(&self, key: &str, found: &Value) -> ControlError {
        ControlError::Protocol(format!(
            "Invalid type for field {} in message {} (found {})",
            key,
            self.mtype,
            found.kind()
        ))
    }

    fn get_with<T>(&self, key: &str, extract: impl Fn(&Value) -> Option<T>) -> Result<Option<T>> {
        match self.field(key) {
            None => Ok(None),
            Some(v) => extract(v).map(Some).ok_or_else(|| self.wrong_type(key, v)),
        }
    }

    fn opt_string(&self, key: &str) -> Result<Option<String>> {
        self.get_with(key, |v| match v {
            Value::String(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn opt_int(&self, key: &str) -> Result<Option<i64>> {
        self.get_with(key, |v| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        })
    }

    fn opt_double(&self, key: &str) -> Result<Option<f64>> {
        self.get_with(key, |v| match v {
            Value::Double(d) => Some(*d),
            _ => None,
        })
    }

    fn opt_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get_with(key, |v| match v {
            Value::Bool(b) => Some(*b),
            _ => None,
        })
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        self.opt_string(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn get_string_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.opt_string(key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.opt_int(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self.opt_int(key)?.unwrap_or(default))
    }

    pub fn get_double(&self, key: &str) -> Result<f64> {
        self.opt_double(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn get_double_or(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self.opt_double(key)?.unwrap_or(default))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.opt_bool(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.opt_bool(key)?.unwrap_or(default))
    }

    /// Required string field mapped onto [`VmState`]
    pub fn get_vm_state(&self, key: &str) -> Result<VmState> {
        Ok(VmState::from_wire(&self.get_string(key)?))
    }
}
