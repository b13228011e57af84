//! Extra engine loader options with a lossless, explicitly typed encoding.
//!
//! Precision markers and device maps are not JSON primitives. They are kept as
//! typed values in memory and written out in their canonical string or object
//! form; on import the option name decides how a value is decoded.

use crate::device::DeviceMapSpec;
use crate::error::{AppError, Result};
use crate::ranker::pairs::is_truthy;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DEVICE_MAP: &str = "device_map";

const DTYPE_PREFIX: &str = "torch.";

/// Numeric precision of model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Float16,
    BFloat16,
    Float32,
    Float64,
    Int8,
    UInt8,
}

impl DType {
    fn name(self) -> &'static str {
        match self {
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int8 => "int8",
            DType::UInt8 => "uint8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", DTYPE_PREFIX, self.name())
    }
}

impl FromStr for DType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.strip_prefix(DTYPE_PREFIX).unwrap_or(s);
        match name {
            "float16" | "half" => Ok(DType::Float16),
            "bfloat16" => Ok(DType::BFloat16),
            "float32" | "float" => Ok(DType::Float32),
            "float64" | "double" => Ok(DType::Float64),
            "int8" => Ok(DType::Int8),
            "uint8" => Ok(DType::UInt8),
            _ => Err(AppError::ConfigError(format!("Unknown dtype: {}", s))),
        }
    }
}

/// Names of options that carry a precision marker.
fn is_dtype_option(key: &str) -> bool {
    key == "torch_dtype" || key.ends_with("_dtype")
}

#[derive(Debug, Clone, PartialEq)]
pub enum KwargValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    DType(DType),
    DeviceMap(DeviceMapSpec),
    /// Lists and nested objects, passed through untouched.
    Json(Value),
}

impl KwargValue {
    pub fn to_value(&self) -> Value {
        match self {
            KwargValue::Null => Value::Null,
            KwargValue::Bool(b) => Value::Bool(*b),
            KwargValue::Int(i) => Value::from(*i),
            KwargValue::Float(f) => Value::from(*f),
            KwargValue::Str(s) => Value::String(s.clone()),
            KwargValue::DType(dtype) => Value::String(dtype.to_string()),
            KwargValue::DeviceMap(spec) => spec.to_value(),
            KwargValue::Json(value) => value.clone(),
        }
    }

    /// Decodes an exported value; `key` selects the typed decoders.
    pub fn from_value(key: &str, value: &Value) -> Result<Self> {
        if key == DEVICE_MAP && !value.is_null() {
            return Ok(KwargValue::DeviceMap(DeviceMapSpec::from_value(value)?));
        }

        match value {
            Value::String(s) if is_dtype_option(key) && s.starts_with(DTYPE_PREFIX) => {
                Ok(KwargValue::DType(s.parse()?))
            }
            Value::Null => Ok(KwargValue::Null),
            Value::Bool(b) => Ok(KwargValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(KwargValue::Int(i)),
                None => Ok(KwargValue::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(s) => Ok(KwargValue::Str(s.clone())),
            other => Ok(KwargValue::Json(other.clone())),
        }
    }
}

impl From<bool> for KwargValue {
    fn from(b: bool) -> Self {
        KwargValue::Bool(b)
    }
}

impl From<i64> for KwargValue {
    fn from(i: i64) -> Self {
        KwargValue::Int(i)
    }
}

impl From<f64> for KwargValue {
    fn from(f: f64) -> Self {
        KwargValue::Float(f)
    }
}

impl From<&str> for KwargValue {
    fn from(s: &str) -> Self {
        KwargValue::Str(s.to_string())
    }
}

impl From<DType> for KwargValue {
    fn from(dtype: DType) -> Self {
        KwargValue::DType(dtype)
    }
}

impl From<DeviceMapSpec> for KwargValue {
    fn from(spec: DeviceMapSpec) -> Self {
        KwargValue::DeviceMap(spec)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelKwargs(BTreeMap<String, KwargValue>);

impl ModelKwargs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<KwargValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<KwargValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&KwargValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<KwargValue> {
        self.0.remove(key)
    }

    /// Removes the `device_map` option and decodes it, whatever form it was
    /// inserted in. Null, empty strings and empty maps count as unset.
    pub fn take_device_map(&mut self) -> Result<Option<DeviceMapSpec>> {
        let raw = match self.remove(DEVICE_MAP) {
            Some(value) => value.to_value(),
            None => return Ok(None),
        };
        if !is_truthy(&raw) {
            return Ok(None);
        }
        DeviceMapSpec::from_value(&raw).map(Some)
    }

    pub fn device_map(&self) -> Option<&DeviceMapSpec> {
        match self.0.get(DEVICE_MAP) {
            Some(KwargValue::DeviceMap(spec)) => Some(spec),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(KwargValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Positive integer option; other values are ignored.
    pub fn get_usize(&self, key: &str) -> Option<usize> {
        match self.0.get(key) {
            Some(KwargValue::Int(i)) if *i > 0 => Some(*i as usize),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(KwargValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_dtype(&self, key: &str) -> Option<DType> {
        match self.0.get(key) {
            Some(KwargValue::DType(dtype)) => Some(*dtype),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(key, value)| (key.clone(), value.to_value()))
            .collect();
        Value::Object(map)
    }

    /// Decodes an exported object. `null` yields no options.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => {
                let mut kwargs = Self::new();
                for (key, value) in map {
                    kwargs.insert(key.clone(), KwargValue::from_value(key, value)?);
                }
                Ok(kwargs)
            }
            other => Err(AppError::ConfigError(format!(
                "model_kwargs must be an object, got {}",
                other
            ))),
        }
    }
}
