//! Device placement directives for the scoring engine.
//!
//! A ranker is configured either with a [`ComponentDevice`] or with a
//! Hugging Face style `device_map` loader option ([`DeviceMapSpec`]). Both are
//! folded into a single [`Placement`] that the engine loader consumes at
//! warm-up.

use crate::error::{AppError, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Device maps that let the loader decide placement on its own.
const AUTO_STRATEGIES: &[&str] = &["auto", "balanced", "balanced_low_0", "sequential"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    Cuda(usize),
    Mps,
    Disk,
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Layer-map form: CUDA ordinals are plain integers, everything else a string.
    fn to_layer_value(self) -> Value {
        match self {
            Device::Cuda(index) => json!(index),
            other => Value::String(other.to_string()),
        }
    }

    fn from_layer_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(|index| Device::Cuda(index as usize))
                .ok_or_else(|| AppError::ConfigError(format!("Invalid device ordinal: {}", n))),
            Value::String(s) => s.parse(),
            other => Err(AppError::ConfigError(format!(
                "Invalid device in device_map: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
            Device::Mps => write!(f, "mps"),
            Device::Disk => write!(f, "disk"),
        }
    }
}

impl FromStr for Device {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            "mps" => Ok(Device::Mps),
            "disk" => Ok(Device::Disk),
            _ => {
                let index = s
                    .strip_prefix("cuda:")
                    .and_then(|i| i.parse::<usize>().ok())
                    .ok_or_else(|| AppError::ConfigError(format!("Unknown device: {}", s)))?;
                Ok(Device::Cuda(index))
            }
        }
    }
}

/// Layer name to device assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMap(BTreeMap<String, Device>);

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer: impl Into<String>, device: Device) {
        self.0.insert(layer.into(), device);
    }

    pub fn get(&self, layer: &str) -> Option<Device> {
        self.0.get(layer).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn devices(&self) -> impl Iterator<Item = Device> + '_ {
        self.0.values().copied()
    }

    /// Smallest device in the map, used for input tensors.
    pub fn first_device(&self) -> Option<Device> {
        self.0.values().copied().min()
    }

    pub fn from_hf(map: &Map<String, Value>) -> Result<Self> {
        let mut layers = BTreeMap::new();
        for (layer, device) in map {
            layers.insert(layer.clone(), Device::from_layer_value(device)?);
        }
        Ok(Self(layers))
    }

    pub fn to_hf(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(layer, device)| (layer.clone(), device.to_layer_value()))
            .collect()
    }
}

/// Device setting of a component: one device, or a layer map across several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentDevice {
    Single(Device),
    Multiple(DeviceMap),
}

impl ComponentDevice {
    pub fn from_single(device: Device) -> Self {
        ComponentDevice::Single(device)
    }

    pub fn from_multiple(map: DeviceMap) -> Self {
        ComponentDevice::Multiple(map)
    }

    /// Returns the given device, or the default device when none is set.
    ///
    /// Accelerators are never probed: the default is the CPU.
    pub fn resolve_device(device: Option<ComponentDevice>) -> Self {
        device.unwrap_or(ComponentDevice::Single(Device::Cpu))
    }

    /// Converts to the `device_map` loader option.
    pub fn to_hf(&self) -> DeviceMapSpec {
        match self {
            ComponentDevice::Single(device) => DeviceMapSpec::Named(device.to_string()),
            ComponentDevice::Multiple(map) => DeviceMapSpec::Layers(map.clone()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ComponentDevice::Single(device) => {
                json!({ "type": "single", "device": device.to_string() })
            }
            ComponentDevice::Multiple(map) => {
                json!({ "type": "multiple", "device_map": Value::Object(map.to_hf()) })
            }
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let kind = value.get("type").and_then(Value::as_str);
        match kind {
            Some("single") => {
                let device = value
                    .get("device")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::ConfigError("Single device requires `device`".into()))?;
                Ok(ComponentDevice::Single(device.parse()?))
            }
            Some("multiple") => {
                let map = value
                    .get("device_map")
                    .and_then(Value::as_object)
                    .ok_or_else(|| {
                        AppError::ConfigError("Multiple devices require `device_map`".into())
                    })?;
                Ok(ComponentDevice::Multiple(DeviceMap::from_hf(map)?))
            }
            _ => Err(AppError::ConfigError(format!(
                "Invalid component device: {}",
                value
            ))),
        }
    }
}

/// The `device_map` loader option: a strategy or device name, or a layer map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMapSpec {
    Named(String),
    Layers(DeviceMap),
}

impl DeviceMapSpec {
    pub fn to_value(&self) -> Value {
        match self {
            DeviceMapSpec::Named(name) => Value::String(name.clone()),
            DeviceMapSpec::Layers(map) => Value::Object(map.to_hf()),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => Ok(DeviceMapSpec::Named(name.clone())),
            Value::Object(map) => Ok(DeviceMapSpec::Layers(DeviceMap::from_hf(map)?)),
            other => Err(AppError::ConfigError(format!(
                "device_map must be a string or an object, got {}",
                other
            ))),
        }
    }
}

/// Placement directive handed to the engine loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Auto,
    Single(Device),
    Layered(DeviceMap),
}

impl Placement {
    pub fn resolve(spec: &DeviceMapSpec) -> Result<Self> {
        match spec {
            DeviceMapSpec::Named(name) if AUTO_STRATEGIES.contains(&name.as_str()) => {
                Ok(Placement::Auto)
            }
            DeviceMapSpec::Named(name) => Ok(Placement::Single(name.parse()?)),
            DeviceMapSpec::Layers(map) if map.is_empty() => Err(AppError::ConfigError(
                "device_map must not be empty".to_string(),
            )),
            DeviceMapSpec::Layers(map) => Ok(Placement::Layered(map.clone())),
        }
    }

    /// Device receiving the tokenized inputs, if fixed.
    pub fn primary(&self) -> Option<Device> {
        match self {
            Placement::Auto => None,
            Placement::Single(device) => Some(*device),
            Placement::Layered(map) => map.first_device(),
        }
    }
}

/// Merges an explicit device with a `device_map` option.
///
/// The device map takes precedence. Returns the effective map and whether a
/// conflicting device was discarded.
pub fn resolve_device_map(
    device: Option<ComponentDevice>,
    device_map: Option<DeviceMapSpec>,
) -> (DeviceMapSpec, bool) {
    match (device, device_map) {
        (Some(_), Some(map)) => (map, true),
        (None, Some(map)) => (map, false),
        (device, None) => (ComponentDevice::resolve_device(device).to_hf(), false),
    }
}
