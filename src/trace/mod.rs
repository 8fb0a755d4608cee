//! Execution trace capture, storage and comparison.
//!
//! A trace file is one JSON document (format version 2) holding a `meta` map
//! (memory layout, emulator identity, ROM image, component descriptors) and a
//! `trace` array of tracepoints sorted by `executed_insns`. Each tracepoint
//! stores, per component, either nothing (unchanged), a full value (first
//! appearance), a register delta map, or a byte patch; [reader::TraceReader]
//! replays those deltas back into full states.

pub mod compare;
pub mod diff;
pub mod encode;
pub mod reader;
pub mod writer;

use crate::registers::RegisterFile;
use diff::BytesPatch;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Trace file format generation produced and understood by this crate.
pub const TRACE_VERSION: u64 = 2;

/// Component name of the register snapshot.
pub const REGISTER_SET: &str = "register_set";

/// Component name prefix of traced memory regions.
pub const MEMORY_PREFIX: &str = "memory/";

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported trace version {0}")]
    Version(u64),
    #[error("malformed trace file: {0}")]
    Format(String),
}

/// Describes one traced component; the order of descriptors defines the index
/// used in each tracepoint's state array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_constant: Option<bool>,
}

/// A fully materialised component state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Registers(RegisterFile),
    Memory(Vec<u8>),
}

/// Per-component change captured by one tracepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentDelta {
    /// State identical to the previous tracepoint.
    Unchanged,
    /// Register entries which changed; a full 17-entry map on first appearance.
    Registers(BTreeMap<String, u32>),
    /// Full memory contents, emitted on first appearance.
    Bytes(Vec<u8>),
    /// Patch over the previous memory contents.
    Patch(BytesPatch),
}

/// One snapshot entry of the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracepoint {
    pub executed_insns: u64,
    pub state: Vec<ComponentDelta>,
}

/// Trace-wide metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceMeta {
    pub rom_base: u32,
    pub ram_base: u32,
    pub ram_size: u32,
    pub emulator: String,
    pub rom_image: Vec<u8>,
    pub components: Vec<ComponentDescriptor>,
}

/// A complete trace document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFile {
    pub meta: TraceMeta,
    pub trace: Vec<Tracepoint>,
}

fn u32_field(map: &Map<String, Value>, key: &str) -> Result<u32, TraceError> {
    map.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| TraceError::Format(format!("missing or bad meta field {:?}", key)))
}

impl ComponentDelta {
    fn to_value(&self) -> Result<Value, TraceError> {
        Ok(match self {
            ComponentDelta::Unchanged => Value::Null,
            ComponentDelta::Registers(map) => json!(map),
            ComponentDelta::Bytes(bytes) => encode::pack_bytes(bytes)?,
            ComponentDelta::Patch(patch) => encode::pack_patch(patch)?,
        })
    }

    fn from_value(value: &Value) -> Result<Self, TraceError> {
        match value {
            Value::Null => Ok(ComponentDelta::Unchanged),
            Value::Object(map) => match encode::packed_type(value) {
                Some("bd") => Ok(ComponentDelta::Patch(encode::unpack_patch(value)?)),
                Some(_) => Ok(ComponentDelta::Bytes(encode::unpack_bytes(value)?)),
                None => {
                    let mut regs = BTreeMap::new();
                    for (key, value) in map {
                        let value = value
                            .as_u64()
                            .and_then(|v| u32::try_from(v).ok())
                            .ok_or_else(|| {
                                TraceError::Format(format!("bad register value for {:?}", key))
                            })?;
                        regs.insert(key.clone(), value);
                    }
                    Ok(ComponentDelta::Registers(regs))
                }
            },
            _ => Err(TraceError::Format("unexpected component delta".into())),
        }
    }
}

impl TraceFile {
    pub fn to_json(&self) -> Result<Value, TraceError> {
        let meta = &self.meta;
        let trace = self
            .trace
            .iter()
            .map(|point| {
                let state = point
                    .state
                    .iter()
                    .map(ComponentDelta::to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(json!({ "executed_insns": point.executed_insns, "state": state }))
            })
            .collect::<Result<Vec<_>, TraceError>>()?;
        Ok(json!({
            "meta": {
                "rom_base": meta.rom_base,
                "ram_base": meta.ram_base,
                "ram_size": meta.ram_size,
                "rom_image_length": meta.rom_image.len(),
                "rom_image": encode::pack_bytes(&meta.rom_image)?,
                "emulator": meta.emulator,
                "version": TRACE_VERSION,
                "components": serde_json::to_value(&meta.components)?,
            },
            "trace": trace,
        }))
    }

    pub fn from_json(value: &Value) -> Result<Self, TraceError> {
        let meta = value
            .get("meta")
            .and_then(Value::as_object)
            .ok_or_else(|| TraceError::Format("missing meta map".into()))?;
        let version = meta.get("version").and_then(Value::as_u64).unwrap_or(0);
        if version != TRACE_VERSION {
            return Err(TraceError::Version(version));
        }
        let components: Vec<ComponentDescriptor> = serde_json::from_value(
            meta.get("components")
                .cloned()
                .ok_or_else(|| TraceError::Format("missing components".into()))?,
        )?;
        let rom_image = encode::unpack_bytes(
            meta.get("rom_image")
                .ok_or_else(|| TraceError::Format("missing rom_image".into()))?,
        )?;
        let trace_meta = TraceMeta {
            rom_base: u32_field(meta, "rom_base")?,
            ram_base: u32_field(meta, "ram_base")?,
            ram_size: u32_field(meta, "ram_size")?,
            emulator: meta
                .get("emulator")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            rom_image,
            components,
        };

        let mut trace = Vec::new();
        let mut previous_insns = None;
        for point in value
            .get("trace")
            .and_then(Value::as_array)
            .ok_or_else(|| TraceError::Format("missing trace array".into()))?
        {
            let executed_insns = point
                .get("executed_insns")
                .and_then(Value::as_u64)
                .ok_or_else(|| TraceError::Format("tracepoint without executed_insns".into()))?;
            if previous_insns.is_some_and(|p| executed_insns <= p) {
                return Err(TraceError::Format(
                    "tracepoints are not strictly increasing".into(),
                ));
            }
            previous_insns = Some(executed_insns);
            let state = point
                .get("state")
                .and_then(Value::as_array)
                .ok_or_else(|| TraceError::Format("tracepoint without state".into()))?;
            if state.len() != trace_meta.components.len() {
                return Err(TraceError::Format(format!(
                    "tracepoint has {} states for {} components",
                    state.len(),
                    trace_meta.components.len()
                )));
            }
            trace.push(Tracepoint {
                executed_insns,
                state: state
                    .iter()
                    .map(ComponentDelta::from_value)
                    .collect::<Result<_, _>>()?,
            });
        }
        Ok(Self {
            meta: trace_meta,
            trace,
        })
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<(), TraceError> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.to_json()?)?;
        Ok(())
    }

    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        let file = std::fs::File::open(path)?;
        let value: Value = serde_json::from_reader(std::io::BufReader::new(file))?;
        Self::from_json(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::diff::BytesPatch;
    use super::{
        ComponentDelta, ComponentDescriptor, TraceError, TraceFile, TraceMeta, Tracepoint,
    };
    use std::collections::BTreeMap;

    fn sample_descriptors() -> Vec<ComponentDescriptor> {
        vec![
            ComponentDescriptor {
                name: "register_set".into(),
                address: None,
                length: None,
                is_constant: None,
            },
            ComponentDescriptor {
                name: "memory/ram".into(),
                address: Some(0x20000000),
                length: Some(16),
                is_constant: Some(false),
            },
        ]
    }

    fn sample_file() -> TraceFile {
        let full_regs: BTreeMap<String, u32> = (0..16)
            .map(|i| (format!("r{}", i), i))
            .chain([("psr".to_string(), 0x60000000)])
            .collect();
        let ram0 = vec![0u8; 16];
        let mut ram1 = ram0.clone();
        ram1[4] = 0x99;
        TraceFile {
            meta: TraceMeta {
                rom_base: 0,
                ram_base: 0x20000000,
                ram_size: 16,
                emulator: "qemu".into(),
                rom_image: vec![0x42, 0x23, 0xfe, 0xe7],
                components: sample_descriptors(),
            },
            trace: vec![
                Tracepoint {
                    executed_insns: 0,
                    state: vec![
                        ComponentDelta::Registers(full_regs),
                        ComponentDelta::Bytes(ram0.clone()),
                    ],
                },
                Tracepoint {
                    executed_insns: 1,
                    state: vec![
                        ComponentDelta::Registers(BTreeMap::from([("r0".to_string(), 7u32)])),
                        ComponentDelta::Patch(BytesPatch::diff(&ram0, &ram1)),
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_json_round_trip() {
        let file = sample_file();
        let value = file.to_json().unwrap();
        assert_eq!(value["meta"]["version"], 2);
        assert_eq!(value["trace"][0]["executed_insns"], 0);
        let back = TraceFile::from_json(&value).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let file = sample_file();
        let mut value = file.to_json().unwrap();
        value["meta"]["version"] = 1u64.into();
        assert!(matches!(
            TraceFile::from_json(&value),
            Err(TraceError::Version(1))
        ));
    }

    #[test]
    fn test_non_monotonic_counters_are_rejected() {
        let mut file = sample_file();
        file.trace[1].executed_insns = 0;
        let value = file.to_json().unwrap();
        assert!(matches!(
            TraceFile::from_json(&value),
            Err(TraceError::Format(_))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let file = sample_file();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.trace");
        file.write_file(&path).unwrap();
        assert_eq!(TraceFile::read_file(&path).unwrap(), file);
    }
}
