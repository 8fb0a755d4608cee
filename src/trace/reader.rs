//! Trace replay.
//!
//! Materialises the delta stream of a trace file back into full component
//! states: registers start from an all-zero snapshot and apply key updates,
//! memory adopts its first full value and applies byte patches in place.

use super::{
    ComponentDelta, ComponentDescriptor, ComponentState, TraceError, TraceFile, TraceMeta,
    MEMORY_PREFIX, REGISTER_SET,
};
use crate::registers::RegisterFile;
use std::path::Path;

/// Replays a trace file as a stream of `(executed_insns, states)` pairs.
pub struct TraceReader {
    file: TraceFile,
}

impl TraceReader {
    pub fn new(file: TraceFile) -> Self {
        Self { file }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        Ok(Self::new(TraceFile::read_file(path)?))
    }

    pub fn meta(&self) -> &TraceMeta {
        &self.file.meta
    }

    /// Component descriptors; two traces compare only when these are identical.
    pub fn structure(&self) -> &[ComponentDescriptor] {
        &self.file.meta.components
    }

    pub fn rom_image(&self) -> &[u8] {
        &self.file.meta.rom_image
    }

    pub fn rom_base(&self) -> u32 {
        self.file.meta.rom_base
    }

    /// Number of tracepoints in the file.
    pub fn len(&self) -> usize {
        self.file.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.trace.is_empty()
    }

    fn initial_states(&self) -> Result<Vec<ComponentState>, TraceError> {
        self.structure()
            .iter()
            .map(|descriptor| {
                if descriptor.name == REGISTER_SET {
                    Ok(ComponentState::Registers(RegisterFile::default()))
                } else if descriptor.name.starts_with(MEMORY_PREFIX) {
                    Ok(ComponentState::Memory(Vec::new()))
                } else {
                    Err(TraceError::Format(format!(
                        "unknown component {:?}",
                        descriptor.name
                    )))
                }
            })
            .collect()
    }

    pub fn iter(&self) -> StateIter<'_> {
        StateIter {
            reader: self,
            index: 0,
            states: None,
        }
    }

    /// The materialised state at an exact instruction counter, if the trace has
    /// a tracepoint there.
    pub fn state_at(&self, executed_insns: u64) -> Result<Option<Vec<ComponentState>>, TraceError> {
        for entry in self.iter() {
            let (insns, states) = entry?;
            if insns == executed_insns {
                return Ok(Some(states));
            }
            if insns > executed_insns {
                break;
            }
        }
        Ok(None)
    }
}

fn apply_delta(state: &mut ComponentState, delta: &ComponentDelta) -> Result<(), TraceError> {
    match (state, delta) {
        (_, ComponentDelta::Unchanged) => Ok(()),
        (ComponentState::Registers(regs), ComponentDelta::Registers(map)) => {
            regs.apply(map);
            Ok(())
        }
        (ComponentState::Memory(memory), ComponentDelta::Bytes(bytes)) => {
            *memory = bytes.clone();
            Ok(())
        }
        (ComponentState::Memory(memory), ComponentDelta::Patch(patch)) => {
            if memory.is_empty() {
                return Err(TraceError::Format(
                    "byte patch before any full memory value".into(),
                ));
            }
            patch.apply(memory)
        }
        _ => Err(TraceError::Format(
            "component delta does not match the component kind".into(),
        )),
    }
}

/// Iterator over materialised tracepoints.
pub struct StateIter<'a> {
    reader: &'a TraceReader,
    index: usize,
    /// Running materialisation, lazily initialised.
    states: Option<Vec<ComponentState>>,
}

impl Iterator for StateIter<'_> {
    type Item = Result<(u64, Vec<ComponentState>), TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.reader.file.trace.get(self.index)?;
        self.index += 1;
        if self.states.is_none() {
            match self.reader.initial_states() {
                Ok(states) => self.states = Some(states),
                Err(e) => return Some(Err(e)),
            }
        }
        let states = self.states.as_mut().expect("initialised above");
        for (state, delta) in states.iter_mut().zip(&point.state) {
            if let Err(e) = apply_delta(state, delta) {
                return Some(Err(e));
            }
        }
        Some(Ok((point.executed_insns, states.clone())))
    }
}
