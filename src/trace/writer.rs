//! Trace capture against a live remote-debug session.
//!
//! The writer owns a list of component probes. It records a full pre-step
//! tracepoint, then single-steps the target, emitting one delta-compressed
//! tracepoint per recorded step, and finishes with a forced-full tracepoint
//! when the run ends. Diff baselines only advance on emitted tracepoints, so a
//! decimated trace reconstructs exactly.

use super::diff::BytesPatch;
use super::{
    ComponentDelta, ComponentDescriptor, ComponentState, TraceFile, TraceMeta, Tracepoint,
    MEMORY_PREFIX, REGISTER_SET,
};
use crate::gdb::{RemoteTarget, TargetError};
use log::{debug, info};

/// One traced component: knows its descriptor and how to capture its current
/// state from the target.
pub trait Probe {
    fn descriptor(&self) -> ComponentDescriptor;
    fn capture(&mut self, target: &mut RemoteTarget) -> Result<ComponentState, TargetError>;
}

/// Probe for the CPU register snapshot.
pub struct RegisterSetProbe;

impl Probe for RegisterSetProbe {
    fn descriptor(&self) -> ComponentDescriptor {
        ComponentDescriptor {
            name: REGISTER_SET.into(),
            address: None,
            length: None,
            is_constant: None,
        }
    }

    fn capture(&mut self, target: &mut RemoteTarget) -> Result<ComponentState, TargetError> {
        Ok(ComponentState::Registers(target.get_regs()?))
    }
}

/// Probe for one memory region. Constant regions (ROM) are read once and served
/// from cache afterwards, so they diff to "unchanged" for free.
pub struct MemoryProbe {
    region_name: String,
    address: u32,
    length: u32,
    is_constant: bool,
    cache: Option<Vec<u8>>,
}

impl MemoryProbe {
    pub fn new(region_name: &str, address: u32, length: u32, is_constant: bool) -> Self {
        Self {
            region_name: region_name.into(),
            address,
            length,
            is_constant,
            cache: None,
        }
    }
}

impl Probe for MemoryProbe {
    fn descriptor(&self) -> ComponentDescriptor {
        ComponentDescriptor {
            name: format!("{}{}", MEMORY_PREFIX, self.region_name),
            address: Some(self.address),
            length: Some(self.length),
            is_constant: Some(self.is_constant),
        }
    }

    fn capture(&mut self, target: &mut RemoteTarget) -> Result<ComponentState, TargetError> {
        if self.is_constant {
            if let Some(cached) = &self.cache {
                return Ok(ComponentState::Memory(cached.clone()));
            }
        }
        let memory = target.read_memory(self.address, self.length)?;
        if self.is_constant {
            self.cache = Some(memory.clone());
        }
        Ok(ComponentState::Memory(memory))
    }
}

/// Capture tuning.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Record only every n-th step. 1 records every step.
    pub decimation: u64,
    /// Stop after this many executed instructions; 0 runs until a fixed point.
    pub max_insn_count: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            decimation: 1,
            max_insn_count: 0,
        }
    }
}

/// Why a capture run ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// PC did not move across a step: the target spins on a self-branch.
    FixedPoint,
    /// The configured instruction budget was exhausted.
    Budget,
}

/// Delta-compressing trace recorder.
pub struct TraceWriter {
    probes: Vec<Box<dyn Probe>>,
    baseline: Vec<Option<ComponentState>>,
    trace: Vec<Tracepoint>,
    executed_insns: u64,
}

fn diff_state(old: Option<&ComponentState>, new: &ComponentState) -> ComponentDelta {
    match (old, new) {
        (None, ComponentState::Registers(regs)) => ComponentDelta::Registers(regs.to_map()),
        (None, ComponentState::Memory(bytes)) => ComponentDelta::Bytes(bytes.clone()),
        (Some(old), new) if old == new => ComponentDelta::Unchanged,
        (Some(ComponentState::Registers(old)), ComponentState::Registers(new)) => {
            ComponentDelta::Registers(new.diff_from(old))
        }
        (Some(ComponentState::Memory(old)), ComponentState::Memory(new)) => {
            ComponentDelta::Patch(BytesPatch::diff(old, new))
        }
        // A probe never changes kind; fall back to a full value.
        (Some(_), ComponentState::Registers(regs)) => ComponentDelta::Registers(regs.to_map()),
        (Some(_), ComponentState::Memory(bytes)) => ComponentDelta::Bytes(bytes.clone()),
    }
}

fn full_state(state: &ComponentState) -> ComponentDelta {
    match state {
        ComponentState::Registers(regs) => ComponentDelta::Registers(regs.to_map()),
        ComponentState::Memory(bytes) => ComponentDelta::Bytes(bytes.clone()),
    }
}

impl TraceWriter {
    pub fn new(probes: Vec<Box<dyn Probe>>) -> Self {
        let baseline = probes.iter().map(|_| None).collect();
        Self {
            probes,
            baseline,
            trace: Vec::new(),
            executed_insns: 0,
        }
    }

    pub fn trace_len(&self) -> usize {
        self.trace.len()
    }

    pub fn executed_insns(&self) -> u64 {
        self.executed_insns
    }

    /// Captures every component and appends one tracepoint. With `force_full`
    /// the tracepoint carries full values regardless of the baseline.
    fn record(&mut self, target: &mut RemoteTarget, force_full: bool) -> Result<(), TargetError> {
        let mut state = Vec::with_capacity(self.probes.len());
        for (index, probe) in self.probes.iter_mut().enumerate() {
            let current = probe.capture(target)?;
            state.push(if force_full {
                full_state(&current)
            } else {
                diff_state(self.baseline[index].as_ref(), &current)
            });
            self.baseline[index] = Some(current);
        }
        self.trace.push(Tracepoint {
            executed_insns: self.executed_insns,
            state,
        });
        Ok(())
    }

    /// Appends the final tracepoint with full materialisation forced, replacing
    /// a delta tracepoint already emitted for the same step.
    fn record_final(&mut self, target: &mut RemoteTarget) -> Result<(), TargetError> {
        if self
            .trace
            .last()
            .is_some_and(|p| p.executed_insns == self.executed_insns)
        {
            self.trace.pop();
        }
        self.record(target, true)
    }

    /// Runs the capture loop: pre-step snapshot, stepping with decimated
    /// recording, final full snapshot.
    pub fn run(
        &mut self,
        target: &mut RemoteTarget,
        options: &CaptureOptions,
    ) -> Result<StopReason, TargetError> {
        let decimation = options.decimation.max(1);
        self.record(target, true)?;
        let mut pc = target.get_regs()?.pc();
        loop {
            target.singlestep()?;
            self.executed_insns += 1;
            let regs = target.get_regs()?;
            if regs.pc() == pc {
                debug!(
                    "fixed point at pc 0x{:08x} after {} instructions",
                    pc, self.executed_insns
                );
                self.record_final(target)?;
                info!("capture stopped on fixed point, {} tracepoints", self.trace.len());
                return Ok(StopReason::FixedPoint);
            }
            pc = regs.pc();
            if self.executed_insns % decimation == 0 {
                self.record(target, false)?;
            }
            if options.max_insn_count > 0 && self.executed_insns >= options.max_insn_count {
                self.record_final(target)?;
                info!("capture stopped on budget, {} tracepoints", self.trace.len());
                return Ok(StopReason::Budget);
            }
        }
    }

    /// Component descriptors, in state-array order.
    pub fn descriptors(&self) -> Vec<ComponentDescriptor> {
        self.probes.iter().map(|p| p.descriptor()).collect()
    }

    /// Packages the recorded trace into a file document.
    pub fn finish(
        self,
        rom_base: u32,
        ram_base: u32,
        ram_size: u32,
        emulator: &str,
        rom_image: Vec<u8>,
    ) -> TraceFile {
        let components = self.probes.iter().map(|p| p.descriptor()).collect();
        TraceFile {
            meta: TraceMeta {
                rom_base,
                ram_base,
                ram_size,
                emulator: emulator.into(),
                rom_image,
                components,
            },
            trace: self.trace,
        }
    }
}
