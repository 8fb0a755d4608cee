//! Differential trace comparison.
//!
//! Two traces of the same program are walked in lock-step, aligned by their
//! `executed_insns` counters so decimated traces still compare on the steps
//! they share. The first tracepoint whose states disagree aborts the walk with
//! a report naming every differing register and memory byte, then reconstructs
//! the previous tracepoint and prints the instruction which caused the
//! divergence, disassembled both by an external disassembler and by the direct
//! decoder so every operand is labelled with its live register value.

use super::reader::TraceReader;
use super::{ComponentState, TraceError, REGISTER_SET};
use crate::decoder::Instruction;
use crate::insn_set::InsnSet;
use crate::registers::{psr_flags, Register, RegisterFile, PSR_NZCV_MASK};
use log::warn;
use std::io::Write;
use std::process::Command;
use thiserror::Error;

/// External disassembler invoked for context around the diverging instruction.
const OBJDUMP: &str = "arm-none-eabi-objdump";

#[derive(Debug, Error)]
pub enum CompareError {
    /// The traces disagree on their component descriptors and cannot be
    /// compared element-wise.
    #[error("traces are structurally incompatible")]
    IncompatibleTraces,
    /// First state disagreement; details have been printed.
    #[error("traces diverge after {executed_insns} executed instructions")]
    Divergence { executed_insns: u64 },
    #[error(transparent)]
    Trace(#[from] TraceError),
}

/// Register-set equality for comparison purposes: all core registers exactly,
/// the PSR masked to the N/Z/C/V condition flags. The Q flag is deliberately
/// outside the mask.
fn regs_comparable(regs: &RegisterFile) -> RegisterFile {
    let mut masked = regs.clone();
    masked.set(Register::Psr, regs.psr() & PSR_NZCV_MASK);
    masked
}

fn states_equal(name: &str, a: &ComponentState, b: &ComponentState) -> bool {
    match (a, b) {
        (ComponentState::Registers(a), ComponentState::Registers(b)) if name == REGISTER_SET => {
            regs_comparable(a) == regs_comparable(b)
        }
        _ => a == b,
    }
}

/// Walks two traces and reports the first divergence.
pub struct TraceComparator {
    trace1: TraceReader,
    trace2: TraceReader,
    insn_set: InsnSet,
}

impl TraceComparator {
    /// Verifies structural compatibility before any alignment happens.
    pub fn new(trace1: TraceReader, trace2: TraceReader) -> Result<Self, CompareError> {
        if trace1.structure() != trace2.structure() {
            return Err(CompareError::IncompatibleTraces);
        }
        Ok(Self {
            trace1,
            trace2,
            insn_set: InsnSet::builtin(),
        })
    }

    /// Compares with an explicit instruction table for the divergence report.
    pub fn with_insn_set(mut self, insn_set: InsnSet) -> Self {
        self.insn_set = insn_set;
        self
    }

    /// Runs the lock-step walk. Returns the number of aligned tracepoints
    /// compared when the traces agree everywhere.
    pub fn compare(&self) -> Result<u64, CompareError> {
        let mut iter1 = self.trace1.iter();
        let mut iter2 = self.trace2.iter();
        let mut cur1 = iter1.next().transpose()?;
        let mut cur2 = iter2.next().transpose()?;
        let mut visited = 0;
        while let (Some((insns1, states1)), Some((insns2, states2))) = (&cur1, &cur2) {
            if insns1 == insns2 {
                self.compare_tracepoint(*insns1, states1, states2)?;
                visited += 1;
                cur1 = iter1.next().transpose()?;
                cur2 = iter2.next().transpose()?;
            } else if insns1 < insns2 {
                cur1 = iter1.next().transpose()?;
            } else {
                cur2 = iter2.next().transpose()?;
            }
        }
        Ok(visited)
    }

    fn compare_tracepoint(
        &self,
        executed_insns: u64,
        states1: &[ComponentState],
        states2: &[ComponentState],
    ) -> Result<(), CompareError> {
        let deviating: Vec<usize> = self
            .trace1
            .structure()
            .iter()
            .enumerate()
            .filter(|&(i, d)| !states_equal(&d.name, &states1[i], &states2[i]))
            .map(|(i, _)| i)
            .collect();
        if deviating.is_empty() {
            return Ok(());
        }

        println!(
            "Deviation in tracepoint after {} executed instructions in {} structural elements.",
            executed_insns,
            deviating.len()
        );
        for index in deviating {
            let descriptor = &self.trace1.structure()[index];
            println!("--- {} ---", descriptor.name);
            match (&states1[index], &states2[index]) {
                (ComponentState::Registers(a), ComponentState::Registers(b)) => {
                    print_register_deviation(a, b);
                }
                (ComponentState::Memory(a), ComponentState::Memory(b)) => {
                    let base = descriptor.address.unwrap_or(0);
                    print_memory_deviation(base, a, b);
                }
                _ => {}
            }
        }

        println!();
        println!("{}", "~".repeat(120));
        match self.previous_state(executed_insns)? {
            Some(states) => {
                println!("This was the cause of the deviation:");
                self.print_cause(&states);
            }
            None => println!("Unable to determine instruction that led to that deviation."),
        }
        Err(CompareError::Divergence { executed_insns })
    }

    /// The materialised state one instruction before the divergence, from
    /// whichever trace can produce it.
    fn previous_state(
        &self,
        executed_insns: u64,
    ) -> Result<Option<Vec<ComponentState>>, TraceError> {
        let Some(previous) = executed_insns.checked_sub(1) else {
            return Ok(None);
        };
        if let Some(states) = self.trace1.state_at(previous)? {
            return Ok(Some(states));
        }
        self.trace2.state_at(previous)
    }

    fn print_cause(&self, states: &[ComponentState]) {
        let Some(regs) = states.iter().find_map(|s| match s {
            ComponentState::Registers(regs) => Some(regs),
            _ => None,
        }) else {
            return;
        };
        print!("{}", regs);
        println!();

        let rom = self.trace1.rom_image();
        let Some(rel_pc) = regs.pc().checked_sub(self.trace1.rom_base()) else {
            return;
        };
        let rel_pc = rel_pc as usize;
        if rel_pc >= rom.len() {
            return;
        }
        let insn_bytes = &rom[rel_pc..rom.len().min(rel_pc + 4)];
        println!(
            "Instruction word at pc: {}",
            insn_bytes
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        );

        if let Some((before, line, after)) = disassemble_with_objdump(rom, rel_pc) {
            for line in before {
                println!("    {}", line);
            }
            println!();
            println!(">>> {:<60}  <<< deviating instruction", line);
            println!();
            for line in after {
                println!("    {}", line);
            }
        }

        println!();
        match self.insn_set.decode_bytes(insn_bytes) {
            Ok(insn) => {
                println!("Instruction details: {}", insn);
                print_register_operands(&insn, regs);
            }
            Err(_) => println!("Instruction details: unknown"),
        }
        println!();
    }
}

fn print_register_deviation(a: &RegisterFile, b: &RegisterFile) {
    for register in Register::all() {
        let (v1, v2) = (a.get(register), b.get(register));
        if v1 == v2 {
            continue;
        }
        if register == Register::Psr {
            println!(
                "{:<5}   {:<8}  |  {:<8}",
                register.display_name(),
                psr_flags(v1),
                psr_flags(v2)
            );
        } else {
            println!(
                "{:<5}   {:08x}  |  {:08x}    (XOR {:08x})",
                register.display_name(),
                v1,
                v2,
                v1 ^ v2
            );
        }
    }
}

fn print_memory_deviation(base: u32, a: &[u8], b: &[u8]) {
    if a.len() != b.len() {
        println!("Length different: {} bytes / {} bytes", a.len(), b.len());
    }
    let hexdump = |row: &[u8]| {
        row.iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    };
    let len = a.len().min(b.len());
    for offset in (0..len).step_by(16) {
        let end = (offset + 16).min(len);
        let (row1, row2) = (&a[offset..end], &b[offset..end]);
        if row1 != row2 {
            println!(
                "{:8x}: {}     {}",
                base as usize + offset,
                hexdump(row1),
                hexdump(row2)
            );
        }
    }
}

fn print_register_operands(insn: &Instruction, regs: &RegisterFile) {
    for (name, index) in insn.register_operands() {
        let Some(value) = regs.by_index(index) else {
            continue;
        };
        if value & 0x80000000 != 0 {
            println!(
                "{:>5} r{:<2} 0x{:x} / {}    signed: {}",
                name,
                index,
                value,
                value,
                value as i32
            );
        } else {
            println!("{:>5} r{:<2} 0x{:x} / {}", name, index, value, value);
        }
    }
}

/// Disassembles the ROM with the external ARM toolchain and extracts the line
/// at `rel_pc` with three lines of context on both sides. Absence of the
/// toolchain is tolerated.
fn disassemble_with_objdump(
    rom: &[u8],
    rel_pc: usize,
) -> Option<(Vec<String>, String, Vec<String>)> {
    let mut image = tempfile::Builder::new().suffix(".bin").tempfile().ok()?;
    image.write_all(rom).ok()?;
    image.flush().ok()?;
    let output = Command::new(OBJDUMP)
        .arg("-D")
        .arg(image.path())
        .args(["-b", "binary", "-m", "arm", "-M", "force-thumb"])
        .output()
        .map_err(|e| warn!("{} not available: {}", OBJDUMP, e))
        .ok()?;
    if !output.status.success() {
        warn!("{} failed with {}", OBJDUMP, output.status);
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = text.lines().collect();
    let needle = format!("{:x}:", rel_pc);
    let at = lines
        .iter()
        .position(|line| line.trim_start().starts_with(&needle))?;
    let before = lines[at.saturating_sub(3)..at]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let after = lines[at + 1..lines.len().min(at + 4)]
        .iter()
        .map(|s| s.to_string())
        .collect();
    Some((before, lines[at].to_string(), after))
}

#[cfg(test)]
mod tests {
    use super::super::{ComponentState, TRACE_VERSION};
    use super::{regs_comparable, states_equal, TraceComparator};
    use crate::registers::{Register, RegisterFile};
    use crate::trace::reader::TraceReader;
    use crate::trace::{
        ComponentDelta, ComponentDescriptor, TraceFile, TraceMeta, Tracepoint,
    };
    use std::collections::BTreeMap;

    #[test]
    fn test_q_flag_is_not_compared() {
        let mut a = RegisterFile::default();
        let mut b = RegisterFile::default();
        a.set(Register::Psr, 0x60000000);
        b.set(Register::Psr, 0x68000000); // same NZCV, Q differs
        assert!(states_equal(
            "register_set",
            &ComponentState::Registers(a.clone()),
            &ComponentState::Registers(b.clone())
        ));
        b.set(Register::Psr, 0xe0000000); // N differs
        assert!(!states_equal(
            "register_set",
            &ComponentState::Registers(a),
            &ComponentState::Registers(b)
        ));
    }

    #[test]
    fn test_regs_comparable_keeps_core_registers() {
        let mut a = RegisterFile::default();
        a.set(Register::R7, 7);
        a.set(Register::Psr, 0x1fffffff);
        let masked = regs_comparable(&a);
        assert_eq!(masked.get(Register::R7), 7);
        assert_eq!(masked.psr(), 0x10000000);
    }

    fn tiny_trace(ram_name: &str) -> TraceReader {
        TraceReader::new(TraceFile {
            meta: TraceMeta {
                rom_base: 0,
                ram_base: 0x20000000,
                ram_size: 4,
                emulator: "qemu".into(),
                rom_image: vec![],
                components: vec![ComponentDescriptor {
                    name: ram_name.into(),
                    address: Some(0x20000000),
                    length: Some(4),
                    is_constant: Some(false),
                }],
            },
            trace: vec![Tracepoint {
                executed_insns: 0,
                state: vec![ComponentDelta::Bytes(vec![0; 4])],
            }],
        })
    }

    #[test]
    fn test_structural_mismatch_is_fatal() {
        let a = tiny_trace("memory/ram");
        let b = tiny_trace("memory/sram");
        assert!(TraceComparator::new(a, b).is_err());
        // Sanity: the format version under test is the delta-compressed one.
        assert_eq!(TRACE_VERSION, 2);
    }

    #[test]
    fn test_identical_traces_compare_clean() {
        let a = tiny_trace("memory/ram");
        let b = tiny_trace("memory/ram");
        let comparator = TraceComparator::new(a, b).unwrap();
        assert_eq!(comparator.compare().unwrap(), 1);
    }

    #[test]
    fn test_register_divergence_is_reported() {
        let point = |r0: u32| Tracepoint {
            executed_insns: 1,
            state: vec![ComponentDelta::Registers(BTreeMap::from([(
                "r0".to_string(),
                r0,
            )]))],
        };
        let file = |r0| TraceFile {
            meta: TraceMeta {
                rom_base: 0,
                ram_base: 0,
                ram_size: 0,
                emulator: "qemu".into(),
                rom_image: vec![],
                components: vec![ComponentDescriptor {
                    name: "register_set".into(),
                    address: None,
                    length: None,
                    is_constant: None,
                }],
            },
            trace: vec![
                Tracepoint {
                    executed_insns: 0,
                    state: vec![ComponentDelta::Registers(BTreeMap::new())],
                },
                point(r0),
            ],
        };
        let comparator = TraceComparator::new(
            TraceReader::new(file(1)),
            TraceReader::new(file(2)),
        )
        .unwrap();
        match comparator.compare() {
            Err(super::CompareError::Divergence { executed_insns }) => {
                assert_eq!(executed_insns, 1)
            }
            other => panic!("expected divergence, got {:?}", other),
        }
    }
}
