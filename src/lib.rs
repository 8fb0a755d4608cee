//! Calvados is a toolchain around Thumb-2 (ARM Cortex-M) instruction decoding and
//! differential execution tracing. It has two halves which meet in the trace
//! comparator:
//!
//! - A declarative encoding model: instruction encodings are described by bitfield
//!   strings in an XML table, parsed by [bitfield] into constant masks and named
//!   operand extractions ([fieldshift]). From the table, [partition] builds a
//!   decision tree over the opcode space and [codegen] emits decoder source code,
//!   while [decoder] classifies words directly from the in-memory model.
//!
//! - A tracing pipeline: [gdb] drives a target emulator (QEMU or a reference
//!   simulator) through the GDB remote serial protocol, [trace] captures
//!   delta-compressed execution traces and replays them, and [trace::compare]
//!   walks two traces in lock-step to pinpoint the first instruction whose
//!   semantics diverge.
//!
//! Check [insn_set::InsnSet] to load an instruction table and decode words, and
//! [trace::compare::TraceComparator] for the differential workflow.

pub mod arith;
pub mod bitfield;
pub mod codegen;
pub mod decoder;
pub mod fieldshift;
pub mod gdb;
pub mod helpers;
pub mod insn_set;
pub mod partition;
pub mod registers;
pub mod trace;
