//! Decoder source emission.
//!
//! Renders the instruction table into Rust source for a standalone classifier
//! with the contract `decode(word: u32) -> Result<Instruction, DecodeError>`.
//! Two shapes are supported: a flat chain testing every encoding in decode
//! order, and a partitioned form which nests the chain inside the decision tree
//! of [crate::partition]. Both produce identical decode results; the tree only
//! reduces the number of mask tests per word.

use crate::insn_set::{InsnSet, Opcode};
use crate::partition::{partition_insn_set, PartitionError, PartitionNode};
use std::fmt::Write;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Style {
    /// One `if` arm per encoding, in decode order.
    Flat,
    /// Decision-tree routing, then one arm per leaf candidate.
    Partitioned,
}

const HEADER: &str = "\
//! Thumb-2 instruction classifier generated from the instruction table.
//! Regenerate with `calvados-gen` instead of editing by hand.

use crate::arith;
use crate::decoder::{DecodeError, Instruction};
use crate::fieldshift::FieldValue;

#[rustfmt::skip]
pub fn decode(word: u32) -> Result<Instruction, DecodeError> {
";

const FOOTER: &str = "    Err(DecodeError::Unknown)
}
";

/// Emits the classifier source for an instruction set.
pub fn emit(set: &InsnSet, style: Style) -> Result<String, PartitionError> {
    let mut out = String::from(HEADER);
    match style {
        Style::Flat => {
            for opcode in set.opcodes() {
                emit_arm(&mut out, opcode, 1);
            }
        }
        Style::Partitioned => {
            let tree = partition_insn_set(set)?;
            emit_node(&mut out, set, &tree, 1);
        }
    }
    out.push_str(FOOTER);
    Ok(out)
}

fn emit_node(out: &mut String, set: &InsnSet, node: &PartitionNode, indent: usize) {
    let pad = "    ".repeat(indent);
    match node {
        PartitionNode::Split {
            criterion,
            zero,
            nonzero,
        } => {
            let _ = writeln!(out, "{}if (word & 0x{:x}) == 0 {{", pad, criterion);
            emit_node(out, set, zero, indent + 1);
            let _ = writeln!(out, "{}}} else {{", pad);
            emit_node(out, set, nonzero, indent + 1);
            let _ = writeln!(out, "{}}}", pad);
        }
        PartitionNode::Leaf(elements) => {
            for element in elements {
                emit_arm(out, &set.opcodes()[element.index], indent);
            }
        }
    }
}

fn emit_arm(out: &mut String, opcode: &Opcode, indent: usize) {
    let pad = "    ".repeat(indent);
    let _ = writeln!(
        out,
        "{}if (word & 0x{:x}) == 0x{:x} {{",
        pad,
        opcode.mask(),
        opcode.match_value()
    );
    let _ = writeln!(
        out,
        "{}    return Ok(Instruction::new({:?}, {:?}, {}, vec![",
        pad,
        opcode.mnemonic(),
        opcode.variant(),
        opcode.byte_len()
    );
    for name in opcode.operand_names() {
        let fs = opcode.operand(name).expect("name comes from the bitfield");
        let value = match fs.transform() {
            Some(t) => format!(
                "FieldValue::Signed({}({}))",
                t.func_path(),
                fs.raw_expression("word")
            ),
            None => format!("FieldValue::Unsigned({})", fs.raw_expression("word")),
        };
        let _ = writeln!(out, "{}        ({:?}.into(), {}),", pad, name, value);
    }
    let _ = writeln!(out, "{}    ]));", pad);
    let _ = writeln!(out, "{}}}", pad);
}
