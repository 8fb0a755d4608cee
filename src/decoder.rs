//! Direct instruction decoding from the table model.
//!
//! [decode](InsnSet::decode) classifies a 32-bit opcode word into exactly one
//! encoding variant and extracts its named operands. 16-bit encodings occupy the
//! upper half of the word; [frame_word] builds the word from a raw byte slice in
//! instruction stream order (little-endian halfwords, first halfword in the
//! upper half).
//!
//! Two classification strategies are available behind the same results: a linear
//! scan of the records in decode order, and a [PartitionDecoder] which routes the
//! word through the decision tree of [crate::partition] first. Both return
//! identical instructions; the tree only prunes the candidate list.

use crate::fieldshift::FieldValue;
use crate::insn_set::{is_register_operand, InsnSet, Opcode};
use crate::partition::{partition_insn_set, PartitionError, PartitionNode};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// No encoding's constant bits match the word.
    #[error("unknown encoding")]
    Unknown,
    /// Fewer than two bytes of instruction stream were supplied.
    #[error("truncated instruction stream")]
    Truncated,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    mnemonic: String,
    variant: String,
    /// Instruction length in bytes, 2 or 4.
    length: u8,
    /// Operands in display order.
    operands: Vec<(String, FieldValue)>,
}

impl Instruction {
    pub fn new(
        mnemonic: impl Into<String>,
        variant: impl Into<String>,
        length: u8,
        operands: Vec<(String, FieldValue)>,
    ) -> Self {
        Self {
            mnemonic: mnemonic.into(),
            variant: variant.into(),
            length,
            operands,
        }
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    /// Instruction length in bytes.
    pub fn length(&self) -> u8 {
        self.length
    }

    pub fn operands(&self) -> &[(String, FieldValue)] {
        &self.operands
    }

    pub fn operand(&self, name: &str) -> Option<FieldValue> {
        self.operands
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, v)| v)
    }

    /// Operands which designate a core register, as `(name, register index)`.
    pub fn register_operands(&self) -> impl Iterator<Item = (&str, u32)> {
        self.operands
            .iter()
            .filter(|(n, _)| is_register_operand(n))
            .map(|(n, v)| (n.as_str(), v.as_u32()))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .operands
            .iter()
            .map(|(name, value)| {
                if is_register_operand(name) {
                    format!("{} = r{}", name, value.as_u32())
                } else {
                    format!("{} = {}", name, value)
                }
            })
            .collect();
        write!(f, "{}({})", self.variant, args.join(", "))
    }
}

fn instruction_from(opcode: &Opcode, word: u32) -> Instruction {
    let operands = opcode
        .operand_names()
        .iter()
        .map(|&name| {
            let fs = opcode.operand(name).expect("name comes from the bitfield");
            (name.to_string(), fs.value(word))
        })
        .collect();
    Instruction::new(
        opcode.mnemonic(),
        opcode.variant(),
        opcode.byte_len(),
        operands,
    )
}

/// Builds the canonical 32-bit decoding word from an instruction stream slice.
///
/// With 4 or more bytes available the word is `(b1 << 24) | (b0 << 16) |
/// (b3 << 8) | b2`; with only 2 bytes the lower half is zero. A 16-bit
/// instruction decodes identically in both framings since it only inspects the
/// upper half.
pub fn frame_word(bytes: &[u8]) -> Result<u32, DecodeError> {
    match bytes {
        [b0, b1, b2, b3, ..] => Ok(u32::from(*b1) << 24
            | u32::from(*b0) << 16
            | u32::from(*b3) << 8
            | u32::from(*b2)),
        [b0, b1] => Ok(u32::from(*b1) << 24 | u32::from(*b0) << 16),
        _ => Err(DecodeError::Truncated),
    }
}

impl InsnSet {
    /// Decodes a 32-bit opcode word by linear scan in decode order.
    pub fn decode(&self, word: u32) -> Result<Instruction, DecodeError> {
        self.opcodes()
            .iter()
            .find(|o| o.matches(word))
            .map(|o| instruction_from(o, word))
            .ok_or(DecodeError::Unknown)
    }

    /// Decodes the instruction at the start of a byte slice.
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Instruction, DecodeError> {
        self.decode(frame_word(bytes)?)
    }
}

/// Decoder accelerated by the partition decision tree.
///
/// Construction walks the whole table once; decoding routes the word down the
/// tree and only tests the encodings of the reached leaf, in decode order.
pub struct PartitionDecoder<'a> {
    set: &'a InsnSet,
    tree: PartitionNode,
}

impl<'a> PartitionDecoder<'a> {
    pub fn new(set: &'a InsnSet) -> Result<Self, PartitionError> {
        Ok(Self {
            set,
            tree: partition_insn_set(set)?,
        })
    }

    pub fn tree(&self) -> &PartitionNode {
        &self.tree
    }

    pub fn decode(&self, word: u32) -> Result<Instruction, DecodeError> {
        self.tree
            .candidates(word)
            .iter()
            .find(|e| word & e.mask == e.value)
            .map(|e| instruction_from(&self.set.opcodes()[e.index], word))
            .ok_or(DecodeError::Unknown)
    }

    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Instruction, DecodeError> {
        self.decode(frame_word(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::{frame_word, DecodeError, PartitionDecoder};
    use crate::fieldshift::FieldValue;
    use crate::insn_set::InsnSet;

    #[test]
    fn test_frame_word() {
        // mov r3, #0x42 is 42 23 in the instruction stream.
        assert_eq!(frame_word(&[0x42, 0x23]), Ok(0x23420000));
        assert_eq!(frame_word(&[0x01, 0xf1, 0x01, 0x03]), Ok(0xf1010301));
        assert_eq!(frame_word(&[0x42]), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_mov_imm_t1() {
        let set = InsnSet::builtin();
        let ins = set.decode(0x23420000).unwrap();
        assert_eq!(ins.mnemonic(), "mov");
        assert_eq!(ins.variant(), "mov_imm_T1");
        assert_eq!(ins.length(), 2);
        assert_eq!(ins.operand("Rd"), Some(FieldValue::Unsigned(3)));
        assert_eq!(ins.operand("imm"), Some(FieldValue::Unsigned(0x42)));
    }

    #[test]
    fn test_decode_unknown() {
        let set = InsnSet::builtin();
        assert_eq!(set.decode(0xffff0000).unwrap_err(), DecodeError::Unknown);
    }

    #[test]
    fn test_partitioned_agrees_with_linear() {
        let set = InsnSet::builtin();
        let fast = PartitionDecoder::new(&set).unwrap();
        // Seed every encoding with its match value plus patterned free bits.
        for opcode in set.opcodes() {
            for salt in [0u32, !0, 0x55555555, 0xcafe1234] {
                let word = opcode.match_value() | (salt & !opcode.mask());
                assert_eq!(
                    set.decode(word).ok(),
                    fast.decode(word).ok(),
                    "0x{word:08x}"
                );
            }
        }
    }
}
