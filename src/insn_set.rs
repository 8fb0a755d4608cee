//! Instruction-set table model.
//!
//! The table is an XML document of repeated `opcode` elements, each declaring a
//! mnemonic, a variant tag and an encoding string, with optional decode priority
//! and operand transforms:
//!
//! ```xml
//! <opcode name="add" variant="add_imm_T3">
//!     <encoding bits="11110 imm.2 01000 S Rn{4} 0 imm{3}.1 Rd{4} imm{8}.0"/>
//!     <extend variable="imm" type="thumb_expand_imm"/>
//! </opcode>
//! ```
//!
//! [InsnSet::load] builds one [Opcode] record per variant, widening 16-bit
//! encodings into the upper half of the 32-bit matching word, and orders records
//! by `(priority, variant)`; this order is the decode order, so more specific
//! encodings carved out of a wider one (`svc` inside the conditional branch
//! space, the hint instructions inside `it`) carry a lower priority number.

use crate::bitfield::{Bitfield, BitfieldError};
use crate::fieldshift::{FieldShift, Transform};
use log::warn;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Width of the matching word every encoding is lifted into.
pub const DECODE_WIDTH: u8 = 32;

/// Operand display order. Decoded operands and disassembly output list register
/// operands first, then immediates and flag bits.
const OPERAND_ORDER: &[&str] = &[
    "Rd", "Rdn", "Rdm", "Rt", "Rn", "Rm", "Rtx", "RdLo", "RdHi", "Vd", "Vn", "Vm", "rotate",
    "shift", "imm", "satimm", "op", "cond", "firstcond", "mask", "register_list", "SYSm", "type",
    "coproc", "CRd", "CRn", "CRm", "opcA", "opcB", "Ra", "RtA", "RtB", "tb", "RM", "H", "D", "E",
    "P", "N", "M", "F", "I", "R", "S", "T", "U", "W", "j", "k", "sf", "sx", "sz", "msb", "option",
    "width", "Rmx",
];

/// Sort key of an operand name in the display order. Unknown names are logged
/// once and sort last.
pub fn operand_order(name: &str) -> usize {
    match OPERAND_ORDER.iter().position(|&o| o == name) {
        Some(index) => index,
        None => {
            warn!("operand {:?} missing from the display order table", name);
            OPERAND_ORDER.len()
        }
    }
}

/// Operand names which designate a core register, used when the comparator
/// labels a decoded instruction with live register values.
pub fn is_register_operand(name: &str) -> bool {
    matches!(
        name,
        "Rd" | "Rdn" | "Rdm" | "Rt" | "Rn" | "Rm" | "Rtx" | "RdLo" | "RdHi" | "Ra" | "Rmx"
    )
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("error reading instruction table: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed instruction table XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed attribute in instruction table: {0}")]
    Attr(String),
    #[error("opcode {variant}: {source}")]
    Bitfield {
        variant: String,
        source: BitfieldError,
    },
    #[error("opcode {variant}: encoding is {len} bits, expected 16 or 32")]
    BadLength { variant: String, len: u8 },
    #[error("opcode {variant}: missing attribute {attr}")]
    MissingAttr { variant: String, attr: String },
    #[error("opcode {variant}: bad priority {value:?}")]
    BadPriority { variant: String, value: String },
    #[error("opcode {variant}: unknown transform {transform:?}")]
    UnknownTransform { variant: String, transform: String },
    #[error("opcode {variant}: transform on unknown operand {operand:?}")]
    UnknownOperand { variant: String, operand: String },
    #[error("duplicate variant tag {0}")]
    DuplicateVariant(String),
}

/// One instruction encoding variant.
#[derive(Debug, Clone)]
pub struct Opcode {
    mnemonic: String,
    variant: String,
    /// Native encoding length in bits, 16 or 32.
    native_len: u8,
    bitfield: Bitfield,
    priority: i32,
}

impl Opcode {
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    /// Native encoding length in bits.
    pub fn native_len(&self) -> u8 {
        self.native_len
    }

    /// Instruction length in bytes, as reported by decoded instructions.
    pub fn byte_len(&self) -> u8 {
        self.native_len / 8
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Constant mask in the 32-bit matching word.
    pub fn mask(&self) -> u32 {
        self.bitfield.constant_mask()
    }

    /// Constant comparison value in the 32-bit matching word.
    pub fn match_value(&self) -> u32 {
        self.bitfield.constant_match()
    }

    /// Returns true when `word` carries this encoding.
    pub fn matches(&self, word: u32) -> bool {
        word & self.mask() == self.match_value()
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Operand names in display order.
    pub fn operand_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bitfield.var_names().collect();
        names.sort_by_key(|n| operand_order(n));
        names
    }

    pub fn operand(&self, name: &str) -> Option<&FieldShift> {
        self.bitfield.var(name)
    }
}

/// The loaded instruction table, ordered for decoding.
#[derive(Debug, Clone)]
pub struct InsnSet {
    /// Records sorted by `(priority, variant)`; this is the decode order.
    opcodes: Vec<Opcode>,
}

/// Attributes collected for one `opcode` element while walking the XML.
#[derive(Default)]
struct RawOpcode {
    name: String,
    variant: String,
    bits: Option<String>,
    priority: Option<String>,
    extends: Vec<(String, String)>,
}

fn attr(e: &BytesStart, name: &str) -> Result<Option<String>, TableError> {
    let attribute = e
        .try_get_attribute(name)
        .map_err(|e| TableError::Attr(e.to_string()))?;
    match attribute {
        Some(a) => Ok(Some(
            a.unescape_value()
                .map_err(|e| TableError::Attr(e.to_string()))?
                .into_owned(),
        )),
        None => Ok(None),
    }
}

fn require_attr(e: &BytesStart, name: &str, variant: &str) -> Result<String, TableError> {
    attr(e, name)?.ok_or_else(|| TableError::MissingAttr {
        variant: variant.into(),
        attr: name.into(),
    })
}

impl InsnSet {
    /// Loads an instruction table from an XML document.
    pub fn load(xml: &str) -> Result<Self, TableError> {
        let mut reader = Reader::from_str(xml);
        let mut opcodes: Vec<Opcode> = Vec::new();
        let mut current: Option<RawOpcode> = None;
        loop {
            let event = reader.read_event()?;
            match &event {
                Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                    b"opcode" => {
                        let mut raw = RawOpcode {
                            name: require_attr(e, "name", "?")?,
                            ..Default::default()
                        };
                        raw.variant = require_attr(e, "variant", &raw.name)?;
                        if matches!(&event, Event::Empty(_)) {
                            Self::finish_opcode(raw, &mut opcodes)?;
                        } else {
                            current = Some(raw);
                        }
                    }
                    b"encoding" => {
                        if let Some(raw) = current.as_mut() {
                            raw.bits = attr(e, "bits")?;
                        }
                    }
                    b"order" => {
                        if let Some(raw) = current.as_mut() {
                            raw.priority = attr(e, "priority")?;
                        }
                    }
                    b"extend" => {
                        if let Some(raw) = current.as_mut() {
                            let variant = raw.variant.clone();
                            raw.extends.push((
                                require_attr(e, "variable", &variant)?,
                                require_attr(e, "type", &variant)?,
                            ));
                        }
                    }
                    _ => {}
                },
                Event::End(e) if e.name().as_ref() == b"opcode" => {
                    if let Some(raw) = current.take() {
                        Self::finish_opcode(raw, &mut opcodes)?;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        opcodes.sort_by(|a, b| (a.priority, &a.variant).cmp(&(b.priority, &b.variant)));
        let mut seen = BTreeMap::new();
        for (index, opcode) in opcodes.iter().enumerate() {
            if seen.insert(opcode.variant.clone(), index).is_some() {
                return Err(TableError::DuplicateVariant(opcode.variant.clone()));
            }
        }
        let set = Self { opcodes };
        set.log_overlaps();
        Ok(set)
    }

    /// Loads an instruction table from a file.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, TableError> {
        Self::load(&std::fs::read_to_string(path)?)
    }

    /// The built-in Thumb-2 integer instruction table.
    pub fn builtin() -> Self {
        Self::load(include_str!("../data/thumb2.xml")).expect("built-in table is well-formed")
    }

    fn finish_opcode(raw: RawOpcode, opcodes: &mut Vec<Opcode>) -> Result<(), TableError> {
        let Some(bits) = raw.bits else {
            warn!("opcode {} has no encoding, skipped", raw.variant);
            return Ok(());
        };
        let mut bitfield = Bitfield::parse(&bits).map_err(|source| TableError::Bitfield {
            variant: raw.variant.clone(),
            source,
        })?;
        let native_len = bitfield.len();
        if native_len != 16 && native_len != 32 {
            return Err(TableError::BadLength {
                variant: raw.variant,
                len: native_len,
            });
        }
        bitfield.widen(DECODE_WIDTH);
        let priority = match &raw.priority {
            Some(value) => value.parse().map_err(|_| TableError::BadPriority {
                variant: raw.variant.clone(),
                value: value.clone(),
            })?,
            None => 0,
        };
        for (operand, transform) in &raw.extends {
            let transform =
                Transform::from_name(transform).ok_or_else(|| TableError::UnknownTransform {
                    variant: raw.variant.clone(),
                    transform: transform.clone(),
                })?;
            bitfield
                .var_mut(operand)
                .ok_or_else(|| TableError::UnknownOperand {
                    variant: raw.variant.clone(),
                    operand: operand.clone(),
                })?
                .set_transform(transform);
        }
        opcodes.push(Opcode {
            mnemonic: raw.name,
            variant: raw.variant,
            native_len,
            bitfield,
            priority,
        });
        Ok(())
    }

    /// Logs encoding pairs whose constant bits cannot tell them apart; decode
    /// order (priority, then variant tag) is the tie-breaker for those.
    fn log_overlaps(&self) {
        for (i, a) in self.opcodes.iter().enumerate() {
            for b in &self.opcodes[i + 1..] {
                let common = a.mask() & b.mask();
                if a.match_value() & common == b.match_value() & common {
                    warn!(
                        "encodings {} and {} overlap, {} decodes first",
                        a.variant(),
                        b.variant(),
                        a.variant()
                    );
                }
            }
        }
    }

    /// Records in decode order.
    pub fn opcodes(&self) -> &[Opcode] {
        &self.opcodes
    }

    pub fn len(&self) -> usize {
        self.opcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }

    pub fn get(&self, variant: &str) -> Option<&Opcode> {
        self.opcodes.iter().find(|o| o.variant == variant)
    }
}

#[cfg(test)]
mod tests {
    use super::InsnSet;

    const SMALL_TABLE: &str = r#"
        <instructionset>
            <opcode name="mov" variant="mov_imm_T1">
                <encoding bits="00100 Rd{3} imm{8}"/>
            </opcode>
            <opcode name="add" variant="add_imm_T3">
                <encoding bits="11110 imm.2 01000 S Rn{4} 0 imm{3}.1 Rd{4} imm{8}.0"/>
                <extend variable="imm" type="thumb_expand_imm"/>
            </opcode>
            <opcode name="nothing" variant="nothing_T1"/>
            <opcode name="svc" variant="svc_T1">
                <encoding bits="11011111 imm{8}"/>
                <order priority="1"/>
            </opcode>
            <opcode name="b" variant="b_T1">
                <encoding bits="1101 cond{4} imm{8}"/>
                <order priority="2"/>
            </opcode>
        </instructionset>
    "#;

    #[test]
    fn test_load_small_table() {
        let set = InsnSet::load(SMALL_TABLE).unwrap();
        // The encoding-less opcode is skipped.
        assert_eq!(set.len(), 4);
        let mov = set.get("mov_imm_T1").unwrap();
        assert_eq!(mov.mnemonic(), "mov");
        assert_eq!(mov.native_len(), 16);
        assert_eq!(mov.mask(), 0xf8000000);
        assert_eq!(mov.match_value(), 0x20000000);
        let add = set.get("add_imm_T3").unwrap();
        assert_eq!(add.native_len(), 32);
        assert_eq!(add.mask(), 0xfbe08000);
        assert_eq!(add.match_value(), 0xf1000000);
        assert!(add.operand("imm").unwrap().transform().is_some());
    }

    #[test]
    fn test_priority_orders_decode() {
        let set = InsnSet::load(SMALL_TABLE).unwrap();
        let variants: Vec<&str> = set.opcodes().iter().map(|o| o.variant()).collect();
        // svc (priority 1) must be tested before the conditional branch space
        // (priority 2) which contains it.
        let svc = variants.iter().position(|&v| v == "svc_T1").unwrap();
        let b = variants.iter().position(|&v| v == "b_T1").unwrap();
        assert!(svc < b);
    }

    #[test]
    fn test_operand_display_order() {
        let set = InsnSet::load(SMALL_TABLE).unwrap();
        let add = set.get("add_imm_T3").unwrap();
        assert_eq!(add.operand_names(), vec!["Rd", "Rn", "imm", "S"]);
    }

    #[test]
    fn test_builtin_table_loads() {
        let set = InsnSet::builtin();
        assert!(set.len() > 100);
        assert!(set.get("mov_imm_T1").is_some());
        assert!(set.get("bl_T1").is_some());
    }
}
