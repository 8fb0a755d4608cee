//! Operand extraction built from encoding bit-slices.
//!
//! A [FieldShift] accumulates the bit-slices an encoding string contributes to one
//! named operand and turns them into a canonical shift-and-mask extraction,
//! grouped by shift amount. It also carries the optional post-extract transform
//! (immediate expansion or sign extension) declared by the instruction table.

use crate::arith;

/// Post-extract transform applied to the raw operand bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Thumb modified immediate expansion of a 12-bit field.
    ExpandImm,
    /// Sign extension of a 20-bit branch offset.
    SignExtend20,
    /// Sign extension of a 24-bit branch offset.
    SignExtend24,
    /// Sign extension of a 24-bit branch offset with the S/J1/J2 bit folding.
    SignExtend24Eor,
}

impl Transform {
    /// Parses a transform name as spelled in the instruction table.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "thumb_expand_imm" => Some(Self::ExpandImm),
            "thumb_sign_extend20" => Some(Self::SignExtend20),
            "thumb_sign_extend24" => Some(Self::SignExtend24),
            "thumb_sign_extend24_EOR" => Some(Self::SignExtend24Eor),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExpandImm => "thumb_expand_imm",
            Self::SignExtend20 => "thumb_sign_extend20",
            Self::SignExtend24 => "thumb_sign_extend24",
            Self::SignExtend24Eor => "thumb_sign_extend24_EOR",
        }
    }

    /// Path of the implementing function, used when emitting decoder source.
    pub fn func_path(&self) -> &'static str {
        match self {
            Self::ExpandImm => "arith::thumb_expand_imm",
            Self::SignExtend20 => "arith::sign_extend20",
            Self::SignExtend24 => "arith::sign_extend24",
            Self::SignExtend24Eor => "arith::sign_extend24_eor",
        }
    }

    pub fn apply(&self, value: u32) -> i32 {
        match self {
            Self::ExpandImm => arith::thumb_expand_imm(value),
            Self::SignExtend20 => arith::sign_extend20(value),
            Self::SignExtend24 => arith::sign_extend24(value),
            Self::SignExtend24Eor => arith::sign_extend24_eor(value),
        }
    }
}

/// Value of one extracted operand.
///
/// Operands with a sign-extending or immediate-expanding transform are signed,
/// everything else is an unsigned field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Unsigned(u32),
    Signed(i32),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsigned(v) => write!(f, "0x{:x}", v),
            Self::Signed(v) => write!(f, "{}", v),
        }
    }
}

impl FieldValue {
    /// Raw unsigned view of the value, for packing and map storage.
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Unsigned(v) => *v,
            Self::Signed(v) => *v as u32,
        }
    }
}

/// One group of source bits sharing the same left-shift towards their
/// destination.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Component {
    /// Left shift from source position to destination position. Negative values
    /// shift right.
    shl: i32,
    /// Union of the source bit positions of this group, in the native encoding
    /// word.
    src_mask: u32,
}

/// Accumulated extraction recipe for one operand.
#[derive(Debug, Clone, Default)]
pub struct FieldShift {
    /// Groups sorted by shift amount.
    components: Vec<Component>,
    /// Total number of destination bits.
    len: u8,
    /// Additional left shift of all source positions, nonzero when a 16-bit
    /// encoding has been widened into the upper half of a 32-bit word.
    widen_shl: u8,
    transform: Option<Transform>,
}

impl FieldShift {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bit-slice contribution.
    ///
    /// # Arguments
    ///
    /// * `src_lo` - Source LSB position in the native encoding word.
    /// * `width` - Number of bits of the slice.
    /// * `dst_lo` - Destination LSB position within the operand.
    pub fn add(&mut self, src_lo: u8, width: u8, dst_lo: u8) {
        let shl = dst_lo as i32 - src_lo as i32;
        let src_mask = (((1u64 << width) - 1) as u32) << src_lo;
        match self.components.iter_mut().find(|c| c.shl == shl) {
            Some(c) => c.src_mask |= src_mask,
            None => {
                self.components.push(Component { shl, src_mask });
                self.components.sort_by_key(|c| c.shl);
            }
        }
        self.len += width;
    }

    /// Total destination bit count of the operand.
    pub fn width(&self) -> u8 {
        self.len
    }

    /// Sets the widening shift applied when the native encoding is lifted into a
    /// wider matching word.
    pub fn set_widen_shl(&mut self, shl: u8) {
        self.widen_shl = shl;
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = Some(transform);
    }

    pub fn transform(&self) -> Option<Transform> {
        self.transform
    }

    /// Union of the source bit positions, only defined when no slice is permuted
    /// (every contribution keeps its source position). Used for the constant part
    /// of an encoding.
    pub fn static_mask(&self) -> u32 {
        debug_assert!(self.components.len() == 1 && self.components[0].shl == 0);
        self.components[0].src_mask
    }

    /// Extracts the raw operand bits from an encoding word, before any transform.
    pub fn extract(&self, word: u32) -> u32 {
        let mut result = 0;
        for c in &self.components {
            let masked = word & (c.src_mask << self.widen_shl);
            let shl = c.shl - self.widen_shl as i32;
            result |= if shl > 0 {
                masked << shl
            } else {
                masked >> -shl
            };
        }
        result
    }

    /// Extracts the operand value, applying the attached transform if any.
    pub fn value(&self, word: u32) -> FieldValue {
        let raw = self.extract(word);
        match self.transform {
            Some(t) => FieldValue::Signed(t.apply(raw)),
            None => FieldValue::Unsigned(raw),
        }
    }

    /// Packs an operand value back into its encoding word positions. Inverse of
    /// [Self::extract]; only meaningful for operands without a transform.
    pub fn pack(&self, value: u32) -> u32 {
        let mut word = 0;
        for c in &self.components {
            let mask = c.src_mask << self.widen_shl;
            let shl = c.shl - self.widen_shl as i32;
            word |= if shl > 0 { value >> shl } else { value << -shl } & mask;
        }
        word
    }

    /// Renders the canonical extraction expression over `varname`, without the
    /// transform wrapper.
    pub fn raw_expression(&self, varname: &str) -> String {
        let terms: Vec<String> = self
            .components
            .iter()
            .map(|c| {
                let masked = format!("{} & 0x{:x}", varname, c.src_mask << self.widen_shl);
                match c.shl - self.widen_shl as i32 {
                    shl if shl > 0 => format!("(({}) << {})", masked, shl),
                    0 => format!("({})", masked),
                    shl => format!("(({}) >> {})", masked, -shl),
                }
            })
            .collect();
        terms.join(" | ")
    }

    /// Renders the full extraction expression, wrapping the transform function
    /// when one is attached.
    pub fn expression(&self, varname: &str) -> String {
        let raw = self.raw_expression(varname);
        match self.transform {
            Some(t) => format!("{}({})", t.func_path(), raw),
            None => raw,
        }
    }

    /// Narrowest Rust type able to carry the operand value.
    pub fn rust_type(&self) -> &'static str {
        if self.transform.is_some() {
            return "i32";
        }
        match self.len {
            1 => "bool",
            2..=8 => "u8",
            9..=16 => "u16",
            _ => "u32",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldShift, FieldValue, Transform};

    #[test]
    fn test_nibble_swap() {
        // Reverses the nibbles of a 16-bit value.
        let mut fs = FieldShift::new();
        fs.add(0, 4, 12);
        fs.add(4, 4, 8);
        fs.add(8, 4, 4);
        fs.add(12, 4, 0);
        assert_eq!(fs.extract(0x1234), 0x4321);
        assert_eq!(fs.width(), 16);
        assert_eq!(fs.rust_type(), "u16");
    }

    #[test]
    fn test_grouping_by_shift() {
        // Two adjacent slices with the same shift collapse into one mask.
        let mut fs = FieldShift::new();
        fs.add(8, 4, 0);
        fs.add(12, 4, 4);
        assert_eq!(fs.raw_expression("word"), "((word & 0xff00) >> 8)");
        assert_eq!(fs.extract(0xa500), 0xa5);
    }

    #[test]
    fn test_widening() {
        // Rd in bits 8..10 of a 16-bit encoding placed in the upper half.
        let mut fs = FieldShift::new();
        fs.add(8, 3, 0);
        fs.set_widen_shl(16);
        assert_eq!(fs.raw_expression("word"), "((word & 0x7000000) >> 24)");
        assert_eq!(fs.extract(0x23420000), 3);
    }

    #[test]
    fn test_pack_round_trip() {
        let mut fs = FieldShift::new();
        fs.add(0, 8, 0);
        fs.add(12, 3, 8);
        fs.add(26, 1, 11);
        for value in [0u32, 1, 0x42, 0x7ff, 0xfff] {
            assert_eq!(fs.extract(fs.pack(value)), value);
        }
    }

    #[test]
    fn test_transform_value() {
        let mut fs = FieldShift::new();
        fs.add(0, 8, 0);
        fs.add(12, 3, 8);
        fs.add(26, 1, 11);
        fs.set_transform(Transform::ExpandImm);
        assert_eq!(fs.rust_type(), "i32");
        // imm12 = 0x3ff replicates 0xff over all four bytes.
        let word = fs.pack(0x3ff);
        assert_eq!(fs.value(word), FieldValue::Signed(-1));
    }

    #[test]
    fn test_expression_wrapping() {
        let mut fs = FieldShift::new();
        fs.add(0, 12, 0);
        fs.set_transform(Transform::SignExtend20);
        assert_eq!(fs.expression("word"), "arith::sign_extend20((word & 0xfff))");
    }
}
