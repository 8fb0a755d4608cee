//! Encoding-string grammar.
//!
//! An encoding string describes one instruction variant as whitespace-separated
//! tokens, most significant first. A token is either a constant run of `0`/`1`
//! digits (suffixed `?` when the bits are don't-care) or a named variable run
//! `name{width}.pos`, where `{width}` defaults to 1 and `.pos` orders the run's
//! slice within the operand (defaulting to the next unassigned slot for that
//! name, counting appearances from the LSB upward). Slices of the same name
//! concatenate into a single operand.
//!
//! For example `"11110 imm.2 01000 S Rn{4} 0 imm{3}.1 Rd{4} imm{8}.0"` is the
//! 32-bit ADD (immediate) encoding: a 12-bit `imm` operand assembled from three
//! slices, a single-bit `S` flag and two register fields.

use crate::fieldshift::FieldShift;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while parsing an encoding string. These indicate a malformed
/// instruction table and abort generator start-up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("invalid token {token:?} in encoding string {encoding:?}")]
    BadToken { token: String, encoding: String },
    #[error("encoding string is empty")]
    Empty,
}

/// One lexed token of an encoding string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Constant {
        /// The `0`/`1` digits, most significant first.
        bits: String,
        dontcare: bool,
    },
    Variable {
        name: String,
        width: u8,
        /// Slice ordering key within the operand; `None` until assigned.
        pos: Option<u32>,
    },
}

impl Token {
    fn width(&self) -> u8 {
        match self {
            Token::Constant { bits, .. } => bits.len() as u8,
            Token::Variable { width, .. } => *width,
        }
    }
}

fn lex_token(token: &str, encoding: &str) -> Result<Token, BitfieldError> {
    let bad = || BitfieldError::BadToken {
        token: token.into(),
        encoding: encoding.into(),
    };
    let first = token.chars().next().ok_or_else(bad)?;
    if first == '0' || first == '1' {
        let dontcare = token.ends_with('?');
        let bits = token.strip_suffix('?').unwrap_or(token);
        if bits.is_empty() || !bits.chars().all(|c| c == '0' || c == '1') {
            return Err(bad());
        }
        Ok(Token::Constant {
            bits: bits.into(),
            dontcare,
        })
    } else {
        // name, optional {width}, optional .pos
        let name_len = token
            .find(|c: char| !(c.is_ascii_alphabetic() || c == '_'))
            .unwrap_or(token.len());
        if name_len == 0 {
            return Err(bad());
        }
        let (name, mut rest) = token.split_at(name_len);
        let mut width = 1u8;
        if let Some(stripped) = rest.strip_prefix('{') {
            let close = stripped.find('}').ok_or_else(bad)?;
            width = stripped[..close].parse().map_err(|_| bad())?;
            if width == 0 || width > 32 {
                return Err(bad());
            }
            rest = &stripped[close + 1..];
        }
        let mut pos = None;
        if let Some(stripped) = rest.strip_prefix('.') {
            pos = Some(stripped.parse().map_err(|_| bad())?);
            rest = "";
        }
        if !rest.is_empty() {
            return Err(bad());
        }
        Ok(Token::Variable {
            name: name.into(),
            width,
            pos,
        })
    }
}

/// A fully parsed encoding string: constant mask and comparison value plus one
/// [FieldShift] per named operand.
#[derive(Debug, Clone)]
pub struct Bitfield {
    /// Total bit length of the encoding (16 or 32 for Thumb-2 tables; the
    /// grammar itself does not restrict it).
    bit_len: u8,
    /// Native constant mask, before widening.
    constant_mask: u32,
    /// Native constant comparison value, before widening.
    constant_value: u32,
    variables: BTreeMap<String, FieldShift>,
    /// Widening left shift applied to masks and extractions, nonzero once
    /// [Self::widen] has been called on a narrower encoding.
    widen_shl: u8,
}

impl Bitfield {
    /// Parses an encoding string.
    pub fn parse(encoding: &str) -> Result<Self, BitfieldError> {
        let mut tokens = encoding
            .split_whitespace()
            .map(|t| lex_token(t, encoding))
            .collect::<Result<Vec<_>, _>>()?;
        if tokens.is_empty() {
            return Err(BitfieldError::Empty);
        }

        // First pass: assign missing slice positions, counting appearances of
        // each name from the LSB end upward.
        let mut next_pos: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokens.iter_mut().rev() {
            if let Token::Variable { name, pos, .. } = token {
                if pos.is_none() {
                    let counter = next_pos.entry(name.clone()).or_insert(0);
                    *pos = Some(*counter);
                    *counter += 1;
                }
            }
        }

        // Second pass: walk from the right accumulating source bit positions.
        let mut bit_len = 0u8;
        let mut constant_mask = 0u32;
        let mut constant_value = 0u32;
        let mut slices: BTreeMap<String, Vec<(u32, u8, u8)>> = BTreeMap::new();
        for token in tokens.iter().rev() {
            let shiftpos = bit_len;
            match token {
                Token::Constant { bits, dontcare } => {
                    if !dontcare {
                        let width = bits.len() as u8;
                        let value = u32::from_str_radix(bits, 2).expect("lexed digits");
                        constant_mask |= (((1u64 << width) - 1) as u32) << shiftpos;
                        constant_value |= value << shiftpos;
                    }
                }
                Token::Variable { name, width, pos } => {
                    slices.entry(name.clone()).or_default().push((
                        pos.expect("assigned in first pass"),
                        shiftpos,
                        *width,
                    ));
                }
            }
            bit_len += token.width();
        }

        // Order each operand's slices by their position key and pack them
        // contiguously from destination bit 0.
        let mut variables = BTreeMap::new();
        for (name, mut parts) in slices {
            parts.sort_by_key(|&(pos, _, _)| pos);
            let mut fs = FieldShift::new();
            let mut dst = 0u8;
            for (_, src, width) in parts {
                fs.add(src, width, dst);
                dst += width;
            }
            variables.insert(name, fs);
        }

        Ok(Self {
            bit_len,
            constant_mask,
            constant_value,
            variables,
            widen_shl: 0,
        })
    }

    /// Total bit length of the encoding.
    pub fn len(&self) -> u8 {
        self.bit_len
    }

    pub fn is_empty(&self) -> bool {
        self.bit_len == 0
    }

    /// Lifts the encoding into a wider matching word; masks, comparison value
    /// and extractions are shifted left so the native encoding occupies the
    /// upper bits.
    pub fn widen(&mut self, widen_to: u8) {
        debug_assert!(widen_to >= self.bit_len);
        self.widen_shl = widen_to - self.bit_len;
        for fs in self.variables.values_mut() {
            fs.set_widen_shl(self.widen_shl);
        }
    }

    /// Constant mask in the (possibly widened) matching word.
    pub fn constant_mask(&self) -> u32 {
        self.constant_mask << self.widen_shl
    }

    /// Constant comparison value in the (possibly widened) matching word. A word
    /// belongs to this encoding when `word & constant_mask() == constant_match()`.
    pub fn constant_match(&self) -> u32 {
        self.constant_value << self.widen_shl
    }

    /// Names of the operands, in table order (not display order).
    pub fn var_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    pub fn var(&self, name: &str) -> Option<&FieldShift> {
        self.variables.get(name)
    }

    pub fn var_mut(&mut self, name: &str) -> Option<&mut FieldShift> {
        self.variables.get_mut(name)
    }

    /// Packs operand values into a matching encoding word (don't-care bits are
    /// left zero). Inverse of decoding for operands without transforms.
    pub fn encode(&self, values: &BTreeMap<String, u32>) -> u32 {
        let mut word = self.constant_match();
        for (name, fs) in &self.variables {
            if let Some(&value) = values.get(name) {
                word |= fs.pack(value);
            }
        }
        word
    }
}
