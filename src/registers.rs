//! CPU register snapshot model shared by the protocol client, the trace format
//! and the comparator.

use num_enum::TryFromPrimitive;
use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// Identifies one entry of a register snapshot: the sixteen core registers plus
/// the program status register.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Register {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
    Psr,
}

impl Register {
    /// All snapshot entries, in trace order.
    pub fn all() -> impl Iterator<Item = Register> {
        (0u8..=16).map(|i| Register::try_from(i).expect("index in range"))
    }

    /// Key of this entry in trace files and register maps (`r0`..`r15`, `psr`).
    pub fn key(&self) -> &'static str {
        const KEYS: [&str; 17] = [
            "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12",
            "r13", "r14", "r15", "psr",
        ];
        KEYS[*self as usize]
    }

    /// Human name, using the ABI aliases for the upper registers.
    pub fn display_name(&self) -> &'static str {
        match self {
            Register::R12 => "ip",
            Register::Sp => "sp",
            Register::Lr => "lr",
            Register::Pc => "pc",
            Register::Psr => "psr",
            _ => self.key(),
        }
    }

    pub fn from_key(key: &str) -> Option<Register> {
        Register::all().find(|r| r.key() == key)
    }
}

/// Bits of the program status register holding the N, Z, C and V condition
/// flags. The saturation flag Q (bit 27) is outside this mask.
pub const PSR_NZCV_MASK: u32 = 0xf000_0000;

/// Renders the N/Z/C/V/Q flags of a PSR value, a letter per set flag.
pub fn psr_flags(psr: u32) -> String {
    let mut s = String::with_capacity(5);
    for (bit, letter) in [(31, 'N'), (30, 'Z'), (29, 'C'), (28, 'V'), (27, 'Q')] {
        s.push(if psr & (1 << bit) != 0 { letter } else { ' ' });
    }
    s
}

/// One full snapshot of the core registers and the PSR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFile {
    regs: [u32; 16],
    psr: u32,
}

impl RegisterFile {
    pub fn get(&self, reg: Register) -> u32 {
        match reg {
            Register::Psr => self.psr,
            _ => self.regs[reg as usize],
        }
    }

    pub fn set(&mut self, reg: Register, value: u32) {
        match reg {
            Register::Psr => self.psr = value,
            _ => self.regs[reg as usize] = value,
        }
    }

    pub fn pc(&self) -> u32 {
        self.get(Register::Pc)
    }

    pub fn psr(&self) -> u32 {
        self.psr
    }

    /// Register index accessor for decoded operand values.
    pub fn by_index(&self, index: u32) -> Option<u32> {
        self.regs.get(index as usize).copied()
    }

    /// The snapshot as a trace-file map.
    pub fn to_map(&self) -> BTreeMap<String, u32> {
        Register::all()
            .map(|r| (r.key().to_string(), self.get(r)))
            .collect()
    }

    /// Builds a snapshot from a trace-file map, leaving absent entries zero.
    pub fn from_map(map: &BTreeMap<String, u32>) -> Self {
        let mut file = Self::default();
        file.apply(map);
        file
    }

    /// Applies a delta map by key update.
    pub fn apply(&mut self, delta: &BTreeMap<String, u32>) {
        for (key, &value) in delta {
            if let Some(reg) = Register::from_key(key) {
                self.set(reg, value);
            }
        }
    }

    /// Map of the entries whose value differs from `older`.
    pub fn diff_from(&self, older: &RegisterFile) -> BTreeMap<String, u32> {
        Register::all()
            .filter(|&r| self.get(r) != older.get(r))
            .map(|r| (r.key().to_string(), self.get(r)))
            .collect()
    }
}

impl Display for RegisterFile {
    /// Register dump, four columns per row with the PSR flags trailing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells: Vec<String> = Register::all()
            .map(|r| format!("{:<3} {:08x}", r.display_name(), self.get(r)))
            .collect();
        for row in cells.chunks(4) {
            writeln!(f, "{}", row.join("  "))?;
        }
        writeln!(f, "flags [{}]", psr_flags(self.psr))
    }
}

#[cfg(test)]
mod tests {
    use super::{psr_flags, Register, RegisterFile};

    #[test]
    fn test_register_keys() {
        assert_eq!(Register::R0.key(), "r0");
        assert_eq!(Register::Pc.key(), "r15");
        assert_eq!(Register::Psr.key(), "psr");
        assert_eq!(Register::Pc.display_name(), "pc");
        assert_eq!(Register::from_key("r13"), Some(Register::Sp));
        assert_eq!(Register::from_key("r16"), None);
        assert_eq!(Register::all().count(), 17);
    }

    #[test]
    fn test_psr_flags() {
        assert_eq!(psr_flags(0), "     ");
        assert_eq!(psr_flags(0xf8000000), "NZCVQ");
        assert_eq!(psr_flags(0x60000000), " ZC  ");
    }

    #[test]
    fn test_diff_and_apply() {
        let mut a = RegisterFile::default();
        a.set(Register::R1, 5);
        let mut b = a.clone();
        b.set(Register::R2, 7);
        b.set(Register::Psr, 0x80000000);
        let delta = b.diff_from(&a);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta["r2"], 7);
        assert_eq!(delta["psr"], 0x80000000);
        let mut c = a.clone();
        c.apply(&delta);
        assert_eq!(c, b);
    }
}
