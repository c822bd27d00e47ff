//! Value kinds.
//!
//! A mode classifies what a node computes: an integer of a given width and
//! signedness, a float, a pointer, the pseudo-values memory and control
//! flow, or a tuple of results. Modes are plain copyable tags; all layout
//! questions beyond the bit width go through the type graph.

use std::fmt;

/// The closed set of value kinds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Mode {
    /// Signed integers.
    Is8,
    Is16,
    Is32,
    Is64,
    /// Unsigned integers.
    Iu8,
    Iu16,
    Iu32,
    Iu64,
    /// IEEE floats.
    F32,
    F64,
    /// Pointer / address.
    P,
    /// Internal boolean (compare results, Cond selectors).
    B,
    /// Memory state.
    M,
    /// Control flow.
    X,
    /// Tuple of results.
    T,
    /// Wildcard used by sentinels.
    Any,
    /// Result of a Bad node.
    Bad,
}

impl Mode {
    /// Bit width of a data mode. Pointers report the width chosen at
    /// initialization time by convention of the host (64 here).
    pub fn bits(self) -> u32 {
        match self {
            Mode::Is8 | Mode::Iu8 => 8,
            Mode::Is16 | Mode::Iu16 => 16,
            Mode::Is32 | Mode::Iu32 | Mode::F32 => 32,
            Mode::Is64 | Mode::Iu64 | Mode::F64 | Mode::P => 64,
            Mode::B => 1,
            Mode::M | Mode::X | Mode::T | Mode::Any | Mode::Bad => 0,
        }
    }

    pub fn bytes(self) -> u32 {
        (self.bits() + 7) / 8
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Mode::Is8 | Mode::Is16 | Mode::Is32 | Mode::Is64 | Mode::F32 | Mode::F64
        )
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            Mode::Is8
                | Mode::Is16
                | Mode::Is32
                | Mode::Is64
                | Mode::Iu8
                | Mode::Iu16
                | Mode::Iu32
                | Mode::Iu64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Mode::F32 | Mode::F64)
    }

    pub fn is_reference(self) -> bool {
        self == Mode::P
    }

    /// Numeric: usable as operand of arithmetic.
    pub fn is_num(self) -> bool {
        self.is_int() || self.is_float() || self == Mode::P
    }

    /// Data: a value that can live in a register or memory cell.
    pub fn is_data(self) -> bool {
        self.is_num() || self == Mode::B
    }

    /// The unsigned counterpart of an integer mode.
    pub fn unsigned(self) -> Mode {
        match self {
            Mode::Is8 => Mode::Iu8,
            Mode::Is16 => Mode::Iu16,
            Mode::Is32 => Mode::Iu32,
            Mode::Is64 => Mode::Iu64,
            m => m,
        }
    }

    /// The signed counterpart of an integer mode.
    pub fn signed(self) -> Mode {
        match self {
            Mode::Iu8 => Mode::Is8,
            Mode::Iu16 => Mode::Is16,
            Mode::Iu32 => Mode::Is32,
            Mode::Iu64 => Mode::Is64,
            m => m,
        }
    }

    /// Whether a Conv from `self` to `to` is a representation change the
    /// kernel accepts (data mode to data mode).
    pub fn convertible_to(self, to: Mode) -> bool {
        self.is_data() && to.is_data()
    }

    /// Smallest/largest value representable in an integer mode, as i128.
    pub fn min_value(self) -> i128 {
        if self.is_signed() {
            -(1i128 << (self.bits() - 1))
        } else {
            0
        }
    }

    pub fn max_value(self) -> i128 {
        if self.is_signed() {
            (1i128 << (self.bits() - 1)) - 1
        } else {
            (1i128 << self.bits()) - 1
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Is8 => "Is8",
            Mode::Is16 => "Is16",
            Mode::Is32 => "Is32",
            Mode::Is64 => "Is64",
            Mode::Iu8 => "Iu8",
            Mode::Iu16 => "Iu16",
            Mode::Iu32 => "Iu32",
            Mode::Iu64 => "Iu64",
            Mode::F32 => "F32",
            Mode::F64 => "F64",
            Mode::P => "P",
            Mode::B => "b",
            Mode::M => "M",
            Mode::X => "X",
            Mode::T => "T",
            Mode::Any => "ANY",
            Mode::Bad => "BAD",
        }
    }

    pub fn from_name(name: &str) -> Option<Mode> {
        Some(match name {
            "Is8" => Mode::Is8,
            "Is16" => Mode::Is16,
            "Is32" => Mode::Is32,
            "Is64" => Mode::Is64,
            "Iu8" => Mode::Iu8,
            "Iu16" => Mode::Iu16,
            "Iu32" => Mode::Iu32,
            "Iu64" => Mode::Iu64,
            "F32" => Mode::F32,
            "F64" => Mode::F64,
            "P" => Mode::P,
            "b" => Mode::B,
            "M" => Mode::M,
            "X" => Mode::X,
            "T" => Mode::T,
            "ANY" => Mode::Any,
            "BAD" => Mode::Bad,
            _ => return None,
        })
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_and_signedness() {
        assert_eq!(Mode::Is32.bits(), 32);
        assert!(Mode::Is32.is_signed());
        assert!(!Mode::Iu32.is_signed());
        assert_eq!(Mode::Is32.unsigned(), Mode::Iu32);
        assert_eq!(Mode::Iu16.signed(), Mode::Is16);
        assert!(Mode::P.is_num());
        assert!(!Mode::M.is_data());
    }

    #[test]
    fn int_ranges() {
        assert_eq!(Mode::Is8.min_value(), -128);
        assert_eq!(Mode::Is8.max_value(), 127);
        assert_eq!(Mode::Iu8.max_value(), 255);
        assert_eq!(Mode::Iu64.max_value(), u64::MAX as i128);
    }

    #[test]
    fn name_round_trip() {
        for m in [Mode::Is32, Mode::Iu64, Mode::F64, Mode::P, Mode::M, Mode::X] {
            assert_eq!(Mode::from_name(m.name()), Some(m));
        }
    }
}
