//! Built-in function table.
//!
//! Compile-time lookup is by source name; the opcode parameter is the
//! numeric id, which the VM maps back through `from_repr` at dispatch.

use std::str::FromStr;

use strum::{EnumIter, EnumString, FromRepr, IntoStaticStr};

/// The built-in functions callable from KBasic programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumIter, FromRepr, IntoStaticStr)]
#[repr(u32)]
#[strum(serialize_all = "lowercase")]
pub enum Builtin {
    /// Print a value; pushes Number 0 as its result.
    P = 1,
    Sin,
    Cos,
    Tan,
    Sqrt,
    Exp,
    Abs,
    Log,
    Floor,
    Ceil,
    /// Uniform number in `[0, 1)`.
    Rand,
    /// Byte length of a string, element count of an array.
    Len,
    /// Numeric value of a string prefix.
    Val,
    /// One-character string from a numeric code.
    Chr,
    /// Numeric code of a string's first byte.
    Asc,
}

impl Builtin {
    /// Declared parameter count.
    pub fn arity(self) -> usize {
        match self {
            Self::Rand => 0,
            _ => 1,
        }
    }

    /// Resolves a source-level function name.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::from_str(name).ok()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn lookup_by_source_name() {
        assert_eq!(Builtin::lookup("p"), Some(Builtin::P));
        assert_eq!(Builtin::lookup("sqrt"), Some(Builtin::Sqrt));
        assert_eq!(Builtin::lookup("asc"), Some(Builtin::Asc));
        assert_eq!(Builtin::lookup("nope"), None);
    }

    #[test]
    fn ids_round_trip() {
        for builtin in Builtin::iter() {
            assert_eq!(Builtin::from_repr(builtin as u32), Some(builtin));
        }
        assert_eq!(Builtin::from_repr(0), None);
    }

    #[test]
    fn arity_table() {
        assert_eq!(Builtin::Rand.arity(), 0);
        assert_eq!(Builtin::P.arity(), 1);
        assert_eq!(Builtin::Len.arity(), 1);
    }
}
