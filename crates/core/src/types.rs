//! `VarType`: the tag that drives every operator dispatch (spec §3.1).

use std::fmt;

/// Sub-kind of a `Real` value. All three are stored as `f64` at runtime;
/// the sub-tag only affects formatting and range-check behavior, mirroring
/// the original VM's `TYPE_FLOAT` / `TYPE_DOUBLE` / `TYPE_LONG_DOUBLE` split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealKind {
    Float,
    Double,
    LongDouble,
}

impl fmt::Display for RealKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RealKind::Float => "Float",
            RealKind::Double => "Double",
            RealKind::LongDouble => "LongDouble",
        };
        write!(f, "{s}")
    }
}

/// The discriminant every `Value` carries. Operators dispatch on this tag,
/// never on source location (spec §3.1 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
    Integer,
    Byte,
    Word,
    Cardinal,
    Real(RealKind),
    Boolean,
    Char,
    Enum,
    String,
    Set,
    Array,
    Record,
    MemoryStream,
    File,
    Pointer,
    Nil,
    Closure,
    Void,
}

impl VarType {
    /// True for the ordinal kinds the `Byte, Word, Char, Boolean ⊆ Integer`
    /// side of the coercion lattice covers (spec §4.1).
    pub fn is_int_like(self) -> bool {
        matches!(
            self,
            VarType::Integer | VarType::Byte | VarType::Word | VarType::Cardinal
                | VarType::Char | VarType::Boolean | VarType::Enum
        )
    }

    pub fn is_real(self) -> bool {
        matches!(self, VarType::Real(_))
    }

    pub fn is_numeric(self) -> bool {
        self.is_int_like() || self.is_real()
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarType::Integer => write!(f, "Integer"),
            VarType::Byte => write!(f, "Byte"),
            VarType::Word => write!(f, "Word"),
            VarType::Cardinal => write!(f, "Cardinal"),
            VarType::Real(k) => write!(f, "{k}"),
            VarType::Boolean => write!(f, "Boolean"),
            VarType::Char => write!(f, "Char"),
            VarType::Enum => write!(f, "Enum"),
            VarType::String => write!(f, "String"),
            VarType::Set => write!(f, "Set"),
            VarType::Array => write!(f, "Array"),
            VarType::Record => write!(f, "Record"),
            VarType::MemoryStream => write!(f, "MemoryStream"),
            VarType::File => write!(f, "File"),
            VarType::Pointer => write!(f, "Pointer"),
            VarType::Nil => write!(f, "Nil"),
            VarType::Closure => write!(f, "Closure"),
            VarType::Void => write!(f, "Void"),
        }
    }
}
