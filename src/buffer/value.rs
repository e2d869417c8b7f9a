//! Terminal values and their kinds.

use crate::math::Vec3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a buffer or scalar pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Vector,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Int => write!(f, "int"),
            ValueKind::Float => write!(f, "float"),
            ValueKind::Vector => write!(f, "vector"),
        }
    }
}

/// A single terminal value, used for pin defaults and constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f32),
    Vector(Vec3),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Vector(_) => ValueKind::Vector,
        }
    }

    /// Zero value of a kind.
    pub fn type_default(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Vector => Value::Vector(Vec3::ZERO),
        }
    }

    /// Totally ordered bit pattern, used for structural signatures.
    pub fn ordered_bits(&self) -> (u8, [u64; 3]) {
        match *self {
            Value::Bool(b) => (0, [b as u64, 0, 0]),
            Value::Int(i) => (1, [i as u32 as u64, 0, 0]),
            Value::Float(f) => (2, [f.to_bits() as u64, 0, 0]),
            Value::Vector(v) => (3, [v.x.to_bits(), v.y.to_bits(), v.z.to_bits()]),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Vector(v) => write!(f, "({}, {}, {})", v.x, v.y, v.z),
        }
    }
}
