//! Pin types and static pin schemas.
//!
//! Declarative graphs carry concrete [`PinType`]s on every pin. Operations
//! describe what they accept through static `PinSchema` arrays, which the
//! translator uses to validate the declarative node against the operation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::buffer::value::{Value, ValueKind};

/// The type carried by a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PinType {
    /// Not yet resolved. Must be gone before a graph can be built.
    Wildcard,
    /// Execution flow. Carries emitted triggers, not data.
    Exec,
    /// A single value.
    Scalar(ValueKind),
    /// One value per queried position.
    Buffer(ValueKind),
}

impl PinType {
    pub fn is_wildcard(self) -> bool {
        matches!(self, PinType::Wildcard)
    }

    pub fn is_exec(self) -> bool {
        matches!(self, PinType::Exec)
    }

    pub fn value_kind(self) -> Option<ValueKind> {
        match self {
            PinType::Scalar(k) | PinType::Buffer(k) => Some(k),
            PinType::Wildcard | PinType::Exec => None,
        }
    }

    /// Whether an output of type `self` may feed an input of type `input`.
    ///
    /// Scalars promote to buffers of the same kind. Wildcards link to
    /// anything and are rejected later by the wildcard check.
    pub fn can_link_to(self, input: PinType) -> bool {
        match (self, input) {
            (PinType::Wildcard, _) | (_, PinType::Wildcard) => true,
            (PinType::Scalar(a), PinType::Buffer(b)) => a == b,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for PinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinType::Wildcard => write!(f, "wildcard"),
            PinType::Exec => write!(f, "exec"),
            PinType::Scalar(k) => write!(f, "{k}"),
            PinType::Buffer(k) => write!(f, "{k} buffer"),
        }
    }
}

/// Whether a pin is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PinDirection {
    Input,
    Output,
}

/// Extra pin behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PinFlags {
    /// Filled through a side channel rather than data flow. Links into it
    /// are cut before execution.
    pub virtual_pin: bool,
    /// A link is required; the default value is not an acceptable input.
    pub must_connect: bool,
}

impl PinFlags {
    pub const NONE: PinFlags = PinFlags {
        virtual_pin: false,
        must_connect: false,
    };
    pub const VIRTUAL: PinFlags = PinFlags {
        virtual_pin: true,
        must_connect: false,
    };
    pub const MUST_CONNECT: PinFlags = PinFlags {
        virtual_pin: false,
        must_connect: true,
    };
}

/// What a schema pin accepts from the declarative side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    /// Any data type. Exec is not data.
    AnyData,
    Exec,
    /// Scalar or buffer of this kind.
    Kind(ValueKind),
}

impl SchemaType {
    pub fn accepts(self, ty: PinType) -> bool {
        match (self, ty) {
            (SchemaType::Exec, PinType::Exec) => true,
            (SchemaType::AnyData, PinType::Scalar(_) | PinType::Buffer(_) | PinType::Wildcard) => true,
            (SchemaType::Kind(k), PinType::Scalar(t) | PinType::Buffer(t)) => k == t,
            _ => false,
        }
    }
}

/// Static descriptor for an operation's pin.
#[derive(Debug, Clone)]
pub struct PinSchema {
    pub name: &'static str,
    pub direction: PinDirection,
    pub ty: SchemaType,
    pub default: Option<Value>,
    pub flags: PinFlags,
}

impl PinSchema {
    pub const fn input(name: &'static str, ty: SchemaType) -> Self {
        Self {
            name,
            direction: PinDirection::Input,
            ty,
            default: None,
            flags: PinFlags::NONE,
        }
    }

    pub const fn output(name: &'static str, ty: SchemaType) -> Self {
        Self {
            name,
            direction: PinDirection::Output,
            ty,
            default: None,
            flags: PinFlags::NONE,
        }
    }

    pub const fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub const fn with_flags(mut self, flags: PinFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_promotes_to_buffer() {
        let scalar = PinType::Scalar(ValueKind::Float);
        let buffer = PinType::Buffer(ValueKind::Float);
        assert!(scalar.can_link_to(buffer));
        assert!(!buffer.can_link_to(scalar));
        assert!(!scalar.can_link_to(PinType::Buffer(ValueKind::Int)));
        assert!(!PinType::Exec.can_link_to(scalar));
    }

    #[test]
    fn test_schema_accepts() {
        assert!(SchemaType::AnyData.accepts(PinType::Buffer(ValueKind::Vector)));
        assert!(!SchemaType::AnyData.accepts(PinType::Exec));
        assert!(SchemaType::Kind(ValueKind::Bool).accepts(PinType::Scalar(ValueKind::Bool)));
        assert!(!SchemaType::Kind(ValueKind::Bool).accepts(PinType::Wildcard));
    }
}
