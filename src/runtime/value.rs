//! Values flowing between runtime nodes.

use std::sync::Arc;

use crate::buffer::value::Value;
use crate::buffer::Buffer;
use crate::graph::id::NodeKey;
use crate::graph::types::PinType;

/// One trigger produced by an exec output.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecTrigger {
    pub node: NodeKey,
    pub value: Buffer,
}

/// Ordered list of triggers. Shared, never copied.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecList(Arc<Vec<ExecTrigger>>);

impl ExecList {
    pub fn new(triggers: Vec<ExecTrigger>) -> Self {
        Self(Arc::new(triggers))
    }

    pub fn single(trigger: ExecTrigger) -> Self {
        Self::new(vec![trigger])
    }

    pub fn concat<'a>(lists: impl IntoIterator<Item = &'a ExecList>) -> Self {
        let mut all = Vec::new();
        for list in lists {
            all.extend(list.0.iter().cloned());
        }
        Self::new(all)
    }

    pub fn triggers(&self) -> &[ExecTrigger] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RuntimeValue {
    /// Nothing was produced. Consumers treat it as the neutral value of
    /// the pin type.
    #[default]
    Empty,
    Buffer(Buffer),
    Exec(ExecList),
}

/// Outputs of one runtime node, in output pin order.
pub type NodeOutputs = Arc<[RuntimeValue]>;

impl RuntimeValue {
    pub fn constant(value: Value) -> Self {
        RuntimeValue::Buffer(Buffer::constant(value))
    }

    /// Neutral value for a pin: the type default for scalars, an empty
    /// buffer for buffers, no triggers for exec.
    pub fn neutral(pin_type: PinType) -> Self {
        match pin_type {
            PinType::Scalar(k) => RuntimeValue::constant(Value::type_default(k)),
            PinType::Buffer(k) => RuntimeValue::Buffer(Buffer::empty(k)),
            PinType::Exec => RuntimeValue::Exec(ExecList::default()),
            PinType::Wildcard => RuntimeValue::Empty,
        }
    }

    /// Value for an unlinked input: its default, else the neutral value.
    pub fn from_default(default: Option<Value>, pin_type: PinType) -> Self {
        match (default, pin_type) {
            (_, PinType::Exec) => RuntimeValue::Exec(ExecList::default()),
            (Some(v), _) => RuntimeValue::constant(v),
            (None, ty) => RuntimeValue::neutral(ty),
        }
    }

    /// Replace `Empty` by the neutral value of `pin_type`.
    pub fn or_neutral(self, pin_type: PinType) -> Self {
        match self {
            RuntimeValue::Empty => RuntimeValue::neutral(pin_type),
            v => v,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            RuntimeValue::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_exec(&self) -> Option<&ExecList> {
        match self {
            RuntimeValue::Exec(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RuntimeValue::Empty)
    }
}

impl From<Buffer> for RuntimeValue {
    fn from(b: Buffer) -> Self {
        RuntimeValue::Buffer(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::value::ValueKind;
    use crate::graph::id::GraphId;

    #[test]
    fn test_neutral_values() {
        assert_eq!(
            RuntimeValue::neutral(PinType::Scalar(ValueKind::Float)),
            RuntimeValue::constant(Value::Float(0.0))
        );
        assert_eq!(
            RuntimeValue::neutral(PinType::Buffer(ValueKind::Int)).as_buffer().unwrap().len(),
            0
        );
        assert!(RuntimeValue::neutral(PinType::Exec).as_exec().unwrap().is_empty());
        assert_eq!(
            RuntimeValue::Empty.or_neutral(PinType::Scalar(ValueKind::Bool)),
            RuntimeValue::constant(Value::Bool(false))
        );
    }

    #[test]
    fn test_exec_concat_keeps_order() {
        let t = |n: &str| ExecTrigger {
            node: NodeKey::new(GraphId(0), n),
            value: Buffer::constant(Value::Int(1)),
        };
        let a = ExecList::new(vec![t("a"), t("b")]);
        let b = ExecList::single(t("c"));
        let all = ExecList::concat([&a, &b]);
        let names: Vec<_> = all.triggers().iter().map(|t| t.node.node.to_string()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
