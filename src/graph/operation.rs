//! Operations backing struct nodes.
//!
//! Two-layer design:
//! - **`OperationPlugin` trait**: for operations registered by the host.
//! - **`BuiltinOp` enum**: for the built-in operation set, dispatched with a
//!   plain match on the hot path.
//!
//! `Operation` wraps either variant so the compiler and runtime can handle
//! both uniformly.

use std::fmt;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::buffer::ops::ArithOp;
use crate::buffer::value::{Value, ValueKind};
use crate::graph::id::GraphId;
use crate::graph::types::{PinFlags, PinSchema, SchemaType};
use crate::runtime::compute::ComputeContext;
use crate::runtime::value::RuntimeValue;
use crate::sync::{read, write};

/// Trait for host-provided operations.
///
/// Plugins are always strict: every input is evaluated before `compute`
/// runs on a worker thread.
pub trait OperationPlugin: Send + Sync + fmt::Debug {
    /// Name used by declarative struct nodes.
    fn name(&self) -> &str;

    /// Pin schema, inputs and outputs in declaration order.
    fn pins(&self) -> &[PinSchema];

    /// Compute all outputs from the evaluated inputs.
    fn compute(
        &self,
        ctx: &ComputeContext,
        inputs: &[RuntimeValue],
    ) -> Result<Vec<RuntimeValue>, String>;

    /// Distinguishes differently configured instances in graph signatures.
    fn fingerprint(&self) -> u64 {
        0
    }
}

// ==================== Builtin schemas ====================

use SchemaType::{AnyData, Exec, Kind};

const BINARY_PINS: &[PinSchema] = &[
    PinSchema::input("A", AnyData),
    PinSchema::input("B", AnyData),
    PinSchema::output("Result", AnyData),
];

const ABS_PINS: &[PinSchema] = &[
    PinSchema::input("Value", AnyData),
    PinSchema::output("Result", AnyData),
];

const LENGTH_PINS: &[PinSchema] = &[
    PinSchema::input("Vector", Kind(ValueKind::Vector)).with_flags(PinFlags::MUST_CONNECT),
    PinSchema::output("Length", Kind(ValueKind::Float)),
];

const MAKE_VECTOR_PINS: &[PinSchema] = &[
    PinSchema::input("X", Kind(ValueKind::Float)).with_default(Value::Float(0.0)),
    PinSchema::input("Y", Kind(ValueKind::Float)).with_default(Value::Float(0.0)),
    PinSchema::input("Z", Kind(ValueKind::Float)).with_default(Value::Float(0.0)),
    PinSchema::output("Vector", Kind(ValueKind::Vector)),
];

const SPLIT_VECTOR_PINS: &[PinSchema] = &[
    PinSchema::input("Vector", Kind(ValueKind::Vector)).with_flags(PinFlags::MUST_CONNECT),
    PinSchema::output("X", Kind(ValueKind::Float)),
    PinSchema::output("Y", Kind(ValueKind::Float)),
    PinSchema::output("Z", Kind(ValueKind::Float)),
];

const LESS_PINS: &[PinSchema] = &[
    PinSchema::input("A", AnyData),
    PinSchema::input("B", AnyData),
    PinSchema::output("Result", Kind(ValueKind::Bool)),
];

const SELECT_PINS: &[PinSchema] = &[
    PinSchema::input("Condition", Kind(ValueKind::Bool)).with_default(Value::Bool(false)),
    PinSchema::input("True", AnyData),
    PinSchema::input("False", AnyData),
    PinSchema::output("Result", AnyData),
];

const GET_POSITION_PINS: &[PinSchema] = &[PinSchema::output("Position", Kind(ValueKind::Vector))];

const GET_LOD_PINS: &[PinSchema] = &[
    PinSchema::input("Lod", Kind(ValueKind::Int))
        .with_default(Value::Int(0))
        .with_flags(PinFlags::VIRTUAL),
    PinSchema::output("Result", Kind(ValueKind::Int)),
];

const EMIT_PINS: &[PinSchema] = &[
    PinSchema::input("Value", AnyData).with_flags(PinFlags::MUST_CONNECT),
    PinSchema::output("Exec", Exec),
];

const LERP_PINS: &[PinSchema] = &[
    PinSchema::input("A", AnyData),
    PinSchema::input("B", AnyData),
    PinSchema::input("Alpha", AnyData),
    PinSchema::output("Result", AnyData),
];

const EXECUTE_PINS: &[PinSchema] = &[PinSchema::input("Exec", Exec)];

// ==================== BuiltinOp ====================

/// Built-in operations.
///
/// The first group is available to declarative struct nodes by name. The
/// rest are created by the translator and the compiler passes.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinOp {
    Arith(ArithOp),
    Abs,
    Length,
    MakeVector,
    SplitVector,
    Less,
    /// Lazy: only the chosen branch is evaluated for constant conditions.
    Select,
    GetPosition,
    GetLod,
    /// Turns a value into an exec trigger.
    Emit,
    /// Template, expanded into subtract, multiply and add.
    Lerp,
    /// Marks an exec pin as a graph-level exec output. Removed at compile time.
    Execute,

    MergeExec { inputs: u32 },
    RootExecute,
    GraphInput {
        name: Arc<str>,
        default: Option<Value>,
        has_default_pin: bool,
    },
    GraphOutput { name: Arc<str> },
    ParameterRead { guid: Arc<str>, default: Value },
    /// Calls another graph through its own executors.
    /// `outputs` maps each output pin to the callee's output node id.
    CallGraph {
        graph: GraphId,
        outputs: Vec<(Arc<str>, Arc<str>)>,
        recursive: bool,
    },
    /// Template, replaced by a copy of the referenced graph.
    InlineGraph { graph: GraphId },
}

impl BuiltinOp {
    /// Names accepted by [`OperationRegistry::create`].
    pub const NAMES: &'static [&'static str] = &[
        "Add",
        "Subtract",
        "Multiply",
        "Divide",
        "Min",
        "Max",
        "Abs",
        "Length",
        "MakeVector",
        "SplitVector",
        "Less",
        "Select",
        "GetPosition",
        "GetLod",
        "Emit",
        "Lerp",
        "Execute",
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "Add" => BuiltinOp::Arith(ArithOp::Add),
            "Subtract" => BuiltinOp::Arith(ArithOp::Subtract),
            "Multiply" => BuiltinOp::Arith(ArithOp::Multiply),
            "Divide" => BuiltinOp::Arith(ArithOp::Divide),
            "Min" => BuiltinOp::Arith(ArithOp::Min),
            "Max" => BuiltinOp::Arith(ArithOp::Max),
            "Abs" => BuiltinOp::Abs,
            "Length" => BuiltinOp::Length,
            "MakeVector" => BuiltinOp::MakeVector,
            "SplitVector" => BuiltinOp::SplitVector,
            "Less" => BuiltinOp::Less,
            "Select" => BuiltinOp::Select,
            "GetPosition" => BuiltinOp::GetPosition,
            "GetLod" => BuiltinOp::GetLod,
            "Emit" => BuiltinOp::Emit,
            "Lerp" => BuiltinOp::Lerp,
            "Execute" => BuiltinOp::Execute,
            _ => return None,
        };
        Some(op)
    }

    pub fn name(&self) -> &str {
        match self {
            BuiltinOp::Arith(ArithOp::Add) => "Add",
            BuiltinOp::Arith(ArithOp::Subtract) => "Subtract",
            BuiltinOp::Arith(ArithOp::Multiply) => "Multiply",
            BuiltinOp::Arith(ArithOp::Divide) => "Divide",
            BuiltinOp::Arith(ArithOp::Min) => "Min",
            BuiltinOp::Arith(ArithOp::Max) => "Max",
            BuiltinOp::Abs => "Abs",
            BuiltinOp::Length => "Length",
            BuiltinOp::MakeVector => "MakeVector",
            BuiltinOp::SplitVector => "SplitVector",
            BuiltinOp::Less => "Less",
            BuiltinOp::Select => "Select",
            BuiltinOp::GetPosition => "GetPosition",
            BuiltinOp::GetLod => "GetLod",
            BuiltinOp::Emit => "Emit",
            BuiltinOp::Lerp => "Lerp",
            BuiltinOp::Execute => "Execute",
            BuiltinOp::MergeExec { .. } => "MergeExec",
            BuiltinOp::RootExecute => "RootExecute",
            BuiltinOp::GraphInput { .. } => "GraphInput",
            BuiltinOp::GraphOutput { .. } => "GraphOutput",
            BuiltinOp::ParameterRead { .. } => "ParameterRead",
            BuiltinOp::CallGraph { .. } => "CallGraph",
            BuiltinOp::InlineGraph { .. } => "InlineGraph",
        }
    }

    /// Static pin schema. `None` for operations whose pins come from the
    /// declarative node or are built by the compiler.
    pub fn schema(&self) -> Option<&'static [PinSchema]> {
        let pins = match self {
            BuiltinOp::Arith(_) => BINARY_PINS,
            BuiltinOp::Abs => ABS_PINS,
            BuiltinOp::Length => LENGTH_PINS,
            BuiltinOp::MakeVector => MAKE_VECTOR_PINS,
            BuiltinOp::SplitVector => SPLIT_VECTOR_PINS,
            BuiltinOp::Less => LESS_PINS,
            BuiltinOp::Select => SELECT_PINS,
            BuiltinOp::GetPosition => GET_POSITION_PINS,
            BuiltinOp::GetLod => GET_LOD_PINS,
            BuiltinOp::Emit => EMIT_PINS,
            BuiltinOp::Lerp => LERP_PINS,
            BuiltinOp::Execute => EXECUTE_PINS,
            _ => return None,
        };
        Some(pins)
    }

    /// Templates are expanded away before execution.
    pub fn is_template(&self) -> bool {
        matches!(self, BuiltinOp::Lerp | BuiltinOp::InlineGraph { .. })
    }

    /// Lazy operations evaluate their inputs on demand.
    pub fn is_lazy(&self) -> bool {
        matches!(
            self,
            BuiltinOp::Select
                | BuiltinOp::RootExecute
                | BuiltinOp::GraphInput { .. }
                | BuiltinOp::CallGraph { .. }
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            BuiltinOp::Arith(_) => "Element-wise arithmetic on two values of the same kind.",
            BuiltinOp::Abs => "Absolute value.",
            BuiltinOp::Length => "Length of a vector.",
            BuiltinOp::MakeVector => "Builds a vector from three floats.",
            BuiltinOp::SplitVector => "Splits a vector into its components.",
            BuiltinOp::Less => "A < B, element-wise.",
            BuiltinOp::Select => "Picks True or False per element.",
            BuiltinOp::GetPosition => "Positions of the current query.",
            BuiltinOp::GetLod => "Level of detail of the current query.",
            BuiltinOp::Emit => "Emits a value as an exec trigger.",
            BuiltinOp::Lerp => "A + (B - A) * Alpha.",
            BuiltinOp::Execute => "Marks a graph-level exec output.",
            BuiltinOp::MergeExec { .. } => "Concatenates exec triggers.",
            BuiltinOp::RootExecute => "Root of the exec chain.",
            BuiltinOp::GraphInput { .. } => "Reads a graph input from the calling context.",
            BuiltinOp::GraphOutput { .. } => "Graph output.",
            BuiltinOp::ParameterRead { .. } => "Reads a graph parameter.",
            BuiltinOp::CallGraph { .. } => "Evaluates another graph.",
            BuiltinOp::InlineGraph { .. } => "Inlines another graph.",
        }
    }
}

// ==================== Operation ====================

/// Either a built-in operation or a plugin.
#[derive(Debug, Clone)]
pub enum Operation {
    Builtin(BuiltinOp),
    Plugin(Arc<dyn OperationPlugin>),
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::Builtin(op) => op.name(),
            Operation::Plugin(p) => p.name(),
        }
    }

    pub fn schema(&self) -> Option<&[PinSchema]> {
        match self {
            Operation::Builtin(op) => op.schema(),
            Operation::Plugin(p) => Some(p.pins()),
        }
    }

    pub fn is_template(&self) -> bool {
        match self {
            Operation::Builtin(op) => op.is_template(),
            Operation::Plugin(_) => false,
        }
    }

    pub fn as_builtin(&self) -> Option<&BuiltinOp> {
        match self {
            Operation::Builtin(op) => Some(op),
            Operation::Plugin(_) => None,
        }
    }

    /// Stable description used in graph signatures.
    pub fn signature(&self) -> String {
        match self {
            Operation::Builtin(op) => format!("{op:?}"),
            Operation::Plugin(p) => format!("plugin:{}:{}", p.name(), p.fingerprint()),
        }
    }
}

impl From<BuiltinOp> for Operation {
    fn from(op: BuiltinOp) -> Self {
        Operation::Builtin(op)
    }
}

// ==================== OperationRegistry ====================

/// Resolves struct-node operation names.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    plugins: RwLock<FxHashMap<String, Arc<dyn OperationPlugin>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Built-in names cannot be shadowed.
    pub fn register_plugin(&self, plugin: Arc<dyn OperationPlugin>) -> bool {
        let name = plugin.name().to_string();
        if BuiltinOp::from_name(&name).is_some() {
            tracing::warn!("Plugin '{}' shadows a builtin operation, ignoring", name);
            return false;
        }
        tracing::debug!("Registered operation plugin '{}'", name);
        write(&self.plugins).insert(name, plugin);
        true
    }

    pub fn create(&self, name: &str) -> Option<Operation> {
        if let Some(op) = BuiltinOp::from_name(name) {
            return Some(Operation::Builtin(op));
        }
        read(&self.plugins).get(name).cloned().map(Operation::Plugin)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.plugins).keys().cloned().collect();
        names.sort();
        names
    }
}
