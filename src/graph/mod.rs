//! Graph compiler.
//!
//! Declarative graphs ([`CompiledGraph`]) are translated into a mutable IR
//! ([`IrGraph`]), rewritten by a fixed sequence of passes, and built into an
//! immutable [`Executor`](crate::runtime::Executor).
//!
//! ```text
//! CompiledGraph ──► Translator ──► IrGraph ──► passes ──► Executor
//!                        ▲
//!                 CompilationScope (one translation per graph per session)
//! ```
//!
//! # Design
//!
//! - **Arena IR** - nodes and pins live in slot maps; links are a side table.
//! - **Enum dispatch** - `BuiltinOp` covers every built-in operation;
//!   `OperationPlugin` is the open extension point.
//! - **Diagnostics, not panics** - structural problems become diagnostics
//!   attributed to a node and pin, and abort the compile.

pub mod cache;
pub mod compiled;
pub mod compiler;
pub mod error;
pub mod id;
pub mod ir;
pub mod library;
pub mod operation;
pub mod passes;
pub mod templates;
pub mod translate;
pub mod types;

pub use cache::{CompilationScope, TranslatedGraph};
pub use compiled::{CompiledGraph, CompiledNode, CompiledNodeKind, CompiledPin, GraphParameter, MacroMode, PinEndpoint};
pub use compiler::{CompileOutput, GraphCompiler, ROOT_NODE};
pub use error::{GraphError, GraphResult};
pub use id::{GraphId, GraphPinRef, IrNodeId, IrPinId, NodeKey, OUTPUT_NODE_PREFIX};
pub use ir::{GraphSignature, IrGraph, IrNode, IrNodeKind, IrPin, PinSpec};
pub use library::{GraphLibrary, GraphProvider};
pub use operation::{BuiltinOp, Operation, OperationPlugin, OperationRegistry};
pub use translate::{Translation, Translator};
pub use types::{PinDirection, PinFlags, PinSchema, PinType, SchemaType};
