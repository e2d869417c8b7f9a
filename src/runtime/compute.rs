//! Per-operation compute rules.
//!
//! Strict operations join all their inputs and run on a worker. Lazy
//! operations (`Select`, `RootExecute`, `GraphInput`, `CallGraph`) decide
//! which inputs to evaluate. Failures never abort a query: the node yields
//! neutral outputs and reports a diagnostic once per executor.

use std::sync::Arc;

use crate::buffer::ops;
use crate::buffer::value::Value;
use crate::buffer::Buffer;
use crate::diagnostics::{Diagnostic, Severity};
use crate::graph::id::{GraphId, GraphPinRef, NodeKey};
use crate::graph::operation::{BuiltinOp, Operation};
use crate::query::future::FutureValue;
use crate::query::parameters::{GraphParameterValues, LodQuery, PositionQuery};
use crate::query::query::{ContextInputs, Query};
use crate::query::task::TaskThread;
use crate::runtime::executor::{Executor, RuntimeNode};
use crate::runtime::value::{ExecList, ExecTrigger, NodeOutputs, RuntimeValue};

/// What a compute rule can see besides its inputs.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    query: Query,
    node: NodeKey,
    executor_id: u64,
}

impl ComputeContext {
    pub fn new(query: Query, node: NodeKey, executor_id: u64) -> Self {
        Self {
            query,
            node,
            executor_id,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn node(&self) -> &NodeKey {
        &self.node
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.report(Severity::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.report(Severity::Error, message.into());
    }

    /// Deduplicated per executor so a broken node evaluated every frame
    /// reports once.
    fn report(&self, severity: Severity, message: String) {
        let diagnostic = Diagnostic::new(severity, message).with_node(self.node.clone());
        self.query.diagnostics().report_once(self.executor_id, diagnostic);
    }
}

fn neutral_outputs(node: &RuntimeNode) -> NodeOutputs {
    node.outputs
        .iter()
        .map(|o| RuntimeValue::neutral(o.pin_type))
        .collect()
}

fn finish(ctx: &ComputeContext, node: &RuntimeNode, result: Result<Vec<RuntimeValue>, String>) -> NodeOutputs {
    match result {
        Ok(values) if values.len() == node.outputs.len() => values
            .into_iter()
            .zip(&node.outputs)
            .map(|(v, o)| v.or_neutral(o.pin_type))
            .collect(),
        Ok(values) => {
            ctx.error(format!(
                "{} produced {} outputs, expected {}",
                node.operation.name(),
                values.len(),
                node.outputs.len()
            ));
            neutral_outputs(node)
        }
        Err(message) => {
            ctx.error(format!("{}: {}", node.operation.name(), message));
            neutral_outputs(node)
        }
    }
}

/// Entry point used by [`Executor::evaluate_node`].
pub fn compute_node(executor: &Arc<Executor>, index: u32, query: &Query) -> FutureValue<NodeOutputs> {
    let Some(node) = executor.node(index) else {
        tracing::error!("Executor {} has no node {}", executor.id(), index);
        return FutureValue::resolved(NodeOutputs::from(Vec::new()));
    };
    let ctx = ComputeContext::new(query.clone(), node.key.clone(), executor.id());

    match &node.operation {
        Operation::Builtin(BuiltinOp::Select) => compute_select(executor, index, ctx),
        Operation::Builtin(BuiltinOp::RootExecute) => compute_root_execute(executor, index, ctx),
        Operation::Builtin(BuiltinOp::GraphInput { name, .. }) => {
            let name = name.clone();
            compute_graph_input(executor, index, ctx, &name)
        }
        Operation::Builtin(BuiltinOp::CallGraph {
            graph,
            outputs,
            recursive,
        }) => {
            let callee_outputs: Vec<Arc<str>> = outputs.iter().map(|(_, node)| node.clone()).collect();
            compute_call(executor, index, ctx, *graph, callee_outputs, *recursive)
        }
        _ => compute_strict(executor, index, ctx),
    }
}

// ==================== Strict ====================

fn compute_strict(executor: &Arc<Executor>, index: u32, ctx: ComputeContext) -> FutureValue<NodeOutputs> {
    let Some(node) = executor.node(index) else {
        return FutureValue::resolved(NodeOutputs::from(Vec::new()));
    };
    let inputs: Vec<_> = node
        .inputs
        .iter()
        .map(|input| executor.evaluate_input(input, ctx.query()))
        .collect();

    let executor = executor.clone();
    let scheduler = ctx.query().scheduler().clone();
    scheduler.join_then(inputs, TaskThread::Worker, move |values| {
        let Some(node) = executor.node(index) else {
            return NodeOutputs::from(Vec::new());
        };
        let result = run_strict(&ctx, &node.operation, values);
        finish(&ctx, node, result)
    })
}

fn buffer<'a>(values: &'a [RuntimeValue], i: usize) -> Result<&'a Buffer, String> {
    values
        .get(i)
        .and_then(RuntimeValue::as_buffer)
        .ok_or_else(|| format!("input {i} is not a buffer"))
}

fn run_strict(ctx: &ComputeContext, op: &Operation, values: &[RuntimeValue]) -> Result<Vec<RuntimeValue>, String> {
    let builtin = match op {
        Operation::Builtin(b) => b,
        Operation::Plugin(plugin) => return plugin.compute(ctx, values),
    };
    let err = |e: crate::buffer::BufferError| e.to_string();

    let out = match builtin {
        BuiltinOp::Arith(arith) => vec![ops::binary(*arith, buffer(values, 0)?, buffer(values, 1)?)
            .map_err(err)?
            .into()],
        BuiltinOp::Abs => vec![ops::abs(buffer(values, 0)?).map_err(err)?.into()],
        BuiltinOp::Length => vec![ops::length(buffer(values, 0)?).map_err(err)?.into()],
        BuiltinOp::MakeVector => vec![ops::make_vector(buffer(values, 0)?, buffer(values, 1)?, buffer(values, 2)?)
            .map_err(err)?
            .into()],
        BuiltinOp::SplitVector => ops::split_vector(buffer(values, 0)?)
            .map_err(err)?
            .into_iter()
            .map(RuntimeValue::from)
            .collect(),
        BuiltinOp::Less => vec![ops::less(buffer(values, 0)?, buffer(values, 1)?).map_err(err)?.into()],
        BuiltinOp::Select => vec![ops::select(buffer(values, 0)?, buffer(values, 1)?, buffer(values, 2)?)
            .map_err(err)?
            .into()],
        BuiltinOp::GetPosition => vec![get_position(ctx)],
        BuiltinOp::GetLod => {
            let lod = match ctx.query().parameter::<LodQuery>() {
                Some(q) => Value::Int(q.lod),
                None => buffer(values, 0)?.constant_value().unwrap_or(Value::Int(0)),
            };
            vec![RuntimeValue::constant(lod)]
        }
        BuiltinOp::Emit => {
            let value = buffer(values, 0)?.clone();
            vec![RuntimeValue::Exec(ExecList::single(ExecTrigger {
                node: ctx.node().clone(),
                value,
            }))]
        }
        BuiltinOp::MergeExec { .. } => {
            let lists: Vec<&ExecList> = values.iter().filter_map(RuntimeValue::as_exec).collect();
            vec![RuntimeValue::Exec(ExecList::concat(lists))]
        }
        BuiltinOp::ParameterRead { guid, default } => {
            let value = ctx
                .query()
                .parameter::<GraphParameterValues>()
                .and_then(|p| p.get(guid))
                .unwrap_or(*default);
            vec![RuntimeValue::constant(value)]
        }
        BuiltinOp::GraphOutput { .. } => values.to_vec(),
        BuiltinOp::Lerp | BuiltinOp::InlineGraph { .. } | BuiltinOp::Execute => {
            return Err("operation should have been removed at compile time".into())
        }
        // Lazy operations are dispatched before reaching here.
        BuiltinOp::RootExecute | BuiltinOp::GraphInput { .. } | BuiltinOp::CallGraph { .. } => {
            return Err("lazy operation evaluated strictly".into())
        }
    };
    Ok(out)
}

/// Missing position data is expected while a chunk is empty, so it stays a
/// warning.
fn get_position(ctx: &ComputeContext) -> RuntimeValue {
    let Some(positions) = ctx.query().parameter::<PositionQuery>() else {
        ctx.warn("GetPosition: query has no positions");
        return RuntimeValue::Empty;
    };
    match positions.positions(ctx.query().environment().max_voxels) {
        Ok(buffer) => buffer.into(),
        Err(e) => {
            ctx.error(format!("GetPosition: {e}"));
            RuntimeValue::Empty
        }
    }
}

// ==================== Lazy ====================

fn compute_select(executor: &Arc<Executor>, index: u32, ctx: ComputeContext) -> FutureValue<NodeOutputs> {
    let Some(node) = executor.node(index) else {
        return FutureValue::resolved(NodeOutputs::from(Vec::new()));
    };
    if node.inputs.len() != 3 {
        ctx.error("Select: expected Condition, True and False inputs");
        return FutureValue::resolved(neutral_outputs(node));
    }
    let condition = executor.evaluate_input(&node.inputs[0], ctx.query());
    let executor = executor.clone();

    condition.and_then(move |condition| {
        let Some(node) = executor.node(index) else {
            return FutureValue::resolved(NodeOutputs::from(Vec::new()));
        };
        let constant = condition.as_buffer().and_then(Buffer::constant_value);
        if let Some(Value::Bool(c)) = constant {
            let branch = if c { &node.inputs[1] } else { &node.inputs[2] };
            let pin_type = node.outputs.first().map(|o| o.pin_type);
            return executor.evaluate_input(branch, ctx.query()).map(move |v| {
                let v = match pin_type {
                    Some(ty) => v.clone().or_neutral(ty),
                    None => v.clone(),
                };
                NodeOutputs::from(vec![v])
            });
        }

        let condition = condition.clone();
        let branches = vec![
            executor.evaluate_input(&node.inputs[1], ctx.query()),
            executor.evaluate_input(&node.inputs[2], ctx.query()),
        ];
        let scheduler = ctx.query().scheduler().clone();
        scheduler.join_then(branches, TaskThread::Worker, move |values| {
            let Some(node) = executor.node(index) else {
                return NodeOutputs::from(Vec::new());
            };
            let all = [condition, values[0].clone(), values[1].clone()];
            let result = run_strict(&ctx, &node.operation, &all);
            finish(&ctx, node, result)
        })
    })
}

fn compute_root_execute(executor: &Arc<Executor>, index: u32, ctx: ComputeContext) -> FutureValue<NodeOutputs> {
    let Some(node) = executor.node(index) else {
        return FutureValue::resolved(NodeOutputs::from(Vec::new()));
    };
    let (Some(exec_in), Some(enable)) = (node.input_index("ExecIn"), node.input_index("EnableNode")) else {
        ctx.error("RootExecute: missing ExecIn or EnableNode");
        return FutureValue::resolved(neutral_outputs(node));
    };
    let enabled = executor.evaluate_input(&node.inputs[enable], ctx.query());
    let executor = executor.clone();

    enabled.and_then(move |enabled| {
        let on = !matches!(
            enabled.as_buffer().and_then(Buffer::constant_value),
            Some(Value::Bool(false))
        );
        let Some(node) = executor.node(index) else {
            return FutureValue::resolved(NodeOutputs::from(Vec::new()));
        };
        if !on {
            return FutureValue::resolved(NodeOutputs::from(vec![RuntimeValue::Exec(ExecList::default())]));
        }
        executor
            .evaluate_input(&node.inputs[exec_in], ctx.query())
            .map(|exec| NodeOutputs::from(vec![exec.clone()]))
    })
}

fn compute_graph_input(
    executor: &Arc<Executor>,
    index: u32,
    ctx: ComputeContext,
    name: &str,
) -> FutureValue<NodeOutputs> {
    let Some(node) = executor.node(index) else {
        return FutureValue::resolved(NodeOutputs::from(Vec::new()));
    };
    let pin_type = node.outputs.first().map(|o| o.pin_type);
    let wrap = move |v: &RuntimeValue| {
        let v = match pin_type {
            Some(ty) => v.clone().or_neutral(ty),
            None => v.clone(),
        };
        NodeOutputs::from(vec![v])
    };

    if let Some(bound) = ctx.query().context().input(name) {
        return bound.map(wrap);
    }
    if let Some(default_pin) = node.inputs.first() {
        return executor.evaluate_input(default_pin, ctx.query()).map(wrap);
    }
    let default = match &node.operation {
        Operation::Builtin(BuiltinOp::GraphInput { default, .. }) => *default,
        _ => None,
    };
    let value = match pin_type {
        Some(ty) => RuntimeValue::from_default(default, ty),
        None => RuntimeValue::Empty,
    };
    FutureValue::resolved(NodeOutputs::from(vec![value]))
}

/// Caller-side inputs of a function call.
struct CallInputs {
    executor: Arc<Executor>,
    node: u32,
    query: Query,
}

impl ContextInputs for CallInputs {
    fn input(&self, name: &str) -> Option<FutureValue<RuntimeValue>> {
        let node = self.executor.node(self.node)?;
        let input = &node.inputs[node.input_index(name)?];
        Some(self.executor.evaluate_input(input, &self.query))
    }
}

fn compute_call(
    executor: &Arc<Executor>,
    index: u32,
    ctx: ComputeContext,
    graph: GraphId,
    callee_outputs: Vec<Arc<str>>,
    recursive: bool,
) -> FutureValue<NodeOutputs> {
    let Some(node) = executor.node(index) else {
        return FutureValue::resolved(NodeOutputs::from(Vec::new()));
    };
    let query = ctx.query();

    if !recursive && (executor.target().graph == graph || query.context().is_evaluating(graph)) {
        ctx.error(format!("Graph {graph} calls itself; use a recursive macro"));
        return FutureValue::resolved(neutral_outputs(node));
    }
    let Some(source) = query.environment().executors() else {
        ctx.error("No executor source bound to evaluate function calls");
        return FutureValue::resolved(neutral_outputs(node));
    };

    let inputs = Arc::new(CallInputs {
        executor: executor.clone(),
        node: index,
        query: query.clone(),
    });
    let callee_query = match query.enter_context(node.key.clone(), graph, inputs) {
        Ok(q) => q,
        Err(e) => {
            ctx.error(e.to_string());
            return FutureValue::resolved(neutral_outputs(node));
        }
    };

    let futures: Vec<_> = callee_outputs
        .into_iter()
        .map(|output| source.evaluate(&GraphPinRef::output(graph, output), &callee_query))
        .collect();
    let types: Vec<_> = node.outputs.iter().map(|o| o.pin_type).collect();
    FutureValue::join_all(futures).map(move |values| {
        values
            .iter()
            .zip(&types)
            .map(|(v, ty)| v.clone().or_neutral(*ty))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ops::ArithOp;
    use crate::buffer::value::ValueKind;
    use crate::diagnostics::DiagnosticsHub;
    use crate::graph::id::IrNodeId;
    use crate::graph::ir::{IrGraph, IrNodeKind, PinSpec};
    use crate::graph::types::PinType;
    use crate::math::Vec3;
    use crate::query::dependency::DependencyTracker;
    use crate::query::parameters::QueryParameters;
    use crate::query::query::EvalEnvironment;
    use crate::query::task::TaskScheduler;
    use crate::runtime::executor::CompileStats;

    const F: PinType = PinType::Buffer(ValueKind::Float);

    fn query(params: QueryParameters) -> Query {
        let scheduler = TaskScheduler::new(2).unwrap();
        let env = Arc::new(EvalEnvironment::new(scheduler, Arc::new(DiagnosticsHub::new())));
        Query::new(env, params, DependencyTracker::new("test"))
    }

    fn root(g: &mut IrGraph, source: crate::graph::id::IrPinId, ty: PinType) -> IrNodeId {
        let root = g.add_node(NodeKey::new(GraphId(1), "Root"), IrNodeKind::Root);
        let value = g.add_input(root, PinSpec::new("Value", ty)).unwrap();
        g.make_link(source, value).unwrap();
        root
    }

    fn build(g: &IrGraph, root: IrNodeId, order: Vec<IrNodeId>) -> Arc<Executor> {
        Arc::new(
            Executor::build(1, GraphPinRef::new(GraphId(1), "x", "y"), g, root, &order, CompileStats::default())
                .unwrap(),
        )
    }

    fn float(v: &RuntimeValue) -> f32 {
        match v.as_buffer().and_then(Buffer::constant_value) {
            Some(Value::Float(f)) => f,
            other => panic!("not a constant float: {other:?}"),
        }
    }

    #[test]
    fn test_strict_arith_runs() {
        let mut g = IrGraph::new(GraphId(1));
        let mul = g.add_node(
            NodeKey::new(GraphId(1), "Mul"),
            IrNodeKind::Struct(BuiltinOp::Arith(ArithOp::Multiply).into()),
        );
        g.add_input(mul, PinSpec::new("A", F).with_default(Some(Value::Float(4.0)))).unwrap();
        g.add_input(mul, PinSpec::new("B", F).with_default(Some(Value::Float(2.5)))).unwrap();
        let out = g.add_output(mul, PinSpec::new("Result", F)).unwrap();
        let r = root(&mut g, out, F);
        let exec = build(&g, r, vec![mul, r]);

        let q = query(QueryParameters::new());
        let value = q.scheduler().run_synchronously(|| exec.execute(&q)).unwrap();
        assert_eq!(float(value.get().unwrap()), 10.0);
    }

    #[test]
    fn test_select_with_constant_condition_skips_other_branch() {
        let mut g = IrGraph::new(GraphId(1));
        let pos = g.add_node(
            NodeKey::new(GraphId(1), "Pos"),
            IrNodeKind::Struct(BuiltinOp::GetPosition.into()),
        );
        let pos_out = g
            .add_output(pos, PinSpec::new("Position", PinType::Buffer(ValueKind::Vector)))
            .unwrap();
        let len = g.add_node(NodeKey::new(GraphId(1), "Len"), IrNodeKind::Struct(BuiltinOp::Length.into()));
        let len_in = g
            .add_input(len, PinSpec::new("Vector", PinType::Buffer(ValueKind::Vector)))
            .unwrap();
        let len_out = g.add_output(len, PinSpec::new("Length", F)).unwrap();
        g.make_link(pos_out, len_in).unwrap();

        let select = g.add_node(NodeKey::new(GraphId(1), "Select"), IrNodeKind::Struct(BuiltinOp::Select.into()));
        g.add_input(
            select,
            PinSpec::new("Condition", PinType::Scalar(ValueKind::Bool)).with_default(Some(Value::Bool(false))),
        )
        .unwrap();
        let t = g.add_input(select, PinSpec::new("True", F)).unwrap();
        g.add_input(select, PinSpec::new("False", F).with_default(Some(Value::Float(7.0))))
            .unwrap();
        let out = g.add_output(select, PinSpec::new("Result", F)).unwrap();
        g.make_link(len_out, t).unwrap();
        let r = root(&mut g, out, F);
        let exec = build(&g, r, vec![pos, len, select, r]);

        // No position query: evaluating the True branch would warn.
        let q = query(QueryParameters::new());
        let value = q.scheduler().run_synchronously(|| exec.execute(&q)).unwrap();
        assert_eq!(float(value.get().unwrap()), 7.0);
        assert!(q.diagnostics().recent().is_empty());
    }

    #[test]
    fn test_get_position_reads_query() {
        let mut g = IrGraph::new(GraphId(1));
        let pos = g.add_node(
            NodeKey::new(GraphId(1), "Pos"),
            IrNodeKind::Struct(BuiltinOp::GetPosition.into()),
        );
        let out = g
            .add_output(pos, PinSpec::new("Position", PinType::Buffer(ValueKind::Vector)))
            .unwrap();
        let r = root(&mut g, out, PinType::Buffer(ValueKind::Vector));
        let exec = build(&g, r, vec![pos, r]);

        let q = query(QueryParameters::new().with(PositionQuery::sparse(vec![Vec3::ONE, Vec3::ZERO])));
        let value = q.scheduler().run_synchronously(|| exec.execute(&q)).unwrap();
        assert_eq!(value.get().and_then(RuntimeValue::as_buffer).map(Buffer::len), Some(2));
    }

    #[test]
    fn test_missing_positions_warn_once() {
        let mut g = IrGraph::new(GraphId(1));
        let pos = g.add_node(
            NodeKey::new(GraphId(1), "Pos"),
            IrNodeKind::Struct(BuiltinOp::GetPosition.into()),
        );
        let out = g
            .add_output(pos, PinSpec::new("Position", PinType::Buffer(ValueKind::Vector)))
            .unwrap();
        let r = root(&mut g, out, PinType::Buffer(ValueKind::Vector));
        let exec = build(&g, r, vec![pos, r]);

        let q = query(QueryParameters::new());
        for _ in 0..3 {
            let fresh = q.make_new_query(QueryParameters::new());
            let value = q.scheduler().run_synchronously(|| exec.execute(&fresh)).unwrap();
            assert_eq!(value.get().and_then(RuntimeValue::as_buffer).map(Buffer::len), Some(0));
        }
        assert_eq!(q.diagnostics().recent().len(), 1);
        assert_eq!(q.diagnostics().recent()[0].severity, Severity::Warning);
    }
}
