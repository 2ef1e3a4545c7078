// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Execution plans for partitioned calls.
//!
//! A plan is the ordered list of collective steps around one local call:
//! re-layout of every argument into the layout the hook asked for, the
//! local call itself, all-reduces for results the hook left partial, and an
//! optional re-layout of results into the layouts the caller wants.

use std::fmt;

use crate::attrs::Attributes;
use crate::error::{invalid, Result};
use crate::partition::hook::{LocalCall, PartitionHook, Replicated};
use crate::partition::{Layout, Mesh};
use crate::types::ShapeDType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Arg(usize),
    Result(usize),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Arg(i) => write!(f, "arg{i}"),
            Operand::Result(i) => write!(f, "result{i}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    /// Gather `dim` of `operand`, which is split along `axis`.
    AllGather {
        operand: Operand,
        dim: usize,
        axis: String,
    },
    /// Keep only this device's slice of `dim` along `axis`. No
    /// communication.
    Slice {
        operand: Operand,
        dim: usize,
        axis: String,
    },
    LocalCall,
    /// Sum partial results across `axes`.
    AllReduce { result: usize, axes: Vec<String> },
}

impl PlanStep {
    pub fn is_communication(&self) -> bool {
        matches!(self, PlanStep::AllGather { .. } | PlanStep::AllReduce { .. })
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStep::AllGather { operand, dim, axis } => {
                write!(f, "all-gather {operand} dim {dim} over '{axis}'")
            }
            PlanStep::Slice { operand, dim, axis } => {
                write!(f, "slice {operand} dim {dim} along '{axis}'")
            }
            PlanStep::LocalCall => f.write_str("local call"),
            PlanStep::AllReduce { result, axes } => {
                write!(f, "all-reduce result{result} over {}", axes.join(", "))
            }
        }
    }
}

#[derive(Clone)]
pub struct ExecutionPlan {
    pub mesh: Mesh,
    pub steps: Vec<PlanStep>,
    pub arg_specs: Vec<ShapeDType>,
    pub result_specs: Vec<ShapeDType>,
    /// Layouts the caller supplied.
    pub arg_layouts: Vec<Layout>,
    /// Layouts the local call sees.
    pub call_arg_layouts: Vec<Layout>,
    /// Layouts the local call produces, partial axes included.
    pub call_result_layouts: Vec<Layout>,
    /// Layouts of the results once the plan has run.
    pub result_layouts: Vec<Layout>,
    pub local_call: LocalCall,
}

impl ExecutionPlan {
    pub fn has_communication(&self) -> bool {
        self.steps.iter().any(PlanStep::is_communication)
    }

    pub fn communication(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.is_communication())
    }
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("mesh", &self.mesh)
            .field("steps", &self.steps)
            .field("call_arg_layouts", &self.call_arg_layouts)
            .field("call_result_layouts", &self.call_result_layouts)
            .field("result_layouts", &self.result_layouts)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mesh {}", self.mesh)?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {i}: {step}")?;
        }
        Ok(())
    }
}

/// Build the execution plan for one call.
///
/// With no hook every argument is gathered to full replication before the
/// call and results are produced replicated.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(level = "debug", skip_all, fields(mesh = %mesh))]
pub fn plan_call(
    hook: Option<&dyn PartitionHook>,
    attrs: &Attributes,
    mesh: &Mesh,
    arg_specs: &[ShapeDType],
    arg_layouts: &[Layout],
    result_specs: &[ShapeDType],
    out_layouts: Option<&[Layout]>,
    local: LocalCall,
) -> Result<ExecutionPlan> {
    let hook = hook.unwrap_or(&Replicated);
    if arg_layouts.len() != arg_specs.len() {
        return Err(invalid(format!(
            "{} argument layouts for {} arguments",
            arg_layouts.len(),
            arg_specs.len()
        )));
    }
    let arg_dims = concrete(arg_specs)?;
    let result_dims = concrete(result_specs)?;
    for (layout, dims) in arg_layouts.iter().zip(&arg_dims) {
        if !layout.partial().is_empty() {
            return Err(invalid(format!("argument layout {layout} is partial")));
        }
        layout.validate(mesh, dims)?;
    }
    hook.check(arg_specs, result_specs)?;

    let mut inferred = hook.infer_result_layout(attrs, mesh, arg_layouts)?;
    if inferred.is_empty() && !result_specs.is_empty() {
        inferred = result_specs
            .iter()
            .map(|s| Layout::replicated(s.rank()))
            .collect();
    }
    check_count("inferred result", &inferred, result_specs.len())?;

    let partitioned = hook.partition(attrs, mesh, arg_layouts, &inferred, local)?;
    if &partitioned.mesh != mesh {
        return Err(invalid(format!(
            "hook changed the mesh from {mesh} to {}",
            partitioned.mesh
        )));
    }
    check_count("partitioned argument", &partitioned.arg_layouts, arg_specs.len())?;
    check_count("partitioned result", &partitioned.result_layouts, result_specs.len())?;
    for (layout, dims) in partitioned.arg_layouts.iter().zip(&arg_dims) {
        if !layout.partial().is_empty() {
            return Err(invalid(format!("local argument layout {layout} is partial")));
        }
        layout.validate(mesh, dims)?;
    }
    for (layout, dims) in partitioned.result_layouts.iter().zip(&result_dims) {
        layout.validate(mesh, dims)?;
    }

    let mut steps = Vec::new();
    for (i, (from, to)) in arg_layouts.iter().zip(&partitioned.arg_layouts).enumerate() {
        relayout(Operand::Arg(i), from, to, &mut steps);
    }
    steps.push(PlanStep::LocalCall);
    for (i, layout) in partitioned.result_layouts.iter().enumerate() {
        if !layout.partial().is_empty() {
            steps.push(PlanStep::AllReduce {
                result: i,
                axes: layout.partial().to_vec(),
            });
        }
    }

    let produced: Vec<Layout> = partitioned
        .result_layouts
        .iter()
        .map(Layout::without_partial)
        .collect();
    let result_layouts = match out_layouts {
        None => produced,
        Some(wanted) => {
            check_count("requested result", wanted, result_specs.len())?;
            for (i, ((from, to), dims)) in produced.iter().zip(wanted).zip(&result_dims).enumerate()
            {
                if !to.partial().is_empty() {
                    return Err(invalid(format!("requested result layout {to} is partial")));
                }
                to.validate(mesh, dims)?;
                relayout(Operand::Result(i), from, to, &mut steps);
            }
            wanted.to_vec()
        }
    };

    let plan = ExecutionPlan {
        mesh: mesh.clone(),
        steps,
        arg_specs: arg_specs.to_vec(),
        result_specs: result_specs.to_vec(),
        arg_layouts: arg_layouts.to_vec(),
        call_arg_layouts: partitioned.arg_layouts,
        call_result_layouts: partitioned.result_layouts,
        result_layouts,
        local_call: partitioned.local_call,
    };
    tracing::debug!(
        steps = plan.steps.len(),
        communication = plan.has_communication(),
        "partition plan built"
    );
    Ok(plan)
}

/// Gather every dimension whose axis changes, then slice the new ones.
fn relayout(operand: Operand, from: &Layout, to: &Layout, steps: &mut Vec<PlanStep>) {
    for dim in 0..from.rank() {
        if let Some(axis) = from.axis(dim) {
            if to.axis(dim) != Some(axis) {
                steps.push(PlanStep::AllGather {
                    operand,
                    dim,
                    axis: axis.to_string(),
                });
            }
        }
    }
    for dim in 0..to.rank() {
        if let Some(axis) = to.axis(dim) {
            if from.axis(dim) != Some(axis) {
                steps.push(PlanStep::Slice {
                    operand,
                    dim,
                    axis: axis.to_string(),
                });
            }
        }
    }
}

fn concrete(specs: &[ShapeDType]) -> Result<Vec<Vec<usize>>> {
    specs.iter().map(ShapeDType::concrete_dims).collect()
}

fn check_count(what: &str, layouts: &[Layout], expected: usize) -> Result<()> {
    if layouts.len() != expected {
        return Err(invalid(format!(
            "{} {what} layouts, expected {expected}",
            layouts.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;
    use crate::partition::local_call;

    fn identity() -> LocalCall {
        local_call(|args, _| Ok(args.iter().map(|a| (*a).clone()).collect()))
    }

    #[test]
    fn default_hook_gathers_sharded_arguments() {
        let mesh = Mesh::new(&[("x", 2)]).unwrap();
        let spec = ShapeDType::new(DType::F32, &[4, 2]);
        let plan = plan_call(
            None,
            &Attributes::new(),
            &mesh,
            &[spec.clone()],
            &[Layout::sharded(&[Some("x"), None])],
            &[spec],
            None,
            identity(),
        )
        .unwrap();
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::AllGather {
                    operand: Operand::Arg(0),
                    dim: 0,
                    axis: "x".into()
                },
                PlanStep::LocalCall
            ]
        );
        assert!(plan.result_layouts[0].is_replicated());
    }

    #[test]
    fn replicated_inputs_need_nothing() {
        let mesh = Mesh::new(&[("x", 2)]).unwrap();
        let spec = ShapeDType::new(DType::F32, &[3]);
        let plan = plan_call(
            None,
            &Attributes::new(),
            &mesh,
            &[spec.clone()],
            &[Layout::replicated(1)],
            &[spec],
            Some(&[Layout::sharded(&[None])]),
            identity(),
        )
        .unwrap();
        assert!(!plan.has_communication());
        assert_eq!(plan.steps, vec![PlanStep::LocalCall]);
    }

    #[test]
    fn indivisible_layout_is_rejected() {
        let mesh = Mesh::new(&[("x", 2)]).unwrap();
        let spec = ShapeDType::new(DType::F32, &[3]);
        let err = plan_call(
            None,
            &Attributes::new(),
            &mesh,
            &[spec.clone()],
            &[Layout::sharded(&[Some("x")])],
            &[spec],
            None,
            identity(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not divisible"));
    }
}
