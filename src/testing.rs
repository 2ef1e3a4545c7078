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

//! Runtime checks for contracts a handler author asserts but the bridge
//! cannot prove: the batching equivalence law, deterministic layout
//! inference, and numeric agreement with a reference.

use crate::attrs::Attributes;
use crate::batching::{self, BatchPolicy, Batched, Invoke};
use crate::buffer::HostArray;
use crate::error::{invalid, Result, XcallError};
use crate::partition::{Layout, Mesh, PartitionHook};
use crate::types::{DType, ShapeDType};

/// Run `invoke` under `policy` and under sequential batching and require
/// identical results.
pub fn check_batching_law(
    policy: BatchPolicy,
    args: &[Batched<'_>],
    result_specs: &[ShapeDType],
    invoke: &Invoke<'_>,
) -> Result<()> {
    let expected = batching::apply(BatchPolicy::Sequential, args, result_specs, invoke)?;
    let actual = batching::apply(policy, args, result_specs, invoke)?;
    if expected.len() != actual.len() {
        return Err(XcallError::Internal(format!(
            "batching law violated under {policy}: {} results, sequential gave {}",
            actual.len(),
            expected.len()
        )));
    }
    for (i, (want, got)) in expected.iter().zip(&actual).enumerate() {
        if want != got {
            return Err(XcallError::Internal(format!(
                "batching law violated under {policy}: result {i} differs from sequential"
            )));
        }
    }
    Ok(())
}

/// Call `infer_result_layout` `trials` times and require the same answer.
pub fn check_layout_determinism(
    hook: &dyn PartitionHook,
    attrs: &Attributes,
    mesh: &Mesh,
    arg_layouts: &[Layout],
    trials: usize,
) -> Result<Vec<Layout>> {
    let first = hook.infer_result_layout(attrs, mesh, arg_layouts)?;
    for trial in 1..trials {
        let again = hook.infer_result_layout(attrs, mesh, arg_layouts)?;
        if again != first {
            return Err(XcallError::Internal(format!(
                "layout inference is not deterministic: trial {trial} gave {again:?}, first gave {first:?}"
            )));
        }
    }
    Ok(first)
}

/// Element-wise `|a - b| <= rel_tol * max(|a|, |b|, 1)` for f32/f64 arrays.
pub fn check_close(actual: &HostArray, expected: &HostArray, rel_tol: f64) -> Result<()> {
    if actual.dtype() != expected.dtype() || actual.dims() != expected.dims() {
        return Err(invalid(format!(
            "cannot compare {}{:?} with {}{:?}",
            actual.dtype(),
            actual.dims(),
            expected.dtype(),
            expected.dims()
        )));
    }
    let (a, b): (Vec<f64>, Vec<f64>) = match actual.dtype() {
        DType::F32 => (
            actual.as_slice::<f32>()?.iter().map(|&v| v as f64).collect(),
            expected.as_slice::<f32>()?.iter().map(|&v| v as f64).collect(),
        ),
        DType::F64 => (actual.to_vec::<f64>()?, expected.to_vec::<f64>()?),
        other => {
            return Err(XcallError::NotImplemented(format!(
                "tolerance comparison of {other} arrays"
            )))
        }
    };
    for (i, (x, y)) in a.iter().zip(&b).enumerate() {
        let scale = x.abs().max(y.abs()).max(1.0);
        if (x - y).abs() > rel_tol * scale {
            return Err(invalid(format!(
                "element {i}: {x} vs {y} exceeds relative tolerance {rel_tol}"
            )));
        }
    }
    Ok(())
}
