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

//! Batch policies for foreign calls under vectorization.
//!
//! Each argument carries a batch rank: the number of its leading dimensions
//! that are batch dimensions. Batch prefixes are broadcast against each
//! other with trailing alignment (NumPy rules), so an argument with fewer
//! batch dimensions lines up with the innermost batch dimensions of the
//! others and an unbatched argument is shared across the whole batch.
//! Incompatible prefixes fail with `InvalidArgument` before any handler
//! runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::buffer::HostArray;
use crate::error::{invalid, Result};
use crate::types::{element_count, ShapeDType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// One unbatched invocation per batch element, results stacked.
    #[default]
    Sequential,
    /// One invocation; every argument carries the full batch rank, with
    /// size-1 batch dimensions where it is not batched.
    ExpandDims,
    /// One invocation; every argument is broadcast to the common batch
    /// shape.
    BroadcastAll,
    /// Older name for [`BatchPolicy::ExpandDims`].
    LegacyVectorized,
}

impl BatchPolicy {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(BatchPolicy::Sequential),
            "expand_dims" => Ok(BatchPolicy::ExpandDims),
            "broadcast_all" => Ok(BatchPolicy::BroadcastAll),
            "legacy_vectorized" | "vectorized" => Ok(BatchPolicy::LegacyVectorized),
            other => Err(invalid(format!("unknown batch policy '{other}'"))),
        }
    }

    /// The policy actually applied.
    pub fn effective(self) -> Self {
        match self {
            BatchPolicy::LegacyVectorized => BatchPolicy::ExpandDims,
            other => other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BatchPolicy::Sequential => "sequential",
            BatchPolicy::ExpandDims => "expand_dims",
            BatchPolicy::BroadcastAll => "broadcast_all",
            BatchPolicy::LegacyVectorized => "legacy_vectorized",
        }
    }
}

impl fmt::Display for BatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An argument together with its number of leading batch dimensions.
#[derive(Debug, Clone, Copy)]
pub struct Batched<'a> {
    pub array: &'a HostArray,
    pub batch_rank: usize,
}

impl<'a> Batched<'a> {
    pub fn new(array: &'a HostArray, batch_rank: usize) -> Self {
        Self { array, batch_rank }
    }

    pub fn unbatched(array: &'a HostArray) -> Self {
        Self::new(array, 0)
    }

    pub fn batch_dims(&self) -> Result<&'a [usize]> {
        let dims = self.array.dims();
        if self.batch_rank > dims.len() {
            return Err(invalid(format!(
                "batch rank {} exceeds array rank {}",
                self.batch_rank,
                dims.len()
            )));
        }
        Ok(&dims[..self.batch_rank])
    }

    pub fn core_dims(&self) -> &'a [usize] {
        let dims = self.array.dims();
        &dims[self.batch_rank.min(dims.len())..]
    }
}

/// Broadcast two shapes with trailing alignment.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    let max_rank = lhs.len().max(rhs.len());
    let mut result = Vec::with_capacity(max_rank);
    for i in 0..max_rank {
        let a = lhs.len().checked_sub(i + 1).map_or(1, |k| lhs[k]);
        let b = rhs.len().checked_sub(i + 1).map_or(1, |k| rhs[k]);
        let dim = if a == b || a == 1 {
            b
        } else if b == 1 {
            a
        } else {
            return Err(invalid(format!(
                "batch shapes {lhs:?} and {rhs:?} cannot be broadcast together"
            )));
        };
        result.push(dim);
    }
    result.reverse();
    Ok(result)
}

/// Common batch shape of all arguments.
pub fn common_batch_shape(args: &[Batched<'_>]) -> Result<Vec<usize>> {
    args.iter().try_fold(Vec::new(), |acc, arg| {
        broadcast_shapes(&acc, arg.batch_dims()?)
    })
}

/// Signature of an unbatched invocation: inputs and declared results.
pub type Invoke<'f> = dyn Fn(&[&HostArray], &[ShapeDType]) -> Result<Vec<HostArray>> + 'f;

/// Run `invoke` over batched arguments according to `policy`.
///
/// `result_specs` are the unbatched result declarations; every output gains
/// the common batch shape as a prefix.
pub fn apply(
    policy: BatchPolicy,
    args: &[Batched<'_>],
    result_specs: &[ShapeDType],
    invoke: &Invoke<'_>,
) -> Result<Vec<HostArray>> {
    let batch_shape = common_batch_shape(args)?;
    if args.iter().all(|a| a.batch_rank == 0) {
        let inputs: Vec<&HostArray> = args.iter().map(|a| a.array).collect();
        return invoke(&inputs, result_specs);
    }
    if policy == BatchPolicy::LegacyVectorized {
        tracing::warn!("batch policy 'legacy_vectorized' is deprecated; use 'expand_dims'");
    }
    tracing::debug!(policy = %policy, ?batch_shape, "batching foreign call");
    let batched_specs: Vec<ShapeDType> = result_specs
        .iter()
        .map(|s| s.with_leading(&batch_shape))
        .collect();
    match policy.effective() {
        BatchPolicy::Sequential => sequential(args, &batch_shape, result_specs, invoke),
        BatchPolicy::ExpandDims => {
            let expanded = args
                .iter()
                .map(|a| expand_dims(a, batch_shape.len()))
                .collect::<Result<Vec<_>>>()?;
            let inputs: Vec<&HostArray> = expanded.iter().collect();
            invoke(&inputs, &batched_specs)
        }
        BatchPolicy::BroadcastAll | BatchPolicy::LegacyVectorized => {
            let broadcast = args
                .iter()
                .map(|a| {
                    let mut target = batch_shape.clone();
                    target.extend_from_slice(a.core_dims());
                    a.array.broadcast_to(&target)
                })
                .collect::<Result<Vec<_>>>()?;
            let inputs: Vec<&HostArray> = broadcast.iter().collect();
            invoke(&inputs, &batched_specs)
        }
    }
}

fn expand_dims(arg: &Batched<'_>, batch_rank: usize) -> Result<HostArray> {
    let pad = batch_rank - arg.batch_rank;
    let mut dims = vec![1usize; pad];
    dims.extend_from_slice(arg.array.dims());
    arg.array.clone().reshape(&dims)
}

fn sequential(
    args: &[Batched<'_>],
    batch_shape: &[usize],
    result_specs: &[ShapeDType],
    invoke: &Invoke<'_>,
) -> Result<Vec<HostArray>> {
    // Each batched argument flattened to [prod(batch), core...].
    let flat = args
        .iter()
        .map(|a| {
            if a.batch_rank == 0 {
                return Ok(None);
            }
            let mut dims = vec![element_count(a.batch_dims()?)];
            dims.extend_from_slice(a.core_dims());
            Ok(Some(a.array.clone().reshape(&dims)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let count = element_count(batch_shape);
    let mut outputs: Vec<Vec<HostArray>> = vec![Vec::with_capacity(count); result_specs.len()];
    let mut index = vec![0usize; batch_shape.len()];
    for linear in 0..count {
        unravel(linear, batch_shape, &mut index);
        let slices = args
            .iter()
            .zip(&flat)
            .map(|(arg, flat)| match flat {
                Some(flat) => flat.index_leading(arg_offset(arg.batch_dims()?, &index)).map(Some),
                None => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;
        let inputs: Vec<&HostArray> = args
            .iter()
            .zip(&slices)
            .map(|(arg, slice)| slice.as_ref().unwrap_or(arg.array))
            .collect();
        let results = invoke(&inputs, result_specs)?;
        if results.len() != result_specs.len() {
            return Err(invalid(format!(
                "call returned {} results, {} declared",
                results.len(),
                result_specs.len()
            )));
        }
        for (out, r) in outputs.iter_mut().zip(results) {
            out.push(r);
        }
    }

    result_specs
        .iter()
        .zip(outputs)
        .map(|(spec, parts)| {
            let item = spec.concrete_dims()?;
            let stacked = HostArray::stack(spec.dtype, &item, &parts)?;
            let mut dims = batch_shape.to_vec();
            dims.extend_from_slice(&item);
            stacked.reshape(&dims)
        })
        .collect()
}

/// Linear index into an argument's own batch prefix for a position in the
/// common batch shape, honouring trailing alignment and size-1 broadcast.
fn arg_offset(prefix: &[usize], index: &[usize]) -> usize {
    let skip = index.len() - prefix.len();
    prefix
        .iter()
        .zip(&index[skip..])
        .fold(0, |acc, (&d, &i)| acc * d + if d == 1 { 0 } else { i })
}

fn unravel(mut linear: usize, dims: &[usize], index: &mut [usize]) {
    for axis in (0..dims.len()).rev() {
        index[axis] = linear % dims[axis];
        linear /= dims[axis];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XcallError;
    use crate::types::DType;
    use std::cell::Cell;

    fn sum_last(inputs: &[&HostArray], specs: &[ShapeDType]) -> Result<Vec<HostArray>> {
        // Sums the last axis of input 0 and adds scalar-broadcast input 1.
        let x = inputs[0].to_vec::<f32>()?;
        let y = inputs[1].to_vec::<f32>()?;
        let dims = specs[0].concrete_dims()?;
        let rows = element_count(&dims);
        let width = x.len() / rows.max(1);
        let out: Vec<f32> = (0..rows)
            .map(|r| x[r * width..(r + 1) * width].iter().sum::<f32>() + y[r % y.len()])
            .collect();
        Ok(vec![HostArray::from_slice(&dims, &out)?])
    }

    #[test]
    fn broadcast_shapes_follow_trailing_alignment() {
        assert_eq!(broadcast_shapes(&[3, 1], &[4]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_shapes(&[], &[2]).unwrap(), vec![2]);
        assert!(broadcast_shapes(&[3], &[4]).is_err());
    }

    #[test]
    fn sequential_stacks_per_element_results() {
        let x = HostArray::from_slice(&[2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let y = HostArray::scalar(10.0f32).reshape(&[1]).unwrap();
        let specs = [ShapeDType::scalar(DType::F32)];
        let calls = Cell::new(0);
        let invoke = |i: &[&HostArray], s: &[ShapeDType]| {
            calls.set(calls.get() + 1);
            sum_last(i, s)
        };
        let out = apply(
            BatchPolicy::Sequential,
            &[Batched::new(&x, 1), Batched::unbatched(&y)],
            &specs,
            &invoke,
        )
        .unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(out[0].dims(), &[2]);
        assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![16.0, 25.0]);
    }

    #[test]
    fn sequential_over_empty_batch_invokes_nothing() {
        let x = HostArray::zeros(DType::F32, &[0, 3]).unwrap();
        let y = HostArray::from_slice(&[1], &[1.0f32]).unwrap();
        let invoke = |_: &[&HostArray], _: &[ShapeDType]| -> Result<Vec<HostArray>> {
            panic!("must not be invoked")
        };
        let out = apply(
            BatchPolicy::Sequential,
            &[Batched::new(&x, 1), Batched::unbatched(&y)],
            &[ShapeDType::new(DType::F32, &[2])],
            &invoke,
        )
        .unwrap();
        assert_eq!(out[0].dims(), &[0, 2]);
    }

    #[test]
    fn expand_dims_pads_unbatched_arguments() {
        let x = HostArray::zeros(DType::F32, &[4, 3]).unwrap();
        let y = HostArray::zeros(DType::F32, &[3]).unwrap();
        let seen = std::cell::RefCell::new(Vec::new());
        let invoke = |i: &[&HostArray], s: &[ShapeDType]| {
            seen.borrow_mut()
                .extend(i.iter().map(|a| a.dims().to_vec()));
            Ok(vec![HostArray::zeros(s[0].dtype, &s[0].concrete_dims()?)?])
        };
        let out = apply(
            BatchPolicy::LegacyVectorized,
            &[Batched::new(&x, 1), Batched::unbatched(&y)],
            &[ShapeDType::new(DType::F32, &[3])],
            &invoke,
        )
        .unwrap();
        assert_eq!(*seen.borrow(), vec![vec![4, 3], vec![1, 3]]);
        assert_eq!(out[0].dims(), &[4, 3]);
    }

    #[test]
    fn mismatched_batches_fail_before_invocation() {
        let a = HostArray::zeros(DType::F32, &[2, 3]).unwrap();
        let b = HostArray::zeros(DType::F32, &[3, 3]).unwrap();
        let invoke = |_: &[&HostArray], _: &[ShapeDType]| -> Result<Vec<HostArray>> {
            panic!("must not be invoked")
        };
        for policy in [
            BatchPolicy::Sequential,
            BatchPolicy::ExpandDims,
            BatchPolicy::BroadcastAll,
        ] {
            let err = apply(
                policy,
                &[Batched::new(&a, 1), Batched::new(&b, 1)],
                &[],
                &invoke,
            )
            .unwrap_err();
            assert!(matches!(err, XcallError::InvalidArgument(_)));
        }
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!(BatchPolicy::parse("broadcast_all").unwrap(), BatchPolicy::BroadcastAll);
        assert_eq!(BatchPolicy::LegacyVectorized.effective(), BatchPolicy::ExpandDims);
        assert!(BatchPolicy::parse("parallel").is_err());
    }
}
