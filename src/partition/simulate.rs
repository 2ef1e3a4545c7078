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

//! Single-process execution of a plan: every device of the mesh is run in
//! turn on its own blocks, and collectives are performed on host arrays.

use std::collections::BTreeMap;

use crate::buffer::HostArray;
use crate::error::{invalid, Result, XcallError};
use crate::partition::{ExecutionPlan, Layout, Mesh};
use crate::types::{DType, ShapeDType};

/// Run `plan` on global `inputs` and return the global results.
pub fn execute(plan: &ExecutionPlan, inputs: &[HostArray]) -> Result<Vec<HostArray>> {
    if inputs.len() != plan.arg_specs.len() {
        return Err(invalid(format!(
            "plan takes {} arguments, got {}",
            plan.arg_specs.len(),
            inputs.len()
        )));
    }
    for (i, (input, spec)) in inputs.iter().zip(&plan.arg_specs).enumerate() {
        if input.dtype() != spec.dtype || input.dims() != spec.concrete_dims()?.as_slice() {
            return Err(invalid(format!(
                "argument {i} is {}{:?}, plan expects {spec}",
                input.dtype(),
                input.dims()
            )));
        }
    }

    let mesh = &plan.mesh;
    let result_dims: Vec<Vec<usize>> = plan
        .result_specs
        .iter()
        .map(ShapeDType::concrete_dims)
        .collect::<Result<_>>()?;
    let local_specs: Vec<ShapeDType> = plan
        .result_specs
        .iter()
        .zip(&plan.call_result_layouts)
        .zip(&result_dims)
        .map(|((spec, layout), dims)| {
            Ok(ShapeDType::from_dims(spec.dtype, &layout.local_dims(mesh, dims)?))
        })
        .collect::<Result<_>>()?;

    let mut per_device = Vec::with_capacity(mesh.num_devices());
    for device in 0..mesh.num_devices() {
        let blocks = inputs
            .iter()
            .zip(&plan.call_arg_layouts)
            .map(|(input, layout)| local_block(mesh, layout, device, input))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&HostArray> = blocks.iter().collect();
        let outputs = (plan.local_call)(&refs, &local_specs)?;
        if outputs.len() != local_specs.len() {
            return Err(XcallError::Internal(format!(
                "local call on device {device} returned {} results, expected {}",
                outputs.len(),
                local_specs.len()
            )));
        }
        for (out, spec) in outputs.iter().zip(&local_specs) {
            if out.dtype() != spec.dtype || out.dims() != spec.concrete_dims()?.as_slice() {
                return Err(XcallError::Internal(format!(
                    "local call on device {device} returned {}{:?}, expected {spec}",
                    out.dtype(),
                    out.dims()
                )));
            }
        }
        per_device.push(outputs);
    }

    let mut results = Vec::with_capacity(result_dims.len());
    for (r, (layout, dims)) in plan.call_result_layouts.iter().zip(&result_dims).enumerate() {
        let dtype = plan.result_specs[r].dtype;
        let mut global = HostArray::zeros(dtype, dims)?;
        let reduced = all_reduce(mesh, layout, per_device.iter().map(|outs| &outs[r]))?;
        for (device, block) in reduced.iter().enumerate() {
            let offsets = layout.block_offsets(mesh, device, dims)?;
            global.write_block(&offsets, block)?;
        }
        results.push(global);
    }
    tracing::debug!(devices = mesh.num_devices(), "partitioned call simulated");
    Ok(results)
}

fn local_block(
    mesh: &Mesh,
    layout: &Layout,
    device: usize,
    global: &HostArray,
) -> Result<HostArray> {
    if layout.dims().iter().all(Option::is_none) {
        return Ok(global.clone());
    }
    let offsets = layout.block_offsets(mesh, device, global.dims())?;
    let dims = layout.local_dims(mesh, global.dims())?;
    global.extract_block(&offsets, &dims)
}

/// Sum blocks across the partial axes of `layout`; returns one block per
/// device.
fn all_reduce<'a>(
    mesh: &Mesh,
    layout: &Layout,
    blocks: impl Iterator<Item = &'a HostArray>,
) -> Result<Vec<HostArray>> {
    let blocks: Vec<&HostArray> = blocks.collect();
    if layout.partial().is_empty() {
        return Ok(blocks.into_iter().cloned().collect());
    }
    let partial: Vec<usize> = layout
        .partial()
        .iter()
        .map(|axis| {
            mesh.axis_index(axis)
                .ok_or_else(|| invalid(format!("mesh has no axis '{axis}'")))
        })
        .collect::<Result<_>>()?;
    let group_of = |device: usize| -> Vec<usize> {
        let mut coords = mesh.coords(device);
        for &i in &partial {
            coords[i] = 0;
        }
        coords
    };

    let mut sums: BTreeMap<Vec<usize>, HostArray> = BTreeMap::new();
    for (device, block) in blocks.iter().enumerate() {
        match sums.get_mut(&group_of(device)) {
            Some(acc) => add_into(acc, block)?,
            None => {
                sums.insert(group_of(device), (*block).clone());
            }
        }
    }
    (0..blocks.len())
        .map(|device| {
            sums.get(&group_of(device))
                .cloned()
                .ok_or_else(|| XcallError::Internal("missing reduction group".into()))
        })
        .collect()
}

fn add_into(acc: &mut HostArray, block: &HostArray) -> Result<()> {
    fn add<T: crate::types::Element + std::ops::AddAssign>(
        acc: &mut HostArray,
        block: &HostArray,
    ) -> Result<()> {
        let rhs = block.as_slice::<T>()?;
        for (a, b) in acc.as_mut_slice::<T>()?.iter_mut().zip(rhs) {
            *a += *b;
        }
        Ok(())
    }
    match acc.dtype() {
        DType::F32 => add::<f32>(acc, block),
        DType::F64 => add::<f64>(acc, block),
        DType::I32 => add::<i32>(acc, block),
        DType::I64 => add::<i64>(acc, block),
        other => Err(XcallError::NotImplemented(format!(
            "all-reduce over {other} elements"
        ))),
    }
}
