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

use mind_xcall::partition::{Operand, PlanStep};
use mind_xcall::prelude::*;
use mind_xcall::testing::{check_close, check_layout_determinism};

fn registry() -> Registry {
    let registry = Registry::new();
    registry
        .register(
            "double",
            "host",
            Capsule::from_fn(|frame| {
                let (inputs, results) = frame.io_mut();
                let x = inputs[0].typed::<f32>()?;
                for (o, v) in results[0].typed_mut::<f32>()?.iter_mut().zip(x) {
                    *o = 2.0 * v;
                }
                Ok(())
            }),
        )
        .unwrap();
    registry
        .register(
            "row_normalize",
            "host",
            Capsule::from_fn(|frame| {
                let (inputs, results) = frame.io_mut();
                let cols = inputs[0].dims()[1];
                let x = inputs[0].typed::<f32>()?;
                let out = results[0].typed_mut::<f32>()?;
                for (row, dst) in x.chunks(cols).zip(out.chunks_mut(cols)) {
                    let total: f32 = row.iter().sum();
                    for (o, v) in dst.iter_mut().zip(row) {
                        *o = v / total;
                    }
                }
                Ok(())
            }),
        )
        .unwrap();
    registry
        .register(
            "matmul",
            "host",
            Capsule::from_fn(|frame| {
                let (inputs, results) = frame.io_mut();
                let (m, k) = (inputs[0].dims()[0], inputs[0].dims()[1]);
                let n = inputs[1].dims()[1];
                let a = inputs[0].typed::<f32>()?;
                let b = inputs[1].typed::<f32>()?;
                let c = results[0].typed_mut::<f32>()?;
                for i in 0..m {
                    for j in 0..n {
                        c[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
                    }
                }
                Ok(())
            }),
        )
        .unwrap();
    registry
}

fn arange(dims: &[usize], offset: f32) -> HostArray {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|i| i as f32 + offset).collect();
    HostArray::from_slice(dims, &data).unwrap()
}

fn f32s(dims: &[i64]) -> ShapeDType {
    ShapeDType::new(DType::F32, dims)
}

fn spec_of(a: &HostArray) -> ShapeDType {
    ShapeDType::from_dims(a.dtype(), a.dims())
}

fn site(
    registry: &Registry,
    name: &str,
    out: ShapeDType,
    rule: &str,
    replicate: &[&str],
) -> CallSite {
    let partitioner = RulePartitioner::new(ShardingRule::parse(rule).unwrap())
        .need_replication(replicate.iter().copied());
    CallSite::builder(name, vec![out])
        .registry(registry)
        .config(BridgeConfig::default())
        .partitioner(partitioner)
        .build()
        .unwrap()
}

#[test]
fn leading_axis_sharding_needs_no_communication() {
    let registry = registry();
    let site = site(&registry, "double", f32s(&[8, 3]), "b j -> b j", &[]);
    let mesh = Mesh::new(&[("data", 4)]).unwrap();
    let x = arange(&[8, 3], 0.0);
    let layout = [Layout::sharded(&[Some("data"), None])];

    let plan = site
        .partition(&mesh, &[spec_of(&x)], &layout, None, &Attributes::new())
        .unwrap();
    assert!(!plan.has_communication(), "{plan}");
    assert_eq!(plan.result_layouts, vec![Layout::sharded(&[Some("data"), None])]);

    let sharded = site
        .call_sharded(&mesh, &[x.clone()], &layout, Attributes::new())
        .unwrap();
    let whole = site.call(&[&x], Attributes::new()).unwrap();
    assert_eq!(sharded, whole);
}

#[test]
fn replicated_factor_is_gathered() {
    let registry = registry();
    let site = site(&registry, "row_normalize", f32s(&[4, 6]), "b j -> b j", &["j"]);
    let mesh = Mesh::new(&[("data", 2), ("model", 2)]).unwrap();
    let x = arange(&[4, 6], 1.0);
    let layout = [Layout::sharded(&[Some("data"), Some("model")])];

    let plan = site
        .partition(&mesh, &[spec_of(&x)], &layout, None, &Attributes::new())
        .unwrap();
    let comms: Vec<&PlanStep> = plan.communication().collect();
    assert_eq!(
        comms,
        vec![&PlanStep::AllGather {
            operand: Operand::Arg(0),
            dim: 1,
            axis: "model".into(),
        }]
    );
    assert_eq!(plan.call_arg_layouts, vec![Layout::sharded(&[Some("data"), None])]);

    let sharded = site
        .call_sharded(&mesh, &[x.clone()], &layout, Attributes::new())
        .unwrap();
    let whole = site.call(&[&x], Attributes::new()).unwrap();
    check_close(&sharded[0], &whole[0], 1e-6).unwrap();
}

#[test]
fn contraction_over_sharded_axis_is_all_reduced() {
    let registry = registry();
    let site = site(&registry, "matmul", f32s(&[4, 3]), "i k, k j -> i j", &[]);
    let mesh = Mesh::new(&[("x", 2)]).unwrap();
    let a = arange(&[4, 4], 0.0);
    let b = arange(&[4, 3], -5.0);
    let layouts = [
        Layout::sharded(&[None, Some("x")]),
        Layout::sharded(&[Some("x"), None]),
    ];

    let plan = site
        .partition(
            &mesh,
            &[spec_of(&a), spec_of(&b)],
            &layouts,
            None,
            &Attributes::new(),
        )
        .unwrap();
    assert_eq!(
        plan.communication().cloned().collect::<Vec<_>>(),
        vec![PlanStep::AllReduce {
            result: 0,
            axes: vec!["x".into()],
        }]
    );
    assert_eq!(plan.call_result_layouts[0].partial(), &["x".to_string()]);
    assert!(plan.result_layouts[0].is_replicated());

    let sharded = site
        .call_sharded(&mesh, &[a.clone(), b.clone()], &layouts, Attributes::new())
        .unwrap();
    let whole = site.call(&[&a, &b], Attributes::new()).unwrap();
    assert_eq!(sharded, whole);
}

#[test]
fn call_site_without_hook_gathers_everything() {
    let registry = registry();
    let site = CallSite::builder("double", vec![f32s(&[4, 2])])
        .registry(&registry)
        .config(BridgeConfig::default())
        .build()
        .unwrap();
    let mesh = Mesh::new(&[("data", 2)]).unwrap();
    let x = arange(&[4, 2], 0.0);
    let layout = [Layout::sharded(&[Some("data"), None])];
    let plan = site
        .partition(&mesh, &[spec_of(&x)], &layout, None, &Attributes::new())
        .unwrap();
    assert_eq!(plan.communication().count(), 1);
    assert!(plan.call_arg_layouts[0].is_replicated());

    let out = site
        .call_sharded(&mesh, &[x.clone()], &layout, Attributes::new())
        .unwrap();
    assert_eq!(out, site.call(&[&x], Attributes::new()).unwrap());
}

#[test]
fn requested_output_layout_adds_a_slice() {
    let registry = registry();
    let site = site(&registry, "matmul", f32s(&[4, 3]), "i k, k j -> i j", &[]);
    let mesh = Mesh::new(&[("x", 2)]).unwrap();
    let specs = [f32s(&[4, 4]), f32s(&[4, 3])];
    let layouts = [Layout::replicated(2), Layout::replicated(2)];
    let wanted = [Layout::sharded(&[Some("x"), None])];
    let plan = site
        .partition(&mesh, &specs, &layouts, Some(&wanted), &Attributes::new())
        .unwrap();
    assert!(!plan.has_communication());
    assert_eq!(
        plan.steps.last(),
        Some(&PlanStep::Slice {
            operand: Operand::Result(0),
            dim: 0,
            axis: "x".into(),
        })
    );
    assert_eq!(plan.result_layouts, wanted.to_vec());
}

#[test]
fn rule_shape_mismatch_is_rejected_when_planning() {
    let registry = registry();
    let site = site(&registry, "matmul", f32s(&[4, 3]), "i k, k j -> i j", &[]);
    let mesh = Mesh::new(&[("x", 2)]).unwrap();
    let err = site
        .partition(
            &mesh,
            &[f32s(&[4, 4]), f32s(&[4])],
            &[Layout::replicated(2), Layout::replicated(1)],
            None,
            &Attributes::new(),
        )
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidArgument);
}

#[test]
fn rule_inference_is_deterministic() {
    let hook = RulePartitioner::new(ShardingRule::parse("i k, k j -> i j").unwrap());
    let mesh = Mesh::new(&[("x", 2), ("y", 2)]).unwrap();
    let layouts = [
        Layout::sharded(&[Some("x"), Some("y")]),
        Layout::sharded(&[None, None]),
    ];
    let inferred =
        check_layout_determinism(&hook, &Attributes::new(), &mesh, &layouts, 8).unwrap();
    assert_eq!(
        inferred,
        vec![Layout::sharded(&[Some("x"), None]).with_partial(["y".to_string()])]
    );
}
