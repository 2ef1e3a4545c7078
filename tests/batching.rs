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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mind_xcall::batching::{broadcast_shapes, common_batch_shape};
use mind_xcall::prelude::*;
use mind_xcall::testing::check_batching_law;

/// `out[..., j] = x[..., j] + y[..., j]` over whatever leading axes arrive.
fn add_capsule(calls: Arc<AtomicUsize>) -> Capsule {
    Capsule::from_fn(move |frame| {
        calls.fetch_add(1, Ordering::SeqCst);
        let (inputs, results) = frame.io_mut();
        let x = inputs[0].typed::<f32>()?;
        let y = inputs[1].typed::<f32>()?;
        for ((o, a), b) in results[0].typed_mut::<f32>()?.iter_mut().zip(x).zip(y) {
            *o = a + b;
        }
        Ok(())
    })
}

fn add_site(registry: &Registry, policy: BatchPolicy) -> CallSite {
    CallSite::builder("add", vec![ShapeDType::new(DType::F32, &[3])])
        .registry(registry)
        .config(BridgeConfig::default())
        .policy(policy)
        .build()
        .unwrap()
}

fn arange(dims: &[usize]) -> HostArray {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
    HostArray::from_slice(dims, &data).unwrap()
}

#[test]
fn sequential_invokes_once_per_element() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    registry.register("add", "host", add_capsule(calls.clone())).unwrap();
    let site = add_site(&registry, BatchPolicy::Sequential);

    let x = arange(&[4, 3]);
    let y = HostArray::from_vec(vec![10.0f32, 20.0, 30.0]);
    let out = site
        .vmap(&[Batched::new(&x, 1), Batched::unbatched(&y)], Attributes::new())
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(out[0].dims(), &[4, 3]);
    assert_eq!(
        out[0].to_vec::<f32>().unwrap()[..6],
        [10.0, 21.0, 32.0, 13.0, 24.0, 35.0]
    );
}

#[test]
fn sequential_with_empty_batch_never_invokes() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    registry.register("add", "host", add_capsule(calls.clone())).unwrap();
    let site = add_site(&registry, BatchPolicy::Sequential);

    let x = HostArray::zeros(DType::F32, &[0, 3]).unwrap();
    let y = HostArray::zeros(DType::F32, &[0, 3]).unwrap();
    let out = site
        .vmap(&[Batched::new(&x, 1), Batched::new(&y, 1)], Attributes::new())
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(out[0].dims(), &[0, 3]);
}

#[test]
fn vectorized_policies_match_sequential() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    registry.register("add", "host", add_capsule(calls.clone())).unwrap();
    let site = add_site(&registry, BatchPolicy::Sequential);

    let x = arange(&[2, 4, 3]);
    let y = arange(&[4, 3]);
    let args = [Batched::new(&x, 2), Batched::new(&y, 1)];
    let specs = site.result_specs().to_vec();
    let invoke = |inputs: &[&HostArray], specs: &[ShapeDType]| {
        site.call_with_specs(inputs, Attributes::new(), specs)
    };
    check_batching_law(BatchPolicy::BroadcastAll, &args, &specs, &invoke).unwrap();

    calls.store(0, Ordering::SeqCst);
    let broadcast = add_site(&registry, BatchPolicy::BroadcastAll)
        .vmap(&args, Attributes::new())
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broadcast[0].dims(), &[2, 4, 3]);
}

#[test]
fn expand_dims_passes_size_one_batch_axes() {
    let registry = Registry::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = seen.clone();
    registry
        .register(
            "shapes",
            "host",
            Capsule::from_fn(move |frame| {
                let dims: Vec<Vec<usize>> =
                    frame.inputs().iter().map(|b| b.dims().to_vec()).collect();
                record.lock().unwrap().push(dims);
                Ok(())
            }),
        )
        .unwrap();
    let site = CallSite::builder("shapes", vec![ShapeDType::new(DType::F32, &[3])])
        .registry(&registry)
        .config(BridgeConfig::default())
        .policy(BatchPolicy::ExpandDims)
        .build()
        .unwrap();

    let x = arange(&[5, 3]);
    let y = arange(&[3]);
    let out = site
        .vmap(&[Batched::new(&x, 1), Batched::unbatched(&y)], Attributes::new())
        .unwrap();
    assert_eq!(out[0].dims(), &[5, 3]);
    assert_eq!(*seen.lock().unwrap(), vec![vec![vec![5, 3], vec![1, 3]]]);
}

#[test]
fn legacy_vectorized_behaves_as_expand_dims() {
    assert_eq!(BatchPolicy::LegacyVectorized.effective(), BatchPolicy::ExpandDims);
    assert_eq!(BatchPolicy::parse("vectorized").unwrap(), BatchPolicy::LegacyVectorized);
    assert!(BatchPolicy::parse("parallel").is_err());
}

#[test]
fn incompatible_batch_shapes_fail_before_invocation() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    registry.register("add", "host", add_capsule(calls.clone())).unwrap();
    let site = add_site(&registry, BatchPolicy::BroadcastAll);

    let x = arange(&[2, 3]);
    let y = arange(&[5, 3]);
    let err = site
        .vmap(&[Batched::new(&x, 1), Batched::new(&y, 1)], Attributes::new())
        .unwrap_err();
    assert!(matches!(err, XcallError::InvalidArgument(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn batch_prefixes_align_from_the_right() {
    assert_eq!(broadcast_shapes(&[2, 1], &[4]).unwrap(), vec![2, 4]);
    assert_eq!(broadcast_shapes(&[], &[3]).unwrap(), vec![3]);
    assert!(broadcast_shapes(&[2], &[3]).is_err());

    let a = arange(&[2, 1, 3]);
    let b = arange(&[4, 3]);
    let shape = common_batch_shape(&[Batched::new(&a, 2), Batched::new(&b, 1)]).unwrap();
    assert_eq!(shape, vec![2, 4]);
}
