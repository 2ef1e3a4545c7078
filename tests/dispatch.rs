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

use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mind_xcall::abi::{XcallErrorRecord, XcallFrame};
use mind_xcall::dispatch::Dispatcher;
use mind_xcall::frame::{HostScratch, ScratchAllocator};
use mind_xcall::prelude::*;

const FATAL_CHILD_ENV: &str = "MIND_XCALL_TEST_FATAL_CHILD";

/// Squares the input into scratch memory and writes the sum of squares.
unsafe extern "C" fn sum_of_squares(frame: *mut XcallFrame) -> *mut XcallErrorRecord {
    let frame = &mut *frame;
    let x = match frame.args()[0].as_slice::<f32>() {
        Ok(x) => x,
        Err(err) => return XcallErrorRecord::from_error(&err),
    };
    let block = match frame.scratch_allocate(std::mem::size_of_val(x), 4) {
        Ok(block) => block as *mut f32,
        Err(err) => return XcallErrorRecord::from_error(&err),
    };
    let squares = std::slice::from_raw_parts_mut(block, x.len());
    for (s, v) in squares.iter_mut().zip(x) {
        *s = v * v;
    }
    let out = match frame.rets()[0].as_mut_slice::<f32>() {
        Ok(out) => out,
        Err(err) => return XcallErrorRecord::from_error(&err),
    };
    out[0] = squares.iter().sum();
    std::ptr::null_mut()
}

fn neg() -> Capsule {
    Capsule::from_fn(|frame| {
        let (inputs, results) = frame.io_mut();
        let x = inputs[0].typed::<f32>()?;
        for (o, v) in results[0].typed_mut::<f32>()?.iter_mut().zip(x) {
            *o = -v;
        }
        Ok(())
    })
}

#[test]
fn invoke_by_name_resolves_and_runs() {
    let registry = Registry::new();
    registry.register("neg", "host", neg()).unwrap();
    let x = HostArray::from_vec(vec![1.0f32, -2.0, 3.0, 0.0]);
    let mut out = HostArray::zeros(DType::F32, &[4]).unwrap();
    let declared = [ShapeDType::new(DType::F32, &[4])];

    Dispatcher::default()
        .invoke_by_name(
            &registry,
            "neg",
            Attributes::new(),
            vec![x.view()],
            &declared,
            vec![out.view_mut()],
            ExecutionContext::host(),
        )
        .unwrap();
    assert_eq!(out.to_vec::<f32>().unwrap(), vec![-1.0, 2.0, -3.0, 0.0]);

    let err = Dispatcher::default()
        .invoke_by_name(
            &registry,
            "neg",
            Attributes::new(),
            vec![x.view()],
            &declared,
            vec![out.view_mut()],
            ExecutionContext::new(Platform::new("gpu")),
        )
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
}

#[test]
fn native_handler_allocates_scratch_for_one_call() {
    let registry = Registry::new();
    registry
        .register("sum_sq", "host", Capsule::host(sum_of_squares))
        .unwrap();
    let scratch = Arc::new(HostScratch::new(64));
    let site = CallSite::builder("sum_sq", vec![ShapeDType::new(DType::F32, &[1])])
        .registry(&registry)
        .config(BridgeConfig::default())
        .context(ExecutionContext::host().with_scratch(scratch.clone()))
        .build()
        .unwrap();

    let x = HostArray::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]);
    for _ in 0..8 {
        let out = site.call(&[&x], Attributes::new()).unwrap();
        assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![30.0]);
        assert_eq!(scratch.used(), 0);
        assert_eq!(scratch.active(), 0);
    }

    let bare = CallSite::builder("sum_sq", vec![ShapeDType::new(DType::F32, &[1])])
        .registry(&registry)
        .config(BridgeConfig::default())
        .build()
        .unwrap();
    let err = bare.call(&[&x], Attributes::new()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidArgument);
}

#[test]
fn rust_handler_sees_scratch_held_during_the_call() {
    let registry = Registry::new();
    let scratch = Arc::new(HostScratch::new(128));
    let seen = Arc::new(AtomicUsize::new(0));
    let (watch, record) = (scratch.clone(), seen.clone());
    registry
        .register(
            "scratchy",
            "host",
            Capsule::from_fn(move |frame| {
                let scratch = frame
                    .ctx()
                    .scratch()
                    .cloned()
                    .ok_or_else(|| XcallError::InvalidArgument("no scratch".into()))?;
                scratch.allocate(48, 8)?;
                record.store(watch.used() * 100 + watch.active(), Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
    let site = CallSite::builder("scratchy", vec![])
        .registry(&registry)
        .config(BridgeConfig::default())
        .context(ExecutionContext::host().with_scratch(scratch.clone()))
        .build()
        .unwrap();

    site.call(&[], Attributes::new()).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 48 * 100 + 1);
    assert_eq!(scratch.used(), 0);
}

#[test]
fn fatal_handler_error_child() {
    if std::env::var_os(FATAL_CHILD_ENV).is_none() {
        return;
    }
    let registry = Registry::new();
    registry
        .register(
            "doomed",
            "host",
            Capsule::from_fn(|_| Err(XcallError::Internal("doomed".into()))),
        )
        .unwrap();
    let config = BridgeConfig {
        fatal_handler_errors: true,
        ..BridgeConfig::default()
    };
    let site = CallSite::builder("doomed", vec![])
        .registry(&registry)
        .config(config)
        .build()
        .unwrap();
    let outcome = site.call(&[], Attributes::new());
    panic!("fatal handler error returned {outcome:?}");
}

#[test]
fn fatal_handler_errors_abort_the_process() {
    let output = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "fatal_handler_error_child", "--test-threads=1"])
        .env(FATAL_CHILD_ENV, "1")
        .output()
        .unwrap();
    assert!(!output.status.success(), "{output:?}");
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(6), "{output:?}");
    }
}
