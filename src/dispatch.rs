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

//! Invocation engine.
//!
//! Host-platform handlers run synchronously on the calling thread. Every
//! other platform requires a stream in the execution context; the handler
//! is enqueued and the call counts as complete once enqueued. Handler
//! failures come back as [`XcallError::Handler`] unless the configuration
//! makes them fatal. Nothing is retried.

use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use crate::abi::{RawFrame, XcallErrorRecord};
use crate::attrs::Attributes;
use crate::buffer::TypedBuffer;
use crate::config::BridgeConfig;
use crate::error::{invalid, Result, XcallError};
use crate::frame::{build_frame, check_version, CallFrame, ExecutionContext, ScratchAllocator};
use crate::handler::EntryPoint;
use crate::registry::{CallTarget, Registry};
use crate::stream::StreamEvent;
use crate::types::ShapeDType;

/// How far an invocation got when `invoke` returned.
#[derive(Debug)]
pub enum Completion {
    /// The handler ran to completion on the calling thread.
    Complete,
    /// The handler was enqueued on the context's stream. The event reports
    /// this call's outcome only; dropping it leaves a failure to
    /// [`Stream::synchronize`](crate::stream::Stream::synchronize).
    Enqueued(StreamEvent),
}

impl Completion {
    /// Block until the call has run and return its own outcome.
    pub fn wait(self) -> Result<()> {
        match self {
            Completion::Complete => Ok(()),
            Completion::Enqueued(event) => event.wait(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    config: BridgeConfig,
}

impl Dispatcher {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Invoke a resolved target.
    ///
    /// The frame owns `'static` buffers because enqueued work may outlive
    /// this call; use [`Dispatcher::invoke_scoped`] for borrowed buffers.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(target_name = %target.name, platform = %target.platform)
    )]
    pub fn invoke(&self, target: &CallTarget, frame: CallFrame<'static>) -> Result<Completion> {
        let frame = frame.with_api_version(self.config.api_version);
        check_version(
            frame.api_version(),
            target.capsule.api_version(),
            &self.config.compatible_versions,
        )?;
        if frame.ctx().platform() != &target.platform {
            return Err(invalid(format!(
                "frame built for platform '{}' but target is registered for '{}'",
                frame.ctx().platform(),
                target.platform
            )));
        }

        let entry = target.capsule.entry().clone();
        if target.platform.is_host() && !matches!(entry, EntryPoint::Stream(_)) {
            let mut frame = frame;
            let lease = ScratchLease::enter(&frame);
            let outcome = run_entry(&target.name, &entry, &mut frame, ptr::null_mut());
            drop(lease);
            self.finish(&target.name, outcome)?;
            return Ok(Completion::Complete);
        }

        let Some(stream) = frame.ctx().stream().cloned() else {
            return Err(XcallError::NotImplemented(format!(
                "target '{}' on platform '{}' needs a stream and none was supplied",
                target.name, target.platform
            )));
        };
        let name = target.name.clone();
        let fatal = self.config.fatal_handler_errors;
        let handle = stream.raw_handle() as usize;
        let mut frame = frame;
        let lease = ScratchLease::enter(&frame);
        let event = stream.enqueue(Box::new(move || {
            let outcome = run_entry(&name, &entry, &mut frame, handle as *mut c_void);
            drop(lease);
            finish_with(fatal, &name, outcome)
        }))?;
        tracing::debug!("handler enqueued");
        Ok(Completion::Enqueued(event))
    }

    /// Invoke with borrowed buffers, waiting for this call's stream work
    /// to finish before the borrows end. Failures of other work on the same
    /// stream are not reported here.
    pub fn invoke_scoped(&self, target: &CallTarget, frame: CallFrame<'_>) -> Result<()> {
        // SAFETY: the completion is awaited below, before any buffer borrow
        // held by `frame` can end. The work item owns the frame, so it is
        // dropped on the stream thread before the event fires.
        let frame = unsafe { frame.into_static() };
        self.invoke(target, frame)?.wait()
    }

    /// Resolve `name` on the context's platform, build and validate the
    /// frame, and invoke it.
    #[allow(clippy::too_many_arguments)]
    pub fn invoke_by_name<'a>(
        &self,
        registry: &Registry,
        name: &str,
        attrs: Attributes,
        inputs: Vec<TypedBuffer<'a>>,
        declared: &[ShapeDType],
        results: Vec<TypedBuffer<'a>>,
        ctx: ExecutionContext,
    ) -> Result<()> {
        let target = registry.resolve(name, ctx.platform().clone())?;
        let frame = build_frame(
            target.capsule.binding(),
            attrs,
            inputs,
            declared,
            results,
            ctx,
        )?;
        self.invoke_scoped(&target, frame)
    }

    fn finish(&self, name: &str, outcome: Result<()>) -> Result<()> {
        finish_with(self.config.fatal_handler_errors, name, outcome)
    }
}

fn finish_with(fatal: bool, name: &str, outcome: Result<()>) -> Result<()> {
    let Err(err) = outcome else {
        return Ok(());
    };
    if fatal {
        tracing::error!(target_name = name, error = %err, "handler failed; aborting");
        std::process::abort();
    }
    tracing::warn!(target_name = name, error = %err, "handler failed");
    Err(err)
}

/// Holds the context's scratch allocator for one invocation.
struct ScratchLease(Option<Arc<dyn ScratchAllocator>>);

impl ScratchLease {
    fn enter(frame: &CallFrame<'_>) -> Self {
        let scratch = frame.ctx().scratch().cloned();
        if let Some(scratch) = &scratch {
            scratch.enter();
        }
        Self(scratch)
    }
}

impl Drop for ScratchLease {
    fn drop(&mut self) {
        if let Some(scratch) = self.0.take() {
            scratch.exit();
        }
    }
}

fn run_entry(
    name: &str,
    entry: &EntryPoint,
    frame: &mut CallFrame<'_>,
    stream: *mut c_void,
) -> Result<()> {
    let record = match entry {
        EntryPoint::Rust(handler) => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.call(frame)));
            return match outcome {
                Ok(result) => result.map_err(|e| XcallError::from_handler(name, e)),
                Err(payload) => Err(XcallError::Internal(format!(
                    "handler '{name}' panicked: {}",
                    panic_message(&*payload)
                ))),
            };
        }
        EntryPoint::Host(f) => {
            let mut raw = RawFrame::new(frame, ptr::null_mut())?;
            // SAFETY: the raw frame points into `frame`, alive for the call.
            unsafe { f(raw.as_mut_ptr()) }
        }
        EntryPoint::Stream(f) => {
            let mut raw = RawFrame::new(frame, stream)?;
            // SAFETY: as above; `stream` is the context's handle.
            unsafe { f(stream, raw.as_mut_ptr()) }
        }
    };
    // SAFETY: native handlers allocate records through the bridge.
    match unsafe { XcallErrorRecord::take(record) } {
        None => Ok(()),
        Some((category, message)) => Err(XcallError::Handler {
            target: name.to_string(),
            category,
            message,
        }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HostArray;
    use crate::error::ErrorCategory;
    use crate::frame::Platform;
    use crate::handler::Capsule;
    use crate::types::DType;

    fn target(name: &str, platform: &str, capsule: Capsule) -> CallTarget {
        CallTarget {
            name: name.into(),
            platform: Platform::new(platform),
            capsule,
        }
    }

    fn empty_frame(ctx: ExecutionContext) -> CallFrame<'static> {
        build_frame(None, Attributes::new(), vec![], &[], vec![], ctx).unwrap()
    }

    #[test]
    fn panics_become_internal_errors() {
        let t = target("boom", "host", Capsule::from_fn(|_| panic!("kaboom")));
        let err = Dispatcher::default()
            .invoke(&t, empty_frame(ExecutionContext::host()))
            .unwrap_err();
        assert!(matches!(err, XcallError::Internal(ref m) if m.contains("kaboom")));
    }

    #[test]
    fn handler_errors_keep_their_category() {
        let t = target(
            "fail",
            "host",
            Capsule::from_fn(|_| Err(XcallError::OutOfRange("bad index".into()))),
        );
        let err = Dispatcher::default()
            .invoke(&t, empty_frame(ExecutionContext::host()))
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::OutOfRange);
        assert!(matches!(err, XcallError::Handler { ref target, .. } if target == "fail"));
    }

    #[test]
    fn non_host_without_stream_is_not_implemented() {
        let t = target("f", "cuda", Capsule::from_fn(|_| Ok(())));
        let err = Dispatcher::default()
            .invoke(&t, empty_frame(ExecutionContext::new(Platform::new("cuda"))))
            .unwrap_err();
        assert!(matches!(err, XcallError::NotImplemented(_)));
    }

    #[test]
    fn platform_mismatch_is_rejected() {
        let t = target("f", "cuda", Capsule::from_fn(|_| Ok(())));
        let err = Dispatcher::default()
            .invoke(&t, empty_frame(ExecutionContext::host()))
            .unwrap_err();
        assert!(matches!(err, XcallError::InvalidArgument(_)));
    }

    #[test]
    fn scoped_host_call_writes_results() {
        let t = target(
            "fill",
            "host",
            Capsule::from_fn(|frame| {
                let value = frame.attrs().f64("value")? as f32;
                frame.result(0)?.typed_mut::<f32>()?.fill(value);
                Ok(())
            }),
        );
        let mut out = HostArray::zeros(DType::F32, &[3]).unwrap();
        let frame = build_frame(
            None,
            Attributes::new().with("value", 2.5f64),
            vec![],
            &[ShapeDType::new(DType::F32, &[3])],
            vec![out.view_mut()],
            ExecutionContext::host(),
        )
        .unwrap();
        Dispatcher::default().invoke_scoped(&t, frame).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![2.5; 3]);
    }
}
