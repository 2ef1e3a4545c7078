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

//! The per-invocation call frame and its execution context.

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::attrs::Attributes;
use crate::binding::Binding;
use crate::buffer::TypedBuffer;
use crate::error::{invalid, Result, XcallError};
use crate::stream::Stream;
use crate::types::ShapeDType;

/// Call-frame protocol version produced by this build.
pub const API_VERSION: u32 = 1;

/// Execution platform identity.
///
/// Names are case-insensitive; `cpu` is an alias of `host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Platform(String);

impl Platform {
    pub const HOST: &'static str = "host";

    pub fn new(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        if name == "cpu" {
            return Platform(Self::HOST.to_string());
        }
        Platform(name)
    }

    pub fn host() -> Self {
        Platform(Self::HOST.to_string())
    }

    /// Host handlers run synchronously on the calling thread.
    pub fn is_host(&self) -> bool {
        self.0 == Self::HOST
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Platform {
    fn from(name: &str) -> Self {
        Platform::new(name)
    }
}

/// Temporary workspace memory handed to a handler.
///
/// The dispatcher brackets every invocation with [`ScratchAllocator::enter`]
/// and [`ScratchAllocator::exit`]. An allocation stays valid until the
/// invocation that made it has exited; an allocator shared between calls
/// may only reclaim memory once no invocation is in flight.
pub trait ScratchAllocator: Send + Sync {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>>;
    fn enter(&self);
    fn exit(&self);
}

#[derive(Default)]
struct BumpState {
    offset: usize,
    active: usize,
}

/// Bump allocator over one fixed host block.
///
/// The block is rewound when the last in-flight invocation exits.
pub struct HostScratch {
    base: NonNull<u64>,
    words: usize,
    state: Mutex<BumpState>,
}

// SAFETY: the block is owned by `HostScratch` and carved into disjoint
// regions under the offset lock.
unsafe impl Send for HostScratch {}
unsafe impl Sync for HostScratch {}

impl HostScratch {
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(8);
        let block: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let base = NonNull::new(Box::into_raw(block) as *mut u64).unwrap_or(NonNull::dangling());
        Self {
            base,
            words,
            state: Mutex::new(BumpState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.words * 8
    }

    pub fn used(&self) -> usize {
        self.lock().offset
    }

    /// Invocations currently holding the block.
    pub fn active(&self) -> usize {
        self.lock().active
    }

    fn lock(&self) -> MutexGuard<'_, BumpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScratchAllocator for HostScratch {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() || align > 8 {
            return Err(invalid(format!("unsupported scratch alignment {align}")));
        }
        let mut state = self.lock();
        let start = state.offset.next_multiple_of(align);
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.capacity())
            .ok_or_else(|| {
                XcallError::OutOfRange(format!(
                    "scratch request of {size} bytes exceeds remaining {} bytes",
                    self.capacity() - state.offset
                ))
            })?;
        state.offset = end;
        // SAFETY: start <= capacity, inside the owned block.
        let ptr = unsafe { (self.base.as_ptr() as *mut u8).add(start) };
        Ok(NonNull::new(ptr).unwrap_or(NonNull::dangling()))
    }

    fn enter(&self) {
        self.lock().active += 1;
    }

    fn exit(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            state.offset = 0;
        }
    }
}

impl Drop for HostScratch {
    fn drop(&mut self) {
        if self.words == 0 {
            return;
        }
        // SAFETY: reconstructs the box leaked in `new`.
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.words);
            drop(Box::from_raw(slice));
        }
    }
}

/// Platform identity plus the optional stream and scratch allocator.
#[derive(Clone)]
pub struct ExecutionContext {
    platform: Platform,
    stream: Option<Arc<dyn Stream>>,
    scratch: Option<Arc<dyn ScratchAllocator>>,
}

impl ExecutionContext {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            stream: None,
            scratch: None,
        }
    }

    pub fn host() -> Self {
        Self::new(Platform::host())
    }

    pub fn with_stream(mut self, stream: Arc<dyn Stream>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_scratch(mut self, scratch: Arc<dyn ScratchAllocator>) -> Self {
        self.scratch = Some(scratch);
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn stream(&self) -> Option<&Arc<dyn Stream>> {
        self.stream.as_ref()
    }

    pub fn scratch(&self) -> Option<&Arc<dyn ScratchAllocator>> {
        self.scratch.as_ref()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("platform", &self.platform)
            .field("stream", &self.stream.is_some())
            .field("scratch", &self.scratch.is_some())
            .finish()
    }
}

/// Everything one invocation hands to a handler.
///
/// Inputs are read-only; results are pre-allocated to the declared shapes
/// and must all be written by a successful handler.
#[derive(Debug)]
pub struct CallFrame<'a> {
    api_version: u32,
    inputs: Vec<TypedBuffer<'a>>,
    results: Vec<TypedBuffer<'a>>,
    attrs: Attributes,
    ctx: ExecutionContext,
}

impl<'a> CallFrame<'a> {
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Restamp the frame, e.g. with a configured protocol version.
    pub fn with_api_version(mut self, version: u32) -> Self {
        self.api_version = version;
        self
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    pub fn input(&self, index: usize) -> Result<&TypedBuffer<'a>> {
        self.inputs.get(index).ok_or_else(|| {
            XcallError::OutOfRange(format!(
                "input {index} requested, frame has {}",
                self.inputs.len()
            ))
        })
    }

    pub fn result(&mut self, index: usize) -> Result<&mut TypedBuffer<'a>> {
        let len = self.results.len();
        self.results.get_mut(index).ok_or_else(|| {
            XcallError::OutOfRange(format!("result {index} requested, frame has {len}"))
        })
    }

    pub fn inputs(&self) -> &[TypedBuffer<'a>] {
        &self.inputs
    }

    pub fn results(&self) -> &[TypedBuffer<'a>] {
        &self.results
    }

    /// Split borrow: inputs read-only, results writable.
    pub fn io_mut(&mut self) -> (&[TypedBuffer<'a>], &mut [TypedBuffer<'a>]) {
        (&self.inputs, &mut self.results)
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn ctx(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub(crate) fn parts_mut(
        &mut self,
    ) -> (
        &[TypedBuffer<'a>],
        &mut [TypedBuffer<'a>],
        &Attributes,
        &ExecutionContext,
    ) {
        (&self.inputs, &mut self.results, &self.attrs, &self.ctx)
    }

    /// Erase the buffer borrows.
    ///
    /// # Safety
    ///
    /// Every buffer must outlive all uses of the returned frame.
    pub(crate) unsafe fn into_static(self) -> CallFrame<'static> {
        CallFrame {
            api_version: self.api_version,
            inputs: self.inputs.into_iter().map(|b| b.into_static()).collect(),
            results: self.results.into_iter().map(|b| b.into_static()).collect(),
            attrs: self.attrs,
            ctx: self.ctx,
        }
    }
}

/// Build a frame, validating everything that is known statically.
///
/// When a binding is supplied, attribute presence and types, buffer element
/// types, and required context objects are checked. Declared result shapes
/// must be non-negative and each result buffer must be writable and match
/// its declaration exactly.
pub fn build_frame<'a>(
    binding: Option<&Binding>,
    attrs: Attributes,
    inputs: Vec<TypedBuffer<'a>>,
    declared: &[ShapeDType],
    results: Vec<TypedBuffer<'a>>,
    ctx: ExecutionContext,
) -> Result<CallFrame<'a>> {
    for spec in declared {
        spec.concrete_dims()?;
    }
    if let Some(binding) = binding {
        binding.validate_attrs(&attrs)?;
        let input_types: Vec<_> = inputs.iter().map(TypedBuffer::dtype).collect();
        binding.validate_buffers(&input_types, declared)?;
        binding.validate_context(&ctx)?;
    }
    if results.len() != declared.len() {
        return Err(invalid(format!(
            "{} result buffers supplied for {} declared results",
            results.len(),
            declared.len()
        )));
    }
    for (i, (buf, spec)) in results.iter().zip(declared).enumerate() {
        if !buf.matches(spec) {
            return Err(invalid(format!(
                "result {i} is {}, declared {spec}",
                buf.shape_dtype()
            )));
        }
        if !buf.is_writable() {
            return Err(invalid(format!("result {i} is not writable")));
        }
    }
    Ok(CallFrame {
        api_version: API_VERSION,
        inputs,
        results,
        attrs,
        ctx,
    })
}

/// Reject a frame whose version the handler was not built for.
pub fn check_version(frame: u32, handler: u32, compatible: &[u32]) -> Result<()> {
    if frame == handler || compatible.contains(&handler) {
        return Ok(());
    }
    Err(XcallError::VersionMismatch { frame, handler })
}
