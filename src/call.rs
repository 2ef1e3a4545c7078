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

//! Call-site construction.
//!
//! Everything that can be checked without run-time data is checked when a
//! [`CallSite`] is built: the target must be registered for the platform,
//! result declarations must be well formed and agree with the handler's
//! binding, and the handler's ABI version must be accepted. The resolved
//! target is kept in the call site, so invoking it never consults the
//! registry again.
//!
//! # Example
//! ```
//! use mind_xcall::prelude::*;
//!
//! let registry = Registry::new();
//! registry
//!     .register("twice", "host", Capsule::from_fn(|frame| {
//!         let (inputs, results) = frame.io_mut();
//!         let x = inputs[0].typed::<f32>()?;
//!         for (o, v) in results[0].typed_mut::<f32>()?.iter_mut().zip(x) {
//!             *o = v * 2.0;
//!         }
//!         Ok(())
//!     }))
//!     .unwrap();
//! let site = CallSite::builder("twice", vec![ShapeDType::new(DType::F32, &[2])])
//!     .registry(&registry)
//!     .config(BridgeConfig::default())
//!     .build()
//!     .unwrap();
//! let x = HostArray::from_vec(vec![1.0f32, 2.5]);
//! let out = site.call(&[&x], Attributes::new()).unwrap();
//! assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![2.0, 5.0]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::attrs::{AttrArg, Attributes};
use crate::batching::{self, BatchPolicy, Batched};
use crate::buffer::{encode, HostArray};
use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::error::{invalid, Result, XcallError};
use crate::frame::{build_frame, check_version, ExecutionContext, Platform};
use crate::partition::{self, local_call, ExecutionPlan, Layout, Mesh, PartitionHook};
use crate::registry::{CallTarget, Registry};
use crate::types::ShapeDType;

/// Entries kept by a pure call site before the cache is flushed.
const CACHE_CAPACITY: usize = 64;

type ResultCache = Mutex<HashMap<Vec<u8>, Vec<HostArray>>>;

/// Build a call site on the host platform using the global registry and
/// the environment's configuration.
pub fn make_call(
    target: &str,
    result_specs: Vec<ShapeDType>,
    policy: BatchPolicy,
) -> Result<CallSite> {
    CallSite::builder(target, result_specs).policy(policy).build()
}

pub struct CallSiteBuilder<'r> {
    target: String,
    result_specs: Vec<ShapeDType>,
    policy: BatchPolicy,
    ctx: ExecutionContext,
    pure: bool,
    registry: Option<&'r Registry>,
    config: Option<BridgeConfig>,
    partitioner: Option<Arc<dyn PartitionHook>>,
}

impl<'r> CallSiteBuilder<'r> {
    pub fn policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Target a platform other than the host, with no stream or scratch.
    pub fn platform(mut self, platform: impl Into<Platform>) -> Self {
        self.ctx = ExecutionContext::new(platform.into());
        self
    }

    pub fn context(mut self, ctx: ExecutionContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Declare the handler free of side effects, allowing identical calls
    /// to share results when the configuration permits it.
    pub fn pure(mut self) -> Self {
        self.pure = true;
        self
    }

    pub fn registry(mut self, registry: &'r Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn partitioner(mut self, hook: impl PartitionHook + 'static) -> Self {
        self.partitioner = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<CallSite> {
        let config = match self.config {
            Some(config) => config,
            None => BridgeConfig::from_env()?,
        };
        let registry = self.registry.unwrap_or_else(|| Registry::global());
        let target = registry.resolve(&self.target, self.ctx.platform().clone())?;

        for (i, spec) in self.result_specs.iter().enumerate() {
            spec.concrete_dims()
                .map_err(|e| invalid(format!("result {i} of '{}': {}", self.target, e.message())))?;
        }
        if let Some(binding) = target.capsule.binding() {
            binding.validate_results(&self.result_specs)?;
            binding.validate_context(&self.ctx)?;
        }
        check_version(
            config.api_version,
            target.capsule.api_version(),
            &config.compatible_versions,
        )?;
        tracing::debug!(
            target_name = %target.name,
            platform = %target.platform,
            policy = %self.policy,
            pure = self.pure,
            "call site built"
        );

        Ok(CallSite {
            target,
            result_specs: self.result_specs,
            policy: self.policy,
            ctx: self.ctx,
            pure: self.pure,
            cse: self.pure && config.cse_pure_calls,
            dispatcher: Dispatcher::new(config),
            partitioner: self.partitioner,
            cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

/// A resolved, validated foreign call.
///
/// Cheap to clone; clones share the resolved target and the result cache.
#[derive(Clone)]
pub struct CallSite {
    target: Arc<CallTarget>,
    result_specs: Vec<ShapeDType>,
    policy: BatchPolicy,
    ctx: ExecutionContext,
    pure: bool,
    cse: bool,
    dispatcher: Dispatcher,
    partitioner: Option<Arc<dyn PartitionHook>>,
    cache: Arc<ResultCache>,
}

impl CallSite {
    pub fn builder<'r>(
        target: impl Into<String>,
        result_specs: Vec<ShapeDType>,
    ) -> CallSiteBuilder<'r> {
        CallSiteBuilder {
            target: target.into(),
            result_specs,
            policy: BatchPolicy::default(),
            ctx: ExecutionContext::host(),
            pure: false,
            registry: None,
            config: None,
            partitioner: None,
        }
    }

    pub fn target(&self) -> &CallTarget {
        &self.target
    }

    pub fn result_specs(&self) -> &[ShapeDType] {
        &self.result_specs
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    pub fn has_side_effect(&self) -> bool {
        !self.pure
    }

    /// Invoke on unbatched inputs.
    pub fn call(&self, inputs: &[&HostArray], attrs: Attributes) -> Result<Vec<HostArray>> {
        self.call_with_specs(inputs, attrs, &self.result_specs)
    }

    /// Invoke with trace-time attribute arguments; a traced value is
    /// rejected before anything runs.
    pub fn call_with_args<I, K>(&self, inputs: &[&HostArray], args: I) -> Result<Vec<HostArray>>
    where
        I: IntoIterator<Item = (K, AttrArg)>,
        K: Into<String>,
    {
        let attrs = Attributes::from_args(args)?;
        self.call(inputs, attrs)
    }

    /// Invoke with explicit result declarations, as the batching rules do.
    pub fn call_with_specs(
        &self,
        inputs: &[&HostArray],
        attrs: Attributes,
        result_specs: &[ShapeDType],
    ) -> Result<Vec<HostArray>> {
        let key = self.cse.then(|| cache_key(inputs, &attrs, result_specs));
        if let Some(key) = &key {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(hit) = cache.get(key) {
                tracing::trace!(target_name = %self.target.name, "pure call reused");
                return Ok(hit.clone());
            }
        }

        let mut results = result_specs
            .iter()
            .map(|spec| HostArray::zeros(spec.dtype, &spec.concrete_dims()?))
            .collect::<Result<Vec<_>>>()?;
        {
            let frame = build_frame(
                self.target.capsule.binding(),
                attrs,
                inputs.iter().map(|a| a.view()).collect(),
                result_specs,
                results.iter_mut().map(HostArray::view_mut).collect(),
                self.ctx.clone(),
            )?;
            self.dispatcher.invoke_scoped(&self.target, frame)?;
        }

        if let Some(key) = key {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if cache.len() >= CACHE_CAPACITY {
                cache.clear();
            }
            cache.insert(key, results.clone());
        }
        Ok(results)
    }

    /// Invoke under vectorization according to the call site's policy.
    pub fn vmap(&self, args: &[Batched<'_>], attrs: Attributes) -> Result<Vec<HostArray>> {
        batching::apply(self.policy, args, &self.result_specs, &|inputs, specs| {
            self.call_with_specs(inputs, attrs.clone(), specs)
        })
    }

    /// Plan this call over `mesh` for arguments laid out as `arg_layouts`.
    pub fn partition(
        &self,
        mesh: &Mesh,
        arg_specs: &[ShapeDType],
        arg_layouts: &[Layout],
        out_layouts: Option<&[Layout]>,
        attrs: &Attributes,
    ) -> Result<ExecutionPlan> {
        let site = self.clone();
        let call_attrs = attrs.clone();
        let local = local_call(move |inputs, specs| {
            site.call_with_specs(inputs, call_attrs.clone(), specs)
        });
        partition::plan_call(
            self.partitioner.as_deref(),
            attrs,
            mesh,
            arg_specs,
            arg_layouts,
            &self.result_specs,
            out_layouts,
            local,
        )
    }

    /// Plan and run the call over `mesh` on this host.
    pub fn call_sharded(
        &self,
        mesh: &Mesh,
        inputs: &[HostArray],
        arg_layouts: &[Layout],
        attrs: Attributes,
    ) -> Result<Vec<HostArray>> {
        let specs: Vec<ShapeDType> = inputs
            .iter()
            .map(|a| ShapeDType::from_dims(a.dtype(), a.dims()))
            .collect();
        let plan = self.partition(mesh, &specs, arg_layouts, None, &attrs)?;
        partition::execute(&plan, inputs)
    }

    /// Foreign calls carry no derivative rule.
    pub fn vjp(&self) -> Result<()> {
        Err(XcallError::NotImplemented(format!(
            "'{}' has no derivative rule; wrap it in a CustomVjp with explicit forward and backward calls",
            self.target.name
        )))
    }

    /// Forward mode is not supported for foreign calls.
    pub fn jvp(&self) -> Result<()> {
        Err(XcallError::NotImplemented(format!(
            "forward-mode differentiation of '{}' is not supported",
            self.target.name
        )))
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSite")
            .field("target", &self.target.name)
            .field("platform", &self.target.platform)
            .field("result_specs", &self.result_specs)
            .field("policy", &self.policy)
            .field("pure", &self.pure)
            .field("partitioned", &self.partitioner.is_some())
            .finish()
    }
}

fn cache_key(inputs: &[&HostArray], attrs: &Attributes, specs: &[ShapeDType]) -> Vec<u8> {
    let mut key = Vec::new();
    key.extend((inputs.len() as u64).to_le_bytes());
    for input in inputs {
        key.extend(encode(&input.view()));
    }
    key.extend(attrs.fingerprint().into_bytes());
    for spec in specs {
        let text = spec.to_string();
        key.extend((text.len() as u64).to_le_bytes());
        key.extend(text.into_bytes());
    }
    key
}
