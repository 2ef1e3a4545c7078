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

use std::fmt;
use std::sync::Arc;

use crate::attrs::Attributes;
use crate::buffer::HostArray;
use crate::error::Result;
use crate::partition::{Layout, Mesh};
use crate::types::ShapeDType;

/// Closure that runs the foreign call on one device's local shards.
///
/// Receives the local input blocks and the local result specs.
pub type LocalCall =
    Arc<dyn Fn(&[&HostArray], &[ShapeDType]) -> Result<Vec<HostArray>> + Send + Sync>;

/// Wrap a closure as a [`LocalCall`].
pub fn local_call<F>(f: F) -> LocalCall
where
    F: Fn(&[&HostArray], &[ShapeDType]) -> Result<Vec<HostArray>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a hook decided for one call.
#[derive(Clone)]
pub struct Partitioned {
    pub mesh: Mesh,
    pub local_call: LocalCall,
    /// Layouts the local call produces, partial axes included.
    pub result_layouts: Vec<Layout>,
    /// Layouts each argument must have before the local call runs.
    pub arg_layouts: Vec<Layout>,
}

impl fmt::Debug for Partitioned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partitioned")
            .field("mesh", &self.mesh)
            .field("result_layouts", &self.result_layouts)
            .field("arg_layouts", &self.arg_layouts)
            .finish_non_exhaustive()
    }
}

/// Per-call-site partitioning callbacks.
///
/// `infer_result_layout` must be deterministic: identical inputs give
/// identical layouts. `partition` may rewrite the argument layouts it
/// receives; the planner inserts whatever communication is needed to get
/// from the caller's layouts to the ones returned.
pub trait PartitionHook: Send + Sync {
    fn infer_result_layout(
        &self,
        attrs: &Attributes,
        mesh: &Mesh,
        arg_layouts: &[Layout],
    ) -> Result<Vec<Layout>>;

    fn partition(
        &self,
        attrs: &Attributes,
        mesh: &Mesh,
        arg_layouts: &[Layout],
        result_layouts: &[Layout],
        local: LocalCall,
    ) -> Result<Partitioned>;

    /// Static check of global argument and result shapes.
    fn check(&self, _arg_specs: &[ShapeDType], _result_specs: &[ShapeDType]) -> Result<()> {
        Ok(())
    }
}

/// Hook used when a call site declares none: every argument is gathered
/// to full replication and every result is produced replicated.
#[derive(Debug, Clone, Copy, Default)]
pub struct Replicated;

impl PartitionHook for Replicated {
    fn infer_result_layout(
        &self,
        _attrs: &Attributes,
        _mesh: &Mesh,
        _arg_layouts: &[Layout],
    ) -> Result<Vec<Layout>> {
        // Result ranks are unknown here; the planner fills them in.
        Ok(Vec::new())
    }

    fn partition(
        &self,
        _attrs: &Attributes,
        mesh: &Mesh,
        arg_layouts: &[Layout],
        result_layouts: &[Layout],
        local: LocalCall,
    ) -> Result<Partitioned> {
        Ok(Partitioned {
            mesh: mesh.clone(),
            local_call: local,
            result_layouts: result_layouts
                .iter()
                .map(|l| Layout::replicated(l.rank()))
                .collect(),
            arg_layouts: arg_layouts
                .iter()
                .map(|l| Layout::replicated(l.rank()))
                .collect(),
        })
    }
}
