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

//! MIND foreign-call bridge.
//!
//! Native handlers are registered by `(name, platform)` and invoked through
//! typed call frames. Call sites add batching, custom reverse-mode
//! derivatives and layout-aware partitioning on top of a plain invocation.

pub mod abi;
pub mod attrs;
pub mod batching;
pub mod binding;
pub mod buffer;
pub mod call;
pub mod config;
pub mod custom_vjp;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod ffi;
pub mod frame;
pub mod handler;
pub mod logging;
pub mod partition;
pub mod registry;
pub mod stream;
pub mod testing;
pub mod types;

pub use call::{make_call, CallSite, CallSiteBuilder};
pub use config::BridgeConfig;
pub use error::{ErrorCategory, Result, XcallError};
pub use registry::{register_handler, Registry};

/// Names most callers need.
pub mod prelude {
    pub use crate::attrs::{AttrArg, AttrType, Attributes};
    pub use crate::batching::{BatchPolicy, Batched};
    pub use crate::binding::{Binding, ContextKind};
    pub use crate::buffer::{HostArray, TypedBuffer};
    pub use crate::call::{make_call, CallSite};
    pub use crate::config::BridgeConfig;
    pub use crate::custom_vjp::{CustomVjp, Pullback};
    pub use crate::error::{ErrorCategory, Result, XcallError};
    pub use crate::frame::{CallFrame, ExecutionContext, Platform, API_VERSION};
    pub use crate::handler::{Capsule, Handler};
    pub use crate::partition::{Layout, Mesh, PartitionHook, RulePartitioner, ShardingRule};
    pub use crate::registry::Registry;
    pub use crate::types::{DType, ShapeDType};
}
