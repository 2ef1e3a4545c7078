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

//! Sharding support for foreign calls.
//!
//! A call site without a hook is treated as needing fully replicated
//! arguments: sharded inputs are gathered before the call. A
//! [`PartitionHook`] lets a call declare cheaper layouts, either by hand or
//! through a [`RulePartitioner`] built from an einsum-like
//! [`ShardingRule`]. Planning yields an [`ExecutionPlan`] whose steps show
//! exactly which collectives run; [`execute`] runs a plan on one host.

mod hook;
mod layout;
mod plan;
mod rule;
mod simulate;

pub use hook::{local_call, LocalCall, PartitionHook, Partitioned, Replicated};
pub use layout::{Layout, Mesh};
pub use plan::{plan_call, ExecutionPlan, Operand, PlanStep};
pub use rule::{DimMapping, FactorMapping, RulePartitioner, ShardingRule, ValueMapping};
pub use simulate::execute;
