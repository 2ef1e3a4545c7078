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

//! Binding declarations: the call-frame shape a handler expects.
//!
//! A binding is compile-time metadata. It documents what a handler reads
//! from its frame and lets the bridge reject mismatched calls before any
//! frame is built.
//!
//! # Example
//! ```
//! use mind_xcall::attrs::AttrType;
//! use mind_xcall::binding::Binding;
//! use mind_xcall::types::DType;
//!
//! let binding = Binding::new()
//!     .arg(DType::F32)
//!     .ret(DType::F32)
//!     .attr("axis", AttrType::I64);
//! assert_eq!(binding.num_args(), Some(1));
//! ```

use std::fmt;

use crate::attrs::{AttrType, Attributes};
use crate::error::{invalid, Result};
use crate::frame::ExecutionContext;
use crate::types::{DType, ShapeDType};

/// Context objects a handler may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Stream,
    Scratch,
    Platform,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContextKind::Stream => "stream",
            ContextKind::Scratch => "scratch allocator",
            ContextKind::Platform => "platform",
        })
    }
}

/// One entry of a binding declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    /// Input buffer; `None` accepts any element type.
    Arg(Option<DType>),
    /// Result buffer; `None` accepts any element type.
    Ret(Option<DType>),
    Attr { name: String, ty: AttrType },
    Ctx(ContextKind),
    /// Any number of further input buffers.
    RemainingArgs,
    /// Any number of further result buffers.
    RemainingRets,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Binding {
    kinds: Vec<ArgKind>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, dtype: DType) -> Self {
        self.kinds.push(ArgKind::Arg(Some(dtype)));
        self
    }

    pub fn any_arg(mut self) -> Self {
        self.kinds.push(ArgKind::Arg(None));
        self
    }

    pub fn ret(mut self, dtype: DType) -> Self {
        self.kinds.push(ArgKind::Ret(Some(dtype)));
        self
    }

    pub fn any_ret(mut self) -> Self {
        self.kinds.push(ArgKind::Ret(None));
        self
    }

    pub fn attr(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        self.kinds.push(ArgKind::Attr {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn ctx(mut self, kind: ContextKind) -> Self {
        self.kinds.push(ArgKind::Ctx(kind));
        self
    }

    pub fn remaining_args(mut self) -> Self {
        self.kinds.push(ArgKind::RemainingArgs);
        self
    }

    pub fn remaining_rets(mut self) -> Self {
        self.kinds.push(ArgKind::RemainingRets);
        self
    }

    pub fn kinds(&self) -> &[ArgKind] {
        &self.kinds
    }

    /// Declared number of inputs, or `None` when variadic.
    pub fn num_args(&self) -> Option<usize> {
        if self.kinds.contains(&ArgKind::RemainingArgs) {
            return None;
        }
        Some(self.kinds.iter().filter(|k| matches!(k, ArgKind::Arg(_))).count())
    }

    pub fn num_rets(&self) -> Option<usize> {
        if self.kinds.contains(&ArgKind::RemainingRets) {
            return None;
        }
        Some(self.kinds.iter().filter(|k| matches!(k, ArgKind::Ret(_))).count())
    }

    fn arg_types(&self) -> impl Iterator<Item = Option<DType>> + '_ {
        self.kinds.iter().filter_map(|k| match k {
            ArgKind::Arg(d) => Some(*d),
            _ => None,
        })
    }

    fn ret_types(&self) -> impl Iterator<Item = Option<DType>> + '_ {
        self.kinds.iter().filter_map(|k| match k {
            ArgKind::Ret(d) => Some(*d),
            _ => None,
        })
    }

    /// Every declared attribute must be present with the declared type.
    /// Extra attributes are allowed; handlers ignore what they do not read.
    pub fn validate_attrs(&self, attrs: &Attributes) -> Result<()> {
        for kind in &self.kinds {
            let ArgKind::Attr { name, ty } = kind else {
                continue;
            };
            let Some(attr) = attrs.get(name) else {
                return Err(invalid(format!("missing attribute '{name}' of type {ty}")));
            };
            if attr.ty() != *ty {
                return Err(invalid(format!(
                    "attribute '{name}' has type {}, binding declares {ty}",
                    attr.ty()
                )));
            }
        }
        Ok(())
    }

    /// Check input element types and result declarations against the
    /// binding. Shapes are not part of a binding.
    pub fn validate_buffers(&self, inputs: &[DType], results: &[ShapeDType]) -> Result<()> {
        check_list("input", self.arg_types(), self.num_args(), inputs)?;
        let result_types: Vec<DType> = results.iter().map(|r| r.dtype).collect();
        check_list("result", self.ret_types(), self.num_rets(), &result_types)
    }

    /// Result declarations alone, for call sites built before any input
    /// is known.
    pub fn validate_results(&self, results: &[ShapeDType]) -> Result<()> {
        let result_types: Vec<DType> = results.iter().map(|r| r.dtype).collect();
        check_list("result", self.ret_types(), self.num_rets(), &result_types)
    }

    pub fn validate_context(&self, ctx: &ExecutionContext) -> Result<()> {
        for kind in &self.kinds {
            match kind {
                ArgKind::Ctx(ContextKind::Stream) if ctx.stream().is_none() => {
                    return Err(invalid(format!(
                        "binding requires a stream but platform '{}' supplies none",
                        ctx.platform()
                    )));
                }
                ArgKind::Ctx(ContextKind::Scratch) if ctx.scratch().is_none() => {
                    return Err(invalid("binding requires a scratch allocator"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn check_list(
    what: &str,
    declared: impl Iterator<Item = Option<DType>>,
    count: Option<usize>,
    actual: &[DType],
) -> Result<()> {
    let declared: Vec<Option<DType>> = declared.collect();
    match count {
        Some(n) if n != actual.len() => {
            return Err(invalid(format!(
                "binding declares {n} {what} buffers, call has {}",
                actual.len()
            )));
        }
        None if actual.len() < declared.len() => {
            return Err(invalid(format!(
                "binding declares at least {} {what} buffers, call has {}",
                declared.len(),
                actual.len()
            )));
        }
        _ => {}
    }
    for (i, (want, have)) in declared.iter().zip(actual).enumerate() {
        if let Some(want) = want {
            if want != have {
                return Err(invalid(format!(
                    "{what} {i} has element type {have}, binding declares {want}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Platform;

    #[test]
    fn missing_and_mistyped_attrs() {
        let binding = Binding::new().attr("n", AttrType::I64);
        assert!(binding.validate_attrs(&Attributes::new()).is_err());
        assert!(binding
            .validate_attrs(&Attributes::new().with("n", 2.0f64))
            .is_err());
        binding
            .validate_attrs(&Attributes::new().with("n", 2i64).with("extra", true))
            .unwrap();
    }

    #[test]
    fn buffer_counts_and_types() {
        let binding = Binding::new().arg(DType::F32).any_arg().ret(DType::F32);
        let out = [ShapeDType::new(DType::F32, &[4])];
        binding
            .validate_buffers(&[DType::F32, DType::I64], &out)
            .unwrap();
        assert!(binding.validate_buffers(&[DType::F32], &out).is_err());
        assert!(binding
            .validate_buffers(&[DType::F64, DType::I64], &out)
            .is_err());
    }

    #[test]
    fn variadic_tail_accepts_extra_buffers() {
        let binding = Binding::new().arg(DType::I32).remaining_args().remaining_rets();
        assert_eq!(binding.num_args(), None);
        binding
            .validate_buffers(&[DType::I32, DType::F32, DType::F32], &[])
            .unwrap();
        assert!(binding.validate_buffers(&[], &[]).is_err());
    }

    #[test]
    fn stream_context_required() {
        let binding = Binding::new().ctx(ContextKind::Stream);
        let ctx = ExecutionContext::new(Platform::host());
        assert!(binding.validate_context(&ctx).is_err());
        Binding::new()
            .ctx(ContextKind::Platform)
            .validate_context(&ctx)
            .unwrap();
    }
}
