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

//! Reverse-mode differentiation through a pair of foreign calls.
//!
//! The forward call returns the primal outputs followed by residuals, all in
//! one result tuple. The backward call receives the residuals followed by
//! one cotangent per primal output and returns one cotangent per input.
//! Forward mode and higher-order derivatives are not provided.

use crate::attrs::Attributes;
use crate::buffer::HostArray;
use crate::call::CallSite;
use crate::error::{invalid, Result, XcallError};
use crate::types::ShapeDType;

#[derive(Debug, Clone)]
pub struct CustomVjp {
    fwd: CallSite,
    bwd: CallSite,
    num_primal: usize,
}

impl CustomVjp {
    /// `num_primal` leading results of `fwd` are primal outputs; the rest
    /// are residuals.
    pub fn new(fwd: CallSite, bwd: CallSite, num_primal: usize) -> Result<Self> {
        let declared = fwd.result_specs().len();
        if num_primal == 0 || num_primal > declared {
            return Err(invalid(format!(
                "forward call '{}' declares {declared} results; {num_primal} primal outputs is out of range",
                fwd.target().name
            )));
        }
        Ok(Self {
            fwd,
            bwd,
            num_primal,
        })
    }

    pub fn primal_specs(&self) -> &[ShapeDType] {
        &self.fwd.result_specs()[..self.num_primal]
    }

    pub fn residual_specs(&self) -> &[ShapeDType] {
        &self.fwd.result_specs()[self.num_primal..]
    }

    /// Primal outputs only.
    pub fn call(&self, inputs: &[&HostArray], attrs: Attributes) -> Result<Vec<HostArray>> {
        let mut outputs = self.fwd.call(inputs, attrs)?;
        outputs.truncate(self.num_primal);
        Ok(outputs)
    }

    /// Primal outputs plus the pullback that maps output cotangents to
    /// input cotangents.
    pub fn vjp(
        &self,
        inputs: &[&HostArray],
        attrs: Attributes,
    ) -> Result<(Vec<HostArray>, Pullback)> {
        let input_specs: Vec<ShapeDType> = inputs
            .iter()
            .map(|a| ShapeDType::from_dims(a.dtype(), a.dims()))
            .collect();
        if self.bwd.result_specs() != input_specs.as_slice() {
            return Err(invalid(format!(
                "backward call '{}' produces {:?}, inputs are {:?}",
                self.bwd.target().name,
                self.bwd.result_specs(),
                input_specs
            )));
        }
        let mut outputs = self.fwd.call(inputs, attrs.clone())?;
        let residuals = outputs.split_off(self.num_primal);
        tracing::debug!(
            target_name = %self.fwd.target().name,
            residuals = residuals.len(),
            "forward pass recorded"
        );
        let pullback = Pullback {
            bwd: self.bwd.clone(),
            residuals,
            primal_specs: self.primal_specs().to_vec(),
            attrs,
        };
        Ok((outputs, pullback))
    }

    pub fn jvp(&self) -> Result<()> {
        Err(XcallError::NotImplemented(format!(
            "forward-mode differentiation of '{}' is not supported; only the custom VJP is defined",
            self.fwd.target().name
        )))
    }
}

/// Residuals of one forward pass, bound to the backward call.
#[derive(Debug, Clone)]
pub struct Pullback {
    bwd: CallSite,
    residuals: Vec<HostArray>,
    primal_specs: Vec<ShapeDType>,
    attrs: Attributes,
}

impl Pullback {
    pub fn residuals(&self) -> &[HostArray] {
        &self.residuals
    }

    pub fn apply(&self, cotangents: &[&HostArray]) -> Result<Vec<HostArray>> {
        if cotangents.len() != self.primal_specs.len() {
            return Err(invalid(format!(
                "{} cotangents for {} primal outputs",
                cotangents.len(),
                self.primal_specs.len()
            )));
        }
        for (i, (ct, spec)) in cotangents.iter().zip(&self.primal_specs).enumerate() {
            if ShapeDType::from_dims(ct.dtype(), ct.dims()) != *spec {
                return Err(invalid(format!(
                    "cotangent {i} is {}{:?}, primal output is {spec}",
                    ct.dtype(),
                    ct.dims()
                )));
            }
        }
        let args: Vec<&HostArray> =
            self.residuals.iter().chain(cotangents.iter().copied()).collect();
        self.bwd.call(&args, self.attrs.clone())
    }
}
