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

//! Einsum-like sharding rules.
//!
//! ```text
//! rule     := values "->" values
//! values   := value ("," value)*
//! value    := ellipsis? dim*
//! ellipsis := "..." digits?
//! dim      := factor | "(" factor factor+ ")"
//! factor   := letter (letter | digit | "_")*
//! ```
//!
//! An empty side is a single scalar value. `...` stands for any number of
//! leading batching dimensions; `...1` names a second, independent group.
//! A parenthesised compound splits one dimension into several factors whose
//! sizes must be given unless the factor also appears as a whole dimension.
//!
//! # Example
//! ```
//! use mind_xcall::partition::ShardingRule;
//! let rule = ShardingRule::parse("... i k, k j -> ... i j").unwrap();
//! let mapping = rule.check_shapes(&[vec![2, 4, 8], vec![8, 3]], &[vec![2, 4, 3]]).unwrap();
//! assert_eq!(mapping.size("k"), Some(8));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use chumsky::prelude::*;

use crate::attrs::Attributes;
use crate::diagnostics::Diagnostic;
use crate::error::{invalid, Result, XcallError};
use crate::partition::hook::{LocalCall, PartitionHook, Partitioned};
use crate::partition::{Layout, Mesh};
use crate::types::ShapeDType;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimMapping {
    Factor(String),
    Compound(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ValueMapping {
    /// Batching group of a leading `...`, if any.
    pub batch_group: Option<u32>,
    pub dims: Vec<DimMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingRule {
    operands: Vec<ValueMapping>,
    results: Vec<ValueMapping>,
    factor_sizes: BTreeMap<String, usize>,
}

fn rule_parser(
) -> impl Parser<char, (Vec<ValueMapping>, Vec<ValueMapping>), Error = Simple<char>> {
    let word = filter::<_, _, Simple<char>>(|c: &char| c.is_ascii_alphanumeric() || *c == '_')
        .repeated()
        .at_least(1)
        .collect::<String>();
    let ellipsis = just("...")
        .ignore_then(
            filter(|c: &char| c.is_ascii_digit())
                .repeated()
                .collect::<String>(),
        )
        .try_map(|digits: String, span| {
            if digits.is_empty() {
                Ok(0)
            } else {
                digits
                    .parse::<u32>()
                    .map_err(|_| Simple::custom(span, "batching group number is too large"))
            }
        });

    let compound = word
        .clone()
        .padded()
        .repeated()
        .delimited_by(just('('), just(')'))
        .map(DimMapping::Compound);

    let dim = compound.or(word.map(DimMapping::Factor));
    let value = ellipsis
        .padded()
        .or_not()
        .then(dim.padded().repeated())
        .padded()
        .map(|(batch_group, dims)| ValueMapping { batch_group, dims });
    let side = value.separated_by(just(','));

    side.clone()
        .then_ignore(just("->"))
        .then(side)
        .then_ignore(end())
}

impl ShardingRule {
    pub fn parse(src: &str) -> Result<Self> {
        Self::with_sizes(src, std::iter::empty::<(String, usize)>())
    }

    /// Parse `src` and attach sizes for factors that only appear inside
    /// compounds.
    pub fn with_sizes<I, K>(src: &str, sizes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, usize)>,
        K: Into<String>,
    {
        let (operands, results) = match Self::parse_values(src) {
            Ok(values) => values,
            Err(diags) => {
                let rendered = diags
                    .first()
                    .map(|d| d.render(src))
                    .unwrap_or_else(|| "unparseable".to_string());
                return Err(invalid(format!("bad sharding rule '{src}'\n{rendered}")));
            }
        };
        check_names(operands.iter().chain(&results))?;
        let rule = Self {
            operands,
            results,
            factor_sizes: sizes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };
        rule.check_factor_sizes()?;
        tracing::debug!(rule = %rule, "sharding rule parsed");
        Ok(rule)
    }

    /// Parse only, reporting every syntax error with its position.
    pub fn parse_values(
        src: &str,
    ) -> std::result::Result<(Vec<ValueMapping>, Vec<ValueMapping>), Vec<Diagnostic>> {
        rule_parser().parse(src).map_err(|errs| {
            errs.into_iter()
                .map(|e| Diagnostic::from_parse_error(src, e))
                .collect()
        })
    }

    pub fn operands(&self) -> &[ValueMapping] {
        &self.operands
    }

    pub fn results(&self) -> &[ValueMapping] {
        &self.results
    }

    pub fn factor_sizes(&self) -> &BTreeMap<String, usize> {
        &self.factor_sizes
    }

    fn values(&self) -> impl Iterator<Item = &ValueMapping> {
        self.operands.iter().chain(&self.results)
    }

    /// Every named factor, with whether it appears as a whole dimension.
    fn named_factors(&self) -> BTreeMap<&str, bool> {
        let mut factors = BTreeMap::new();
        for value in self.values() {
            for dim in &value.dims {
                match dim {
                    DimMapping::Factor(f) => {
                        factors.insert(f.as_str(), true);
                    }
                    DimMapping::Compound(fs) => {
                        for f in fs {
                            factors.entry(f.as_str()).or_insert(false);
                        }
                    }
                }
            }
        }
        factors
    }

    pub fn contains_factor(&self, name: &str) -> bool {
        self.named_factors().contains_key(name)
    }

    fn check_factor_sizes(&self) -> Result<()> {
        let factors = self.named_factors();
        for name in self.factor_sizes.keys() {
            if !factors.contains_key(name.as_str()) {
                return Err(invalid(format!(
                    "factor {name} is not used in the rule, but size is provided"
                )));
            }
        }
        for (name, whole) in factors {
            match (whole, self.factor_sizes.contains_key(name)) {
                (false, false) => {
                    return Err(invalid(format!(
                        "factor {name} is only used in compound factors; must specify its size"
                    )))
                }
                (true, true) => {
                    return Err(invalid(format!(
                        "factor {name} represents a whole dimension; do not specify its size"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Expand `...` and index every factor, given operand ranks and,
    /// optionally, result ranks. Without result ranks, a result's batching
    /// rank is taken from the operands using the same group.
    pub fn expand(
        &self,
        operand_ranks: &[usize],
        result_ranks: Option<&[usize]>,
    ) -> Result<FactorMapping> {
        if operand_ranks.len() != self.operands.len() {
            return Err(invalid(format!(
                "sharding rule has {} operands, but the call has {}",
                self.operands.len(),
                operand_ranks.len()
            )));
        }
        if let Some(ranks) = result_ranks {
            if ranks.len() != self.results.len() {
                return Err(invalid(format!(
                    "sharding rule has {} results, but the call has {}",
                    self.results.len(),
                    ranks.len()
                )));
            }
        }

        let mut mapping = FactorMapping::default();
        let mut group_ranks: BTreeMap<u32, usize> = BTreeMap::new();
        for (i, value) in self.operands.iter().enumerate() {
            let dims = mapping.index_value(value, Some(operand_ranks[i]), &mut group_ranks, || {
                format!("operand {i}")
            })?;
            mapping.operands.push(dims);
        }
        for (i, value) in self.results.iter().enumerate() {
            let rank = result_ranks.map(|r| r[i]);
            let dims =
                mapping.index_value(value, rank, &mut group_ranks, || format!("result {i}"))?;
            mapping.results.push(dims);
        }
        mapping.sizes = vec![None; mapping.factors.len()];
        Ok(mapping)
    }

    /// Check the rule against concrete shapes and resolve every factor size.
    ///
    /// A whole-dimension factor seen with different sizes takes the smaller
    /// one; a batching dimension seen with different sizes is an error. The
    /// product of a compound's factors must equal the dimension it splits.
    pub fn check_shapes(
        &self,
        operand_shapes: &[Vec<usize>],
        result_shapes: &[Vec<usize>],
    ) -> Result<FactorMapping> {
        let operand_ranks: Vec<usize> = operand_shapes.iter().map(Vec::len).collect();
        let result_ranks: Vec<usize> = result_shapes.iter().map(Vec::len).collect();
        let mut mapping = self.expand(&operand_ranks, Some(&result_ranks))?;

        let shapes: Vec<&Vec<usize>> = operand_shapes.iter().chain(result_shapes).collect();
        let values: Vec<Vec<Vec<usize>>> = mapping
            .operands
            .iter()
            .chain(&mapping.results)
            .cloned()
            .collect();

        let mut seen = vec![false; mapping.factors.len()];
        for (dims, shape) in values.iter().zip(&shapes) {
            for (factors, &extent) in dims.iter().zip(shape.iter()) {
                if let [f] = factors.as_slice() {
                    mapping.merge_size(*f, Some(extent), &mut seen)?;
                } else {
                    for &f in factors {
                        let given = self.factor_sizes.get(&mapping.factors[f]).copied();
                        mapping.merge_size(f, given, &mut seen)?;
                    }
                }
            }
        }

        for (v, (dims, shape)) in values.iter().zip(&shapes).enumerate() {
            for (d, (factors, &extent)) in dims.iter().zip(shape.iter()).enumerate() {
                if factors.len() < 2 {
                    continue;
                }
                let mut product = 1usize;
                for &f in factors {
                    let size = mapping.sizes[f].ok_or_else(|| {
                        XcallError::Internal(format!("factor {} has no size", mapping.factors[f]))
                    })?;
                    product = product.checked_mul(size).ok_or_else(|| {
                        XcallError::OutOfRange(format!(
                            "compound sizes overflow at factor {}",
                            mapping.factors[f]
                        ))
                    })?;
                }
                if product != extent {
                    let names: Vec<&str> =
                        factors.iter().map(|&f| mapping.factors[f].as_str()).collect();
                    return Err(invalid(format!(
                        "{} dimension {d} has size {extent}, but compound ({}) has size {product}",
                        describe_value(v, self.operands.len()),
                        names.join(" ")
                    )));
                }
            }
        }
        Ok(mapping)
    }
}

/// Factor names start with a letter; compounds hold at least two factors.
fn check_names<'a>(values: impl Iterator<Item = &'a ValueMapping>) -> Result<()> {
    let check = |name: &str| {
        if name.starts_with(|c: char| c.is_ascii_alphabetic()) {
            Ok(())
        } else {
            Err(invalid(format!(
                "factor names have to start with a letter, but got '{name}'"
            )))
        }
    };
    for value in values {
        for dim in &value.dims {
            match dim {
                DimMapping::Factor(name) => check(name)?,
                DimMapping::Compound(names) if names.len() < 2 => {
                    return Err(invalid("brackets should contain at least two factors"))
                }
                DimMapping::Compound(names) => {
                    for name in names {
                        check(name)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn describe_value(index: usize, num_operands: usize) -> String {
    if index < num_operands {
        format!("operand {index}")
    } else {
        format!("result {}", index - num_operands)
    }
}

impl fmt::Display for ValueMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        match self.batch_group {
            Some(0) => parts.push("...".to_string()),
            Some(g) => parts.push(format!("...{g}")),
            None => {}
        }
        for dim in &self.dims {
            match dim {
                DimMapping::Factor(name) => parts.push(name.clone()),
                DimMapping::Compound(names) => parts.push(format!("({})", names.join(" "))),
            }
        }
        f.write_str(&parts.join(" "))
    }
}

impl fmt::Display for ShardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |values: &[ValueMapping]| {
            values
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "{} -> {}", side(&self.operands), side(&self.results))
    }
}

/// A rule expanded against concrete ranks: every dimension of every value
/// lists the indices of the factors it is made of.
///
/// Batching dimensions get synthetic factors named `?{group}_{i}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactorMapping {
    factors: Vec<String>,
    sizes: Vec<Option<usize>>,
    operands: Vec<Vec<Vec<usize>>>,
    results: Vec<Vec<Vec<usize>>>,
}

impl FactorMapping {
    pub fn factors(&self) -> &[String] {
        &self.factors
    }

    pub fn factor_index(&self, name: &str) -> Option<usize> {
        self.factors.iter().position(|f| f == name)
    }

    /// Resolved size of a factor; `None` before shapes are checked.
    pub fn size(&self, name: &str) -> Option<usize> {
        self.factor_index(name).and_then(|i| self.sizes[i])
    }

    pub fn operand(&self, index: usize) -> Option<&[Vec<usize>]> {
        self.operands.get(index).map(Vec::as_slice)
    }

    pub fn result(&self, index: usize) -> Option<&[Vec<usize>]> {
        self.results.get(index).map(Vec::as_slice)
    }

    pub fn result_ranks(&self) -> Vec<usize> {
        self.results.iter().map(Vec::len).collect()
    }

    /// A factor that appears on operands but on no result.
    pub fn is_reduction(&self, factor: usize) -> bool {
        let on = |values: &[Vec<Vec<usize>>]| {
            values
                .iter()
                .flatten()
                .any(|dim| dim.contains(&factor))
        };
        on(&self.operands) && !on(&self.results)
    }

    fn intern(&mut self, name: &str) -> usize {
        match self.factor_index(name) {
            Some(i) => i,
            None => {
                self.factors.push(name.to_string());
                self.factors.len() - 1
            }
        }
    }

    fn index_value(
        &mut self,
        value: &ValueMapping,
        rank: Option<usize>,
        group_ranks: &mut BTreeMap<u32, usize>,
        what: impl Fn() -> String,
    ) -> Result<Vec<Vec<usize>>> {
        let rule_rank = value.dims.len();
        let batch_rank = match (value.batch_group, rank) {
            (None, _) => 0,
            (Some(group), Some(rank)) => {
                let here = rank.saturating_sub(rule_rank);
                match group_ranks.get(&group) {
                    Some(&known) if known != here => {
                        return Err(invalid(format!(
                            "ellipsis represents different numbers of leading dimensions: {known} and {here}"
                        )))
                    }
                    Some(_) => {}
                    None => {
                        group_ranks.insert(group, here);
                    }
                }
                here
            }
            (Some(group), None) => *group_ranks.get(&group).ok_or_else(|| {
                invalid(format!(
                    "cannot infer the rank of {}: batching group {group} appears on no operand",
                    what()
                ))
            })?,
        };
        if let Some(rank) = rank {
            if rule_rank + batch_rank != rank {
                return Err(invalid(format!(
                    "sharding rule {} has rank {}, but the call's {} has rank {rank}",
                    what(),
                    rule_rank + batch_rank,
                    what()
                )));
            }
        }

        let group = value.batch_group.unwrap_or(0);
        let mut dims = Vec::with_capacity(rule_rank + batch_rank);
        for i in 0..batch_rank {
            dims.push(vec![self.intern(&format!("?{group}_{i}"))]);
        }
        for dim in &value.dims {
            match dim {
                DimMapping::Factor(name) => dims.push(vec![self.intern(name)]),
                DimMapping::Compound(names) => {
                    dims.push(names.iter().map(|n| self.intern(n)).collect());
                }
            }
        }
        Ok(dims)
    }

    fn merge_size(&mut self, factor: usize, size: Option<usize>, seen: &mut [bool]) -> Result<()> {
        if !seen[factor] {
            seen[factor] = true;
            self.sizes[factor] = size;
            return Ok(());
        }
        match (self.sizes[factor], size) {
            (Some(old), Some(new)) if old != new => {
                let name = &self.factors[factor];
                if let Some(batch) = name.strip_prefix('?') {
                    return Err(invalid(format!(
                        "batching dimension {batch} corresponds to two sizes: {old} and {new}"
                    )));
                }
                if new < old {
                    self.sizes[factor] = Some(new);
                }
            }
            (None, Some(new)) => self.sizes[factor] = Some(new),
            _ => {}
        }
        Ok(())
    }
}

/// Partition hook driven by a [`ShardingRule`].
///
/// Sharded operand dimensions assign their factor to the mesh axis. Factors
/// inside compounds, factors listed as needing replication, and factors whose
/// axis is already taken are gathered instead. A sharded factor that appears
/// on no result leaves every result partial along its axis.
#[derive(Debug, Clone)]
pub struct RulePartitioner {
    rule: ShardingRule,
    need_replication: BTreeSet<String>,
}

impl RulePartitioner {
    pub fn new(rule: ShardingRule) -> Self {
        Self {
            rule,
            need_replication: BTreeSet::new(),
        }
    }

    pub fn need_replication<I, S>(mut self, factors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.need_replication.extend(factors.into_iter().map(Into::into));
        self
    }

    pub fn rule(&self) -> &ShardingRule {
        &self.rule
    }

    fn layouts(&self, arg_layouts: &[Layout]) -> Result<(Vec<Layout>, Vec<Layout>)> {
        for name in &self.need_replication {
            if !self.rule.contains_factor(name) {
                return Err(invalid(format!(
                    "factor '{name}' needs replication but is not in rule {}",
                    self.rule
                )));
            }
        }
        let ranks: Vec<usize> = arg_layouts.iter().map(Layout::rank).collect();
        let mapping = self.rule.expand(&ranks, None)?;

        let mut axes: Vec<Option<String>> = vec![None; mapping.factors.len()];
        let mut taken = HashSet::new();
        for (i, layout) in arg_layouts.iter().enumerate() {
            let dims = mapping.operands[i].as_slice();
            for (d, factors) in dims.iter().enumerate() {
                let Some(axis) = layout.axis(d) else { continue };
                let [f] = factors.as_slice() else { continue };
                if self.need_replication.contains(&mapping.factors[*f]) {
                    continue;
                }
                if axes[*f].is_none() && !taken.contains(axis) {
                    taken.insert(axis.to_string());
                    axes[*f] = Some(axis.to_string());
                }
            }
        }

        let value_layout = |dims: &[Vec<usize>]| {
            let mut used = HashSet::new();
            Layout::new(
                dims.iter()
                    .map(|factors| match factors.as_slice() {
                        [f] => axes[*f].clone().filter(|a| used.insert(a.clone())),
                        _ => None,
                    })
                    .collect(),
            )
        };
        let args = mapping.operands.iter().map(|d| value_layout(d.as_slice())).collect();
        let partial: Vec<String> = (0..mapping.factors.len())
            .filter(|&f| mapping.is_reduction(f))
            .filter_map(|f| axes[f].clone())
            .collect();
        let results = mapping
            .results
            .iter()
            .map(|d| value_layout(d.as_slice()).with_partial(partial.iter().cloned()))
            .collect();
        Ok((args, results))
    }
}

impl PartitionHook for RulePartitioner {
    fn infer_result_layout(
        &self,
        _attrs: &Attributes,
        _mesh: &Mesh,
        arg_layouts: &[Layout],
    ) -> Result<Vec<Layout>> {
        Ok(self.layouts(arg_layouts)?.1)
    }

    fn partition(
        &self,
        _attrs: &Attributes,
        mesh: &Mesh,
        arg_layouts: &[Layout],
        _result_layouts: &[Layout],
        local: LocalCall,
    ) -> Result<Partitioned> {
        let (args, results) = self.layouts(arg_layouts)?;
        Ok(Partitioned {
            mesh: mesh.clone(),
            local_call: local,
            result_layouts: results,
            arg_layouts: args,
        })
    }

    fn check(&self, arg_specs: &[ShapeDType], result_specs: &[ShapeDType]) -> Result<()> {
        let dims = |specs: &[ShapeDType]| -> Result<Vec<Vec<usize>>> {
            specs.iter().map(ShapeDType::concrete_dims).collect()
        };
        self.rule.check_shapes(&dims(arg_specs)?, &dims(result_specs)?)?;
        Ok(())
    }
}
