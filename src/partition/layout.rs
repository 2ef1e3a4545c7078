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

use std::collections::HashSet;
use std::fmt;

use crate::error::{invalid, Result};

/// Named grid of execution units. Devices are numbered row-major over the
/// axes in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mesh {
    axes: Vec<(String, usize)>,
}

impl Mesh {
    pub fn new(axes: &[(&str, usize)]) -> Result<Self> {
        let mut seen = HashSet::new();
        for &(name, size) in axes {
            if name.is_empty() {
                return Err(invalid("mesh axis names must be non-empty"));
            }
            if size == 0 {
                return Err(invalid(format!("mesh axis '{name}' has size 0")));
            }
            if !seen.insert(name) {
                return Err(invalid(format!("mesh axis '{name}' appears twice")));
            }
        }
        Ok(Self {
            axes: axes.iter().map(|&(n, s)| (n.to_string(), s)).collect(),
        })
    }

    pub fn axes(&self) -> impl Iterator<Item = (&str, usize)> {
        self.axes.iter().map(|(n, s)| (n.as_str(), *s))
    }

    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|(n, _)| n == name)
    }

    pub fn axis_size(&self, name: &str) -> Result<usize> {
        self.axes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
            .ok_or_else(|| invalid(format!("mesh has no axis '{name}'")))
    }

    pub fn num_devices(&self) -> usize {
        self.axes.iter().map(|(_, s)| s).product()
    }

    /// Coordinate of `device` along every axis.
    pub fn coords(&self, device: usize) -> Vec<usize> {
        let mut coords = vec![0; self.axes.len()];
        let mut rest = device;
        for (i, (_, size)) in self.axes.iter().enumerate().rev() {
            coords[i] = rest % size;
            rest /= size;
        }
        coords
    }

    pub fn coord(&self, device: usize, axis: &str) -> Result<usize> {
        let index = self
            .axis_index(axis)
            .ok_or_else(|| invalid(format!("mesh has no axis '{axis}'")))?;
        Ok(self.coords(device)[index])
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.axes.iter().map(|(n, s)| format!("{n}={s}")).collect();
        write!(f, "<{}>", parts.join(", "))
    }
}

/// How one array is laid out over a mesh.
///
/// Each dimension is either replicated (`None`) or split evenly along one
/// mesh axis. `partial` lists mesh axes over which each device holds a
/// partial sum that still has to be all-reduced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Layout {
    dims: Vec<Option<String>>,
    partial: Vec<String>,
}

impl Layout {
    pub fn replicated(rank: usize) -> Self {
        Self {
            dims: vec![None; rank],
            partial: Vec::new(),
        }
    }

    pub fn new(dims: Vec<Option<String>>) -> Self {
        Self {
            dims,
            partial: Vec::new(),
        }
    }

    /// `Layout::sharded(&[Some("data"), None])`
    pub fn sharded(dims: &[Option<&str>]) -> Self {
        Self::new(dims.iter().map(|d| d.map(str::to_string)).collect())
    }

    pub fn with_partial(mut self, axes: impl IntoIterator<Item = String>) -> Self {
        for axis in axes {
            if !self.partial.contains(&axis) {
                self.partial.push(axis);
            }
        }
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn axis(&self, dim: usize) -> Option<&str> {
        self.dims.get(dim).and_then(|d| d.as_deref())
    }

    pub fn dims(&self) -> &[Option<String>] {
        &self.dims
    }

    pub fn partial(&self) -> &[String] {
        &self.partial
    }

    pub fn without_partial(&self) -> Self {
        Self::new(self.dims.clone())
    }

    pub fn is_replicated(&self) -> bool {
        self.partial.is_empty() && self.dims.iter().all(Option::is_none)
    }

    /// Check the layout against a mesh and a global shape.
    pub fn validate(&self, mesh: &Mesh, global: &[usize]) -> Result<()> {
        if self.dims.len() != global.len() {
            return Err(invalid(format!(
                "layout {self} has rank {}, array has rank {}",
                self.dims.len(),
                global.len()
            )));
        }
        let mut used = HashSet::new();
        for (dim, axis) in self.dims.iter().enumerate() {
            let Some(axis) = axis else { continue };
            let size = mesh.axis_size(axis)?;
            if !used.insert(axis.as_str()) {
                return Err(invalid(format!("mesh axis '{axis}' used twice in {self}")));
            }
            if global[dim] % size != 0 {
                return Err(invalid(format!(
                    "dimension {dim} of size {} is not divisible by mesh axis '{axis}' of size {size}",
                    global[dim]
                )));
            }
        }
        for axis in &self.partial {
            mesh.axis_size(axis)?;
            if !used.insert(axis.as_str()) {
                return Err(invalid(format!("mesh axis '{axis}' used twice in {self}")));
            }
        }
        Ok(())
    }

    /// Shape of the block each device holds.
    pub fn local_dims(&self, mesh: &Mesh, global: &[usize]) -> Result<Vec<usize>> {
        global
            .iter()
            .enumerate()
            .map(|(dim, &size)| match self.axis(dim) {
                Some(axis) => Ok(size / mesh.axis_size(axis)?),
                None => Ok(size),
            })
            .collect()
    }

    /// Offset of `device`'s block within the global array.
    pub fn block_offsets(
        &self,
        mesh: &Mesh,
        device: usize,
        global: &[usize],
    ) -> Result<Vec<usize>> {
        let local = self.local_dims(mesh, global)?;
        (0..global.len())
            .map(|dim| match self.axis(dim) {
                Some(axis) => Ok(mesh.coord(device, axis)? * local[dim]),
                None => Ok(0),
            })
            .collect()
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<&str> = self.dims.iter().map(|d| d.as_deref().unwrap_or("-")).collect();
        write!(f, "[{}]", dims.join(", "))?;
        if !self.partial.is_empty() {
            write!(f, "{{partial: {}}}", self.partial.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_coords_are_row_major() {
        let mesh = Mesh::new(&[("data", 2), ("model", 3)]).unwrap();
        assert_eq!(mesh.num_devices(), 6);
        assert_eq!(mesh.coords(4), vec![1, 1]);
        assert_eq!(mesh.coord(5, "model").unwrap(), 2);
        assert!(Mesh::new(&[("x", 2), ("x", 2)]).is_err());
        assert!(Mesh::new(&[("x", 0)]).is_err());
    }

    #[test]
    fn local_blocks() {
        let mesh = Mesh::new(&[("data", 2)]).unwrap();
        let layout = Layout::sharded(&[Some("data"), None]);
        layout.validate(&mesh, &[4, 3]).unwrap();
        assert_eq!(layout.local_dims(&mesh, &[4, 3]).unwrap(), vec![2, 3]);
        assert_eq!(layout.block_offsets(&mesh, 1, &[4, 3]).unwrap(), vec![2, 0]);
        assert!(layout.validate(&mesh, &[3, 3]).is_err());
        assert!(Layout::sharded(&[Some("data"), Some("data")])
            .validate(&mesh, &[4, 4])
            .is_err());
    }

    #[test]
    fn display_marks_partial_axes() {
        let layout = Layout::sharded(&[None, Some("x")]).with_partial(["y".to_string()]);
        assert_eq!(layout.to_string(), "[-, x]{partial: y}");
        assert!(!layout.is_replicated());
        assert!(Layout::replicated(2).is_replicated());
    }
}
