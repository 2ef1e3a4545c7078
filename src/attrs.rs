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

//! Static attributes bound into a call at construction time.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{invalid, Result};
use crate::types::DType;

/// A statically known attribute value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Attr {
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    I64Array(Vec<i64>),
    F64Array(Vec<f64>),
}

/// Attribute type as declared by a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrType {
    Bool,
    I64,
    F64,
    Str,
    I64Array,
    F64Array,
}

impl AttrType {
    pub fn name(self) -> &'static str {
        match self {
            AttrType::Bool => "bool",
            AttrType::I64 => "i64",
            AttrType::F64 => "f64",
            AttrType::Str => "string",
            AttrType::I64Array => "i64[]",
            AttrType::F64Array => "f64[]",
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Attr {
    pub fn ty(&self) -> AttrType {
        match self {
            Attr::Bool(_) => AttrType::Bool,
            Attr::I64(_) => AttrType::I64,
            Attr::F64(_) => AttrType::F64,
            Attr::Str(_) => AttrType::Str,
            Attr::I64Array(_) => AttrType::I64Array,
            Attr::F64Array(_) => AttrType::F64Array,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Attr::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Attr::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attr::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attr::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64_array(&self) -> Option<&[i64]> {
        match self {
            Attr::I64Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64_array(&self) -> Option<&[f64]> {
        match self {
            Attr::F64Array(v) => Some(v),
            _ => None,
        }
    }

    /// Stable textual form used to key the pure-call cache.
    pub(crate) fn fingerprint(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = match self {
            Attr::Bool(v) => write!(out, "b{v}"),
            Attr::I64(v) => write!(out, "i{v}"),
            Attr::F64(v) => write!(out, "f{:016x}", v.to_bits()),
            Attr::Str(v) => write!(out, "s{}:{v}", v.len()),
            Attr::I64Array(v) => write!(out, "I{v:?}"),
            Attr::F64Array(v) => {
                let bits: Vec<u64> = v.iter().map(|x| x.to_bits()).collect();
                write!(out, "F{bits:x?}")
            }
        };
    }
}

macro_rules! attr_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Attr {
            fn from(v: $ty) -> Self {
                Attr::$variant(v.into())
            }
        }

        impl From<$ty> for AttrArg {
            fn from(v: $ty) -> Self {
                AttrArg::Static(Attr::$variant(v.into()))
            }
        })*
    };
}

attr_from! {
    bool => Bool,
    i64 => I64,
    i32 => I64,
    u32 => I64,
    f64 => F64,
    f32 => F64,
    String => Str,
    &str => Str,
    Vec<i64> => I64Array,
    Vec<f64> => F64Array,
}

/// An attribute argument as the frontend sees it at trace time.
///
/// A traced value is run-time array data; it may never be bound as an
/// attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrArg {
    Static(Attr),
    Traced { dtype: DType, dims: Vec<usize> },
}

impl From<Attr> for AttrArg {
    fn from(v: Attr) -> Self {
        AttrArg::Static(v)
    }
}

impl AttrArg {
    pub fn into_static(self, name: &str) -> Result<Attr> {
        match self {
            AttrArg::Static(attr) => Ok(attr),
            AttrArg::Traced { dtype, dims } => Err(invalid(format!(
                "attribute '{name}' received a traced {dtype}{dims:?} array; \
                 attributes must be static"
            ))),
        }
    }
}

/// Named attributes of one call, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Attr>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion of a static value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Attr>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Attr>) -> Option<Attr> {
        self.0.insert(name.into(), value.into())
    }

    /// Bind trace-time arguments, rejecting any traced value before a frame
    /// exists.
    pub fn from_args<I, K>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, AttrArg)>,
        K: Into<String>,
    {
        let mut out = BTreeMap::new();
        for (name, arg) in args {
            let name = name.into();
            let attr = arg.into_static(&name)?;
            out.insert(name, attr);
        }
        Ok(Self(out))
    }

    pub fn get(&self, name: &str) -> Option<&Attr> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Attr)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        self.typed(name, AttrType::I64, Attr::as_i64)
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        self.typed(name, AttrType::F64, Attr::as_f64)
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        self.typed(name, AttrType::Bool, Attr::as_bool)
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.typed(name, AttrType::Str, Attr::as_str)
    }

    pub fn i64_array(&self, name: &str) -> Result<&[i64]> {
        self.typed(name, AttrType::I64Array, Attr::as_i64_array)
    }

    fn typed<'a, T>(
        &'a self,
        name: &str,
        ty: AttrType,
        get: impl FnOnce(&'a Attr) -> Option<T>,
    ) -> Result<T> {
        let attr = self
            .get(name)
            .ok_or_else(|| invalid(format!("missing attribute '{name}'")))?;
        get(attr).ok_or_else(|| {
            invalid(format!(
                "attribute '{name}' has type {}, expected {ty}",
                attr.ty()
            ))
        })
    }

    /// Unambiguous text key: names are length-prefixed like string values.
    pub(crate) fn fingerprint(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = write!(out, "{};", self.0.len());
        for (name, attr) in &self.0 {
            let _ = write!(out, "{}:{name}=", name.len());
            attr.fingerprint(&mut out);
            out.push(';');
        }
        out
    }
}

impl<K: Into<String>, V: Into<Attr>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XcallError;

    #[test]
    fn traced_values_are_rejected() {
        let err = Attributes::from_args([
            ("axis", AttrArg::from(1i64)),
            (
                "scale",
                AttrArg::Traced {
                    dtype: DType::F32,
                    dims: vec![],
                },
            ),
        ])
        .unwrap_err();
        assert!(matches!(err, XcallError::InvalidArgument(ref m) if m.contains("scale")));
    }

    #[test]
    fn typed_getters_check_kind() {
        let attrs = Attributes::new().with("n", 3i64).with("mode", "fast");
        assert_eq!(attrs.i64("n").unwrap(), 3);
        assert_eq!(attrs.str("mode").unwrap(), "fast");
        assert!(attrs.f64("n").is_err());
        assert!(attrs.bool("missing").is_err());
    }

    #[test]
    fn fingerprint_distinguishes_kinds() {
        let a = Attributes::new().with("x", 1i64);
        let b = Attributes::new().with("x", 1.0f64);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), Attributes::new().with("x", 1i64).fingerprint());
    }

    #[test]
    fn fingerprint_is_not_fooled_by_separators_in_names() {
        let one = Attributes::new().with("a=i1;b", 2i64);
        let two = Attributes::new().with("a", 1i64).with("b", 2i64);
        assert_ne!(one.fingerprint(), two.fingerprint());
    }
}
