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

//! Handler registry keyed by `(target name, platform)`.
//!
//! The process-wide instance ([`Registry::global`]) starts empty and is
//! populated before first use; it is never torn down. Reads vastly
//! outnumber writes, so the table sits behind a reader-writer lock.
//!
//! # Example
//! ```
//! use mind_xcall::handler::Capsule;
//! use mind_xcall::registry::Registry;
//!
//! let registry = Registry::new();
//! registry.register("noop", "host", Capsule::from_fn(|_| Ok(()))).unwrap();
//! assert!(registry.resolve("noop", "cpu").is_ok());
//! assert!(registry.resolve("noop", "cuda").is_err());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::error::{Result, XcallError};
use crate::frame::Platform;
use crate::handler::Capsule;

/// A resolved registry entry.
#[derive(Debug, Clone)]
pub struct CallTarget {
    pub name: String,
    pub platform: Platform,
    pub capsule: Capsule,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Replace an existing entry instead of failing.
    pub replace: bool,
}

type Key = (String, Platform);

#[derive(Default)]
pub struct Registry {
    targets: RwLock<HashMap<Key, Arc<CallTarget>>>,
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    pub fn register(
        &self,
        name: &str,
        platform: impl Into<Platform>,
        capsule: Capsule,
    ) -> Result<()> {
        self.register_with(name, platform, capsule, RegisterOptions::default())
    }

    pub fn register_with(
        &self,
        name: &str,
        platform: impl Into<Platform>,
        capsule: Capsule,
        options: RegisterOptions,
    ) -> Result<()> {
        let platform = platform.into();
        let key = (name.to_string(), platform.clone());
        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        if targets.contains_key(&key) {
            if !options.replace {
                return Err(XcallError::AlreadyRegistered {
                    target: name.to_string(),
                    platform: platform.to_string(),
                });
            }
            tracing::warn!(target_name = name, %platform, "replacing registered handler");
        }
        tracing::debug!(
            target_name = name,
            %platform,
            signature = ?capsule.signature(),
            api_version = capsule.api_version(),
            "registered handler"
        );
        targets.insert(
            key,
            Arc::new(CallTarget {
                name: name.to_string(),
                platform,
                capsule,
            }),
        );
        Ok(())
    }

    /// Pure lookup; signatures are not checked.
    pub fn resolve(&self, name: &str, platform: impl Into<Platform>) -> Result<Arc<CallTarget>> {
        let platform = platform.into();
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
        targets
            .get(&(name.to_string(), platform.clone()))
            .cloned()
            .ok_or_else(|| XcallError::NotFound {
                target: name.to_string(),
                platform: platform.to_string(),
            })
    }

    pub fn contains(&self, name: &str, platform: impl Into<Platform>) -> bool {
        let key = (name.to_string(), platform.into());
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }

    /// Registered `(name, platform)` pairs, sorted.
    pub fn targets(&self) -> Vec<(String, Platform)> {
        let mut keys: Vec<_> = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Register into the process-wide registry with an explicit API version.
pub fn register_handler(
    name: &str,
    platform: &str,
    capsule: Capsule,
    api_version: u32,
) -> Result<()> {
    Registry::global().register(name, platform, capsule.with_api_version(api_version))
}
