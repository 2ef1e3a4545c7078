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

//! Handler entry points and the capsules that carry them.

use std::ffi::CString;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use libloading::Library;

use crate::abi::{HostHandlerFn, StreamHandlerFn};
use crate::binding::Binding;
use crate::error::{invalid, Result, XcallError};
use crate::frame::{CallFrame, API_VERSION};

/// A handler written in Rust.
pub trait Handler: Send + Sync {
    fn call(&self, frame: &mut CallFrame<'_>) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&mut CallFrame<'_>) -> Result<()> + Send + Sync,
{
    fn call(&self, frame: &mut CallFrame<'_>) -> Result<()> {
        self(frame)
    }
}

/// How a handler is entered.
#[derive(Clone)]
pub enum EntryPoint {
    /// `XcallErrorRecord* f(XcallFrame*)`
    Host(HostHandlerFn),
    /// `XcallErrorRecord* f(void* stream, XcallFrame*)`
    Stream(StreamHandlerFn),
    Rust(Arc<dyn Handler>),
}

impl EntryPoint {
    pub fn rust(handler: impl Handler + 'static) -> Self {
        EntryPoint::Rust(Arc::new(handler))
    }

    pub fn signature(&self) -> Signature {
        match self {
            EntryPoint::Host(_) => Signature::Host,
            EntryPoint::Stream(_) => Signature::Stream,
            EntryPoint::Rust(_) => Signature::Rust,
        }
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Host(p) => write!(f, "Host({:p})", *p as *const ()),
            EntryPoint::Stream(p) => write!(f, "Stream({:p})", *p as *const ()),
            EntryPoint::Rust(_) => f.write_str("Rust(..)"),
        }
    }
}

/// Signature tag carried by a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signature {
    Host,
    Stream,
    Rust,
}

/// Opaque handle around a handler entry point.
///
/// The capsule records the signature the entry point was declared with, the
/// API version it was compiled against, and optionally the library it was
/// loaded from; holding the capsule keeps that library mapped.
#[derive(Clone)]
pub struct Capsule {
    entry: EntryPoint,
    api_version: u32,
    binding: Option<Binding>,
    origin: Option<Arc<NativeLibrary>>,
}

impl Capsule {
    pub fn new(entry: EntryPoint, api_version: u32) -> Self {
        Self {
            entry,
            api_version,
            binding: None,
            origin: None,
        }
    }

    pub fn host(f: HostHandlerFn) -> Self {
        Self::new(EntryPoint::Host(f), API_VERSION)
    }

    pub fn stream(f: StreamHandlerFn) -> Self {
        Self::new(EntryPoint::Stream(f), API_VERSION)
    }

    pub fn rust(handler: impl Handler + 'static) -> Self {
        Self::new(EntryPoint::rust(handler), API_VERSION)
    }

    /// Wrap a closure; the bound lets closure signatures be inferred.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut CallFrame<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::rust(f)
    }

    /// Attach binding metadata used for static validation.
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn with_api_version(mut self, version: u32) -> Self {
        self.api_version = version;
        self
    }

    pub fn entry(&self) -> &EntryPoint {
        &self.entry
    }

    pub fn signature(&self) -> Signature {
        self.entry.signature()
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_ref().map(|lib| lib.path())
    }
}

impl fmt::Debug for Capsule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capsule")
            .field("entry", &self.entry)
            .field("api_version", &self.api_version)
            .field("binding", &self.binding.is_some())
            .field("origin", &self.origin())
            .finish()
    }
}

/// A shared library that exports handlers.
pub struct NativeLibrary {
    library: Library,
    path: std::path::PathBuf,
}

impl NativeLibrary {
    /// Load a shared library.
    ///
    /// # Safety
    ///
    /// Loading runs the library's initialisers; the library must be
    /// trusted.
    pub unsafe fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let library = Library::new(path).map_err(|e| {
            XcallError::NotFound {
                target: format!("{} ({e})", path.display()),
                platform: String::new(),
            }
        })?;
        tracing::debug!(path = %path.display(), "loaded handler library");
        Ok(Arc::new(Self {
            library,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up an exported handler and wrap it in a capsule.
    ///
    /// # Safety
    ///
    /// The symbol must have the signature named by `signature`.
    pub unsafe fn capsule(
        self: &Arc<Self>,
        symbol: &str,
        signature: Signature,
        api_version: u32,
    ) -> Result<Capsule> {
        let name =
            CString::new(symbol).map_err(|_| invalid(format!("bad symbol name '{symbol}'")))?;
        let lookup_err = |e: libloading::Error| XcallError::NotFound {
            target: format!("{symbol} in {} ({e})", self.path.display()),
            platform: String::new(),
        };
        let entry = match signature {
            Signature::Host => {
                let f = self
                    .library
                    .get::<HostHandlerFn>(name.as_bytes_with_nul())
                    .map_err(lookup_err)?;
                EntryPoint::Host(*f)
            }
            Signature::Stream => {
                let f = self
                    .library
                    .get::<StreamHandlerFn>(name.as_bytes_with_nul())
                    .map_err(lookup_err)?;
                EntryPoint::Stream(*f)
            }
            Signature::Rust => {
                return Err(invalid("Rust handlers cannot be loaded from a library"));
            }
        };
        Ok(Capsule {
            entry,
            api_version,
            binding: None,
            origin: Some(Arc::clone(self)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{XcallErrorRecord, XcallFrame};

    unsafe extern "C" fn noop(_frame: *mut XcallFrame) -> *mut XcallErrorRecord {
        std::ptr::null_mut()
    }

    #[test]
    fn capsules_record_signature() {
        assert_eq!(Capsule::host(noop).signature(), Signature::Host);
        let rust = Capsule::from_fn(|_| Ok(())).with_api_version(3);
        assert_eq!(rust.signature(), Signature::Rust);
        assert_eq!(rust.api_version(), 3);
        assert!(rust.origin().is_none());
    }

    #[test]
    fn missing_library_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = unsafe { NativeLibrary::load(dir.path().join("libmissing.so")) }
            .err()
            .unwrap();
        assert!(matches!(err, XcallError::NotFound { .. }));
    }
}
