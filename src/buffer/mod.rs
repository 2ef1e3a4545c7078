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

//! Buffer descriptors.
//!
//! A [`TypedBuffer`] describes one dense, row-major array crossing the
//! boundary: element type, dimensions, and a pointer to memory the bridge
//! does not own. [`HostArray`] is an owned host allocation that hands out
//! descriptors borrowing from it.

mod host;
mod wire;

use std::marker::PhantomData;
use std::ptr::NonNull;

pub use host::HostArray;
pub use wire::{decode, encode, WIRE_MAGIC, WIRE_VERSION};

use crate::error::{Result, XcallError};
use crate::types::{element_count, DType, Element, ShapeDType};

/// Descriptor of a dense array owned by someone else.
///
/// The lifetime ties the descriptor to the storage it points into. Buffers
/// built from foreign memory via [`TypedBuffer::from_raw_parts`] pick their
/// lifetime at construction and the caller vouches for it.
#[derive(Debug)]
pub struct TypedBuffer<'a> {
    dtype: DType,
    dims: Vec<usize>,
    data: NonNull<u8>,
    writable: bool,
    _marker: PhantomData<&'a mut [u8]>,
}

// SAFETY: a descriptor is a (pointer, length) pair with a lifetime. Moving it
// across threads is what stream-ordered execution requires; the storage
// contract is the same as for `&mut [u8]`.
unsafe impl Send for TypedBuffer<'_> {}
unsafe impl Sync for TypedBuffer<'_> {}

impl<'a> TypedBuffer<'a> {
    /// Describe foreign memory.
    ///
    /// # Safety
    ///
    /// `data` must point to at least `element_count(dims) * dtype.byte_width()`
    /// bytes that stay valid (and, when `writable`, exclusively accessible)
    /// for `'a`. A null pointer is accepted only when that byte count is zero.
    pub unsafe fn from_raw_parts(
        dtype: DType,
        dims: Vec<usize>,
        data: *mut u8,
        writable: bool,
    ) -> Result<Self> {
        let bytes = element_count(&dims) * dtype.byte_width();
        let data = match NonNull::new(data) {
            Some(ptr) => ptr,
            None if bytes == 0 => NonNull::dangling(),
            None => {
                return Err(XcallError::InvalidArgument(format!(
                    "null data pointer for {dtype}{dims:?} buffer of {bytes} bytes"
                )))
            }
        };
        Ok(Self {
            dtype,
            dims,
            data,
            writable,
            _marker: PhantomData,
        })
    }

    pub(crate) fn from_host(
        dtype: DType,
        dims: Vec<usize>,
        data: NonNull<u8>,
        writable: bool,
    ) -> Self {
        Self {
            dtype,
            dims,
            data,
            writable,
            _marker: PhantomData,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.dims)
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.byte_width()
    }

    /// True when the buffer holds no elements (some dimension is zero).
    ///
    /// Handlers should treat this as a distinguished empty case, not an
    /// error.
    pub fn is_empty(&self) -> bool {
        self.element_count() == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: construction guarantees `byte_len` valid bytes for 'a.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.byte_len()) }
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(XcallError::InvalidArgument(
                "attempt to write through a read-only buffer".into(),
            ));
        }
        let len = self.byte_len();
        // SAFETY: writable descriptors are built from exclusive borrows.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), len) })
    }

    /// View the elements as `T`, checking the element type and alignment.
    pub fn typed<T: Element>(&self) -> Result<&[T]> {
        self.check_dtype(T::DTYPE)?;
        if self.byte_len() == 0 {
            return Ok(&[]);
        }
        bytemuck::try_cast_slice(self.bytes()).map_err(|e| {
            XcallError::InvalidArgument(format!("cannot view buffer as {}: {e}", T::DTYPE))
        })
    }

    pub fn typed_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_dtype(T::DTYPE)?;
        let bytes = self.bytes_mut()?;
        if bytes.is_empty() {
            return Ok(&mut []);
        }
        bytemuck::try_cast_slice_mut(bytes).map_err(|e| {
            XcallError::InvalidArgument(format!("cannot view buffer as {}: {e}", T::DTYPE))
        })
    }

    /// True when the descriptor has exactly the declared type and shape.
    pub fn matches(&self, spec: &ShapeDType) -> bool {
        self.dtype == spec.dtype
            && self.dims.len() == spec.dims.len()
            && self
                .dims
                .iter()
                .zip(&spec.dims)
                .all(|(&have, &want)| want >= 0 && have as i64 == want)
    }

    pub fn shape_dtype(&self) -> ShapeDType {
        ShapeDType::from_dims(self.dtype, &self.dims)
    }

    /// Re-borrow as a read-only descriptor.
    pub fn reborrow(&self) -> TypedBuffer<'_> {
        TypedBuffer {
            dtype: self.dtype,
            dims: self.dims.clone(),
            data: self.data,
            writable: false,
            _marker: PhantomData,
        }
    }

    /// Re-borrow mutably, keeping write access.
    pub fn reborrow_mut(&mut self) -> TypedBuffer<'_> {
        TypedBuffer {
            dtype: self.dtype,
            dims: self.dims.clone(),
            data: self.data,
            writable: self.writable,
            _marker: PhantomData,
        }
    }

    /// Erase the borrow.
    ///
    /// # Safety
    ///
    /// The storage must outlive every use of the returned descriptor. The
    /// dispatch engine uses this only for stream work it waits on before the
    /// original borrow ends.
    pub(crate) unsafe fn into_static(self) -> TypedBuffer<'static> {
        TypedBuffer {
            dtype: self.dtype,
            dims: self.dims,
            data: self.data,
            writable: self.writable,
            _marker: PhantomData,
        }
    }

    fn check_dtype(&self, want: DType) -> Result<()> {
        if self.dtype != want {
            return Err(XcallError::InvalidArgument(format!(
                "buffer has element type {}, requested {}",
                self.dtype, want
            )));
        }
        Ok(())
    }
}
