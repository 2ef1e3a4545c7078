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

//! Native handler ABI.
//!
//! A native handler receives one `XcallFrame*` and returns null on success
//! or an `XcallErrorRecord*` describing the failure. Stream handlers also
//! receive the platform stream handle as their first parameter. All layouts
//! here are `#[repr(C)]` and versioned by [`crate::frame::API_VERSION`];
//! fields are only ever appended, and `struct_size` lets a handler detect a
//! frame produced by an older bridge.
//!
//! Error records must be allocated by the bridge (see
//! [`XcallErrorRecord::new_boxed`] or `mind_xcall_error_new`) because the
//! bridge frees them after copying the category and message.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::sync::Arc;

use crate::attrs::{Attr, Attributes};
use crate::buffer::TypedBuffer;
use crate::error::{invalid, ErrorCategory, Result, XcallError};
use crate::frame::{CallFrame, ScratchAllocator};
use crate::types::{DType, Element};

pub type HostHandlerFn = unsafe extern "C" fn(frame: *mut XcallFrame) -> *mut XcallErrorRecord;
pub type StreamHandlerFn =
    unsafe extern "C" fn(stream: *mut c_void, frame: *mut XcallFrame) -> *mut XcallErrorRecord;

pub const ATTR_BOOL: u32 = 0;
pub const ATTR_I64: u32 = 1;
pub const ATTR_F64: u32 = 2;
pub const ATTR_STR: u32 = 3;
pub const ATTR_I64_ARRAY: u32 = 4;
pub const ATTR_F64_ARRAY: u32 = 5;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct XcallBuffer {
    pub dtype: u32,
    pub rank: u32,
    pub dims: *const i64,
    pub data: *mut c_void,
}

impl XcallBuffer {
    pub fn dtype(&self) -> Result<DType> {
        let tag = u8::try_from(self.dtype)
            .map_err(|_| XcallError::NotImplemented(format!("element type tag {}", self.dtype)))?;
        DType::from_tag(tag)
    }

    /// # Safety
    ///
    /// `dims` must point to `rank` readable values.
    pub unsafe fn dims(&self) -> &[i64] {
        if self.rank == 0 || self.dims.is_null() {
            return &[];
        }
        std::slice::from_raw_parts(self.dims, self.rank as usize)
    }

    /// View as a descriptor.
    ///
    /// # Safety
    ///
    /// The buffer must describe valid memory for `'a`, and writable buffers
    /// must not be aliased.
    pub unsafe fn to_typed<'a>(&self, writable: bool) -> Result<TypedBuffer<'a>> {
        let dtype = self.dtype()?;
        let dims = self
            .dims()
            .iter()
            .map(|&d| usize::try_from(d).map_err(|_| invalid(format!("negative dimension {d}"))))
            .collect::<Result<Vec<_>>>()?;
        TypedBuffer::from_raw_parts(dtype, dims, self.data as *mut u8, writable)
    }

    /// # Safety
    ///
    /// As for [`XcallBuffer::to_typed`].
    pub unsafe fn as_slice<'a, T: Element>(&self) -> Result<&'a [T]> {
        let buf = self.to_typed::<'a>(false)?;
        let len = buf.element_count();
        buf.typed::<T>()?;
        if len == 0 {
            return Ok(&[]);
        }
        Ok(std::slice::from_raw_parts(self.data as *const T, len))
    }

    /// # Safety
    ///
    /// As for [`XcallBuffer::to_typed`].
    pub unsafe fn as_mut_slice<'a, T: Element>(&mut self) -> Result<&'a mut [T]> {
        let mut buf = self.to_typed::<'a>(true)?;
        let len = buf.element_count();
        buf.typed_mut::<T>()?;
        if len == 0 {
            return Ok(&mut []);
        }
        Ok(std::slice::from_raw_parts_mut(self.data as *mut T, len))
    }
}

/// One named attribute. Scalars use `i64_value`/`f64_value` (booleans are
/// 0/1 in `i64_value`); strings and arrays use `ptr`/`len` (element count).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct XcallAttr {
    pub name: *const c_char,
    pub name_len: usize,
    pub kind: u32,
    pub i64_value: i64,
    pub f64_value: f64,
    pub ptr: *const c_void,
    pub len: usize,
}

impl XcallAttr {
    /// # Safety
    ///
    /// The pointers must be valid for the lengths recorded in the struct.
    pub unsafe fn name(&self) -> &str {
        let bytes = std::slice::from_raw_parts(self.name as *const u8, self.name_len);
        std::str::from_utf8(bytes).unwrap_or("")
    }

    /// # Safety
    ///
    /// As for [`XcallAttr::name`].
    pub unsafe fn value(&self) -> Result<Attr> {
        let attr = match self.kind {
            ATTR_BOOL => Attr::Bool(self.i64_value != 0),
            ATTR_I64 => Attr::I64(self.i64_value),
            ATTR_F64 => Attr::F64(self.f64_value),
            ATTR_STR => {
                let bytes = raw_slice(self.ptr as *const u8, self.len);
                Attr::Str(
                    std::str::from_utf8(bytes)
                        .map_err(|_| invalid("string attribute is not UTF-8"))?
                        .to_string(),
                )
            }
            ATTR_I64_ARRAY => Attr::I64Array(raw_slice(self.ptr as *const i64, self.len).to_vec()),
            ATTR_F64_ARRAY => Attr::F64Array(raw_slice(self.ptr as *const f64, self.len).to_vec()),
            other => {
                return Err(XcallError::NotImplemented(format!(
                    "attribute kind {other}"
                )))
            }
        };
        Ok(attr)
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if len == 0 || ptr.is_null() {
        return &[];
    }
    std::slice::from_raw_parts(ptr, len)
}

#[repr(C)]
#[derive(Debug)]
pub struct XcallFrame {
    pub struct_size: usize,
    pub api_version: u32,
    pub platform: *const c_char,
    pub stream: *mut c_void,
    pub args: *const XcallBuffer,
    pub num_args: usize,
    pub rets: *mut XcallBuffer,
    pub num_rets: usize,
    pub attrs: *const XcallAttr,
    pub num_attrs: usize,
    pub scratch: *const c_void,
}

impl XcallFrame {
    /// # Safety
    ///
    /// The frame must come from the bridge and be used only during the call.
    pub unsafe fn args(&self) -> &[XcallBuffer] {
        raw_slice(self.args, self.num_args)
    }

    /// # Safety
    ///
    /// As for [`XcallFrame::args`].
    pub unsafe fn rets(&mut self) -> &mut [XcallBuffer] {
        if self.num_rets == 0 || self.rets.is_null() {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.rets, self.num_rets)
    }

    /// # Safety
    ///
    /// As for [`XcallFrame::args`].
    pub unsafe fn platform(&self) -> &str {
        if self.platform.is_null() {
            return "";
        }
        CStr::from_ptr(self.platform).to_str().unwrap_or("")
    }

    /// # Safety
    ///
    /// As for [`XcallFrame::args`].
    pub unsafe fn attr(&self, name: &str) -> Option<&XcallAttr> {
        raw_slice(self.attrs, self.num_attrs)
            .iter()
            .find(|a| a.name() == name)
    }

    /// Decode every attribute.
    ///
    /// # Safety
    ///
    /// As for [`XcallFrame::args`].
    pub unsafe fn decode_attrs(&self) -> Result<Attributes> {
        let mut attrs = Attributes::new();
        for raw in raw_slice(self.attrs, self.num_attrs) {
            attrs.insert(raw.name(), raw.value()?);
        }
        Ok(attrs)
    }

    /// Allocate from the frame's scratch allocator, if one was supplied.
    ///
    /// # Safety
    ///
    /// As for [`XcallFrame::args`]. The memory is valid until the
    /// invocation completes.
    pub unsafe fn scratch_allocate(&self, size: usize, align: usize) -> Result<*mut u8> {
        if self.scratch.is_null() {
            return Err(invalid("frame has no scratch allocator"));
        }
        let scratch = &*(self.scratch as *const Arc<dyn ScratchAllocator>);
        Ok(scratch.allocate(size, align)?.as_ptr())
    }
}

/// Error reported by a native handler.
#[repr(C)]
#[derive(Debug)]
pub struct XcallErrorRecord {
    pub category: u32,
    pub message: *mut c_char,
}

impl XcallErrorRecord {
    /// Allocate a record the bridge knows how to free.
    pub fn new_boxed(category: ErrorCategory, message: &str) -> *mut XcallErrorRecord {
        let message = CString::new(message.replace('\0', " "))
            .unwrap_or_default()
            .into_raw();
        Box::into_raw(Box::new(XcallErrorRecord {
            category: category as u32,
            message,
        }))
    }

    pub fn from_error(err: &XcallError) -> *mut XcallErrorRecord {
        Self::new_boxed(err.category(), &err.message())
    }

    /// Copy out and free a record. Null means success.
    ///
    /// # Safety
    ///
    /// `record` must be null or come from [`XcallErrorRecord::new_boxed`]
    /// and not have been freed.
    pub unsafe fn take(record: *mut XcallErrorRecord) -> Option<(ErrorCategory, String)> {
        if record.is_null() {
            return None;
        }
        let record = Box::from_raw(record);
        let message = if record.message.is_null() {
            String::new()
        } else {
            CString::from_raw(record.message)
                .to_string_lossy()
                .into_owned()
        };
        Some((ErrorCategory::from_raw(record.category), message))
    }
}

/// Owner of the native view of one [`CallFrame`].
///
/// Holds the descriptor arrays and strings the raw frame points into. The
/// buffer memory itself stays with the `CallFrame`.
pub struct RawFrame {
    frame: Box<XcallFrame>,
    _args: Vec<XcallBuffer>,
    _rets: Vec<XcallBuffer>,
    _dims: Vec<Vec<i64>>,
    _attrs: Vec<XcallAttr>,
    _attr_storage: Vec<AttrStorage>,
    _platform: CString,
    _scratch: Option<Box<Arc<dyn ScratchAllocator>>>,
}

// SAFETY: the raw pointers reference storage owned by this struct or by the
// CallFrame it was built from, which the dispatcher keeps alive alongside.
unsafe impl Send for RawFrame {}

enum AttrStorage {
    Name(Box<[u8]>),
    Bytes(Box<[u8]>),
    I64s(Box<[i64]>),
    F64s(Box<[f64]>),
}

impl RawFrame {
    pub fn new(frame: &mut CallFrame<'_>, stream: *mut c_void) -> Result<Self> {
        let api_version = frame.api_version();
        let (inputs, results, attrs, ctx) = frame.parts_mut();
        let mut dims = Vec::with_capacity(inputs.len() + results.len());
        let mut describe = |buf: &TypedBuffer<'_>| {
            let d: Vec<i64> = buf.dims().iter().map(|&d| d as i64).collect();
            let raw = XcallBuffer {
                dtype: u32::from(buf.dtype().tag()),
                rank: buf.rank() as u32,
                dims: d.as_ptr(),
                data: buf.data_ptr() as *mut c_void,
            };
            dims.push(d);
            raw
        };
        let args: Vec<XcallBuffer> = inputs.iter().map(&mut describe).collect();
        let mut rets: Vec<XcallBuffer> = results.iter().map(|b| describe(b)).collect();

        let mut storage = Vec::new();
        let mut raw_attrs = Vec::with_capacity(attrs.len());
        for (name, attr) in attrs.iter() {
            let name_bytes: Box<[u8]> = name.as_bytes().into();
            let mut raw = XcallAttr {
                name: name_bytes.as_ptr() as *const c_char,
                name_len: name_bytes.len(),
                kind: ATTR_I64,
                i64_value: 0,
                f64_value: 0.0,
                ptr: ptr::null(),
                len: 0,
            };
            storage.push(AttrStorage::Name(name_bytes));
            match attr {
                Attr::Bool(v) => {
                    raw.kind = ATTR_BOOL;
                    raw.i64_value = i64::from(*v);
                }
                Attr::I64(v) => raw.i64_value = *v,
                Attr::F64(v) => {
                    raw.kind = ATTR_F64;
                    raw.f64_value = *v;
                }
                Attr::Str(s) => {
                    let bytes: Box<[u8]> = s.as_bytes().into();
                    raw.kind = ATTR_STR;
                    raw.ptr = bytes.as_ptr() as *const c_void;
                    raw.len = bytes.len();
                    storage.push(AttrStorage::Bytes(bytes));
                }
                Attr::I64Array(v) => {
                    let values: Box<[i64]> = v.as_slice().into();
                    raw.kind = ATTR_I64_ARRAY;
                    raw.ptr = values.as_ptr() as *const c_void;
                    raw.len = values.len();
                    storage.push(AttrStorage::I64s(values));
                }
                Attr::F64Array(v) => {
                    let values: Box<[f64]> = v.as_slice().into();
                    raw.kind = ATTR_F64_ARRAY;
                    raw.ptr = values.as_ptr() as *const c_void;
                    raw.len = values.len();
                    storage.push(AttrStorage::F64s(values));
                }
            }
            raw_attrs.push(raw);
        }

        let platform = CString::new(ctx.platform().as_str())
            .map_err(|_| invalid("platform name contains a NUL byte"))?;
        let scratch = ctx.scratch().map(|s| Box::new(Arc::clone(s)));
        let scratch_ptr = scratch
            .as_ref()
            .map_or(ptr::null(), |b| &**b as *const Arc<dyn ScratchAllocator> as *const c_void);

        let frame = Box::new(XcallFrame {
            struct_size: std::mem::size_of::<XcallFrame>(),
            api_version,
            platform: platform.as_ptr(),
            stream,
            args: args.as_ptr(),
            num_args: args.len(),
            rets: rets.as_mut_ptr(),
            num_rets: rets.len(),
            attrs: raw_attrs.as_ptr(),
            num_attrs: raw_attrs.len(),
            scratch: scratch_ptr,
        });
        Ok(Self {
            frame,
            _args: args,
            _rets: rets,
            _dims: dims,
            _attrs: raw_attrs,
            _attr_storage: storage,
            _platform: platform,
            _scratch: scratch,
        })
    }

    pub fn as_mut_ptr(&mut self) -> *mut XcallFrame {
        &mut *self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HostArray;
    use crate::frame::{build_frame, ExecutionContext};
    use crate::types::ShapeDType;

    #[test]
    fn error_records_roundtrip_and_free() {
        let record = XcallErrorRecord::new_boxed(ErrorCategory::OutOfRange, "index 7");
        let (cat, msg) = unsafe { XcallErrorRecord::take(record) }.unwrap();
        assert_eq!(cat, ErrorCategory::OutOfRange);
        assert_eq!(msg, "index 7");
        assert!(unsafe { XcallErrorRecord::take(ptr::null_mut()) }.is_none());
    }

    #[test]
    fn raw_frame_exposes_buffers_and_attrs() {
        let input = HostArray::from_slice(&[2], &[1.5f32, 2.5]).unwrap();
        let mut output = HostArray::zeros(DType::F32, &[2]).unwrap();
        let attrs = Attributes::new()
            .with("scale", 2.0f64)
            .with("mode", "fast")
            .with("axes", vec![0i64, 1]);
        let mut frame = build_frame(
            None,
            attrs.clone(),
            vec![input.view()],
            &[ShapeDType::new(DType::F32, &[2])],
            vec![output.view_mut()],
            ExecutionContext::host(),
        )
        .unwrap();
        let mut raw = RawFrame::new(&mut frame, ptr::null_mut()).unwrap();
        let xf = unsafe { &mut *raw.as_mut_ptr() };
        unsafe {
            assert_eq!(xf.platform(), "host");
            assert_eq!(xf.args()[0].as_slice::<f32>().unwrap(), &[1.5, 2.5]);
            assert_eq!(xf.attr("scale").unwrap().value().unwrap(), Attr::F64(2.0));
            assert_eq!(xf.decode_attrs().unwrap(), attrs);
            xf.rets()[0]
                .as_mut_slice::<f32>()
                .unwrap()
                .copy_from_slice(&[9.0, 8.0]);
            assert!(xf.scratch_allocate(8, 8).is_err());
        }
        drop(raw);
        drop(frame);
        assert_eq!(output.to_vec::<f32>().unwrap(), vec![9.0, 8.0]);
    }
}
