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

//! C surface of the bridge.
//!
//! [`header`] renders the declarations native handler authors compile
//! against. With the `ffi-c` feature, [`capi`] exports entry points for
//! libraries that register their own handlers. Every entry point returns
//! `0` on success and `-1` on failure; the failure is kept per thread and
//! read back through `mind_xcall_last_error` and
//! `mind_xcall_last_error_category`.

pub mod header;

#[cfg(feature = "ffi-c")]
pub mod capi {
    use std::cell::RefCell;
    use std::ffi::{CStr, CString};
    use std::os::raw::{c_char, c_int};
    use std::ptr;

    use crate::abi::{HostHandlerFn, StreamHandlerFn, XcallErrorRecord};
    use crate::error::{ErrorCategory, Result, XcallError};
    use crate::frame::API_VERSION;
    use crate::handler::Capsule;
    use crate::registry::register_handler;

    struct LastError {
        category: ErrorCategory,
        message: CString,
    }

    thread_local! {
        static LAST_ERROR: RefCell<Option<LastError>> = const { RefCell::new(None) };
    }

    fn write_error(err: &XcallError) -> c_int {
        let message = CString::new(err.to_string().replace('\0', " "))
            .unwrap_or_default();
        LAST_ERROR.with(|slot| {
            *slot.borrow_mut() = Some(LastError {
                category: err.category(),
                message,
            });
        });
        -1
    }

    fn clear_error() {
        LAST_ERROR.with(|slot| {
            slot.borrow_mut().take();
        });
    }

    fn report(outcome: Result<()>) -> c_int {
        match outcome {
            Ok(()) => 0,
            Err(err) => write_error(&err),
        }
    }

    unsafe fn str_arg<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
        if ptr.is_null() {
            return Err(XcallError::InvalidArgument(format!("{what} is null")));
        }
        CStr::from_ptr(ptr)
            .to_str()
            .map_err(|_| XcallError::InvalidArgument(format!("{what} is not valid UTF-8")))
    }

    #[no_mangle]
    pub extern "C" fn mind_xcall_api_version() -> u32 {
        API_VERSION
    }

    /// Register a host handler under `(name, platform)`.
    ///
    /// # Safety
    ///
    /// `name` and `platform` must be null or NUL-terminated strings.
    #[no_mangle]
    pub unsafe extern "C" fn mind_xcall_register(
        name: *const c_char,
        platform: *const c_char,
        handler: Option<HostHandlerFn>,
        api_version: u32,
    ) -> c_int {
        clear_error();
        report((|| {
            let name = str_arg(name, "name")?;
            let platform = str_arg(platform, "platform")?;
            let handler = handler
                .ok_or_else(|| XcallError::InvalidArgument("handler is null".into()))?;
            register_handler(name, platform, Capsule::host(handler), api_version)
        })())
    }

    /// Register a stream handler under `(name, platform)`.
    ///
    /// # Safety
    ///
    /// As for [`mind_xcall_register`].
    #[no_mangle]
    pub unsafe extern "C" fn mind_xcall_register_stream(
        name: *const c_char,
        platform: *const c_char,
        handler: Option<StreamHandlerFn>,
        api_version: u32,
    ) -> c_int {
        clear_error();
        report((|| {
            let name = str_arg(name, "name")?;
            let platform = str_arg(platform, "platform")?;
            let handler = handler
                .ok_or_else(|| XcallError::InvalidArgument("handler is null".into()))?;
            register_handler(name, platform, Capsule::stream(handler), api_version)
        })())
    }

    /// Allocate an error record for a handler to return.
    ///
    /// # Safety
    ///
    /// `message` must be null or a NUL-terminated string.
    #[no_mangle]
    pub unsafe extern "C" fn mind_xcall_error_new(
        category: u32,
        message: *const c_char,
    ) -> *mut XcallErrorRecord {
        let message = if message.is_null() {
            String::new()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        };
        XcallErrorRecord::new_boxed(ErrorCategory::from_raw(category), &message)
    }

    #[no_mangle]
    pub extern "C" fn mind_xcall_last_error() -> *const c_char {
        LAST_ERROR.with(|slot| match slot.borrow().as_ref() {
            Some(err) => err.message.as_ptr(),
            None => ptr::null(),
        })
    }

    /// Category of the last failure, `0` (unknown) when there is none.
    #[no_mangle]
    pub extern "C" fn mind_xcall_last_error_category() -> u32 {
        LAST_ERROR.with(|slot| {
            slot.borrow()
                .as_ref()
                .map_or(ErrorCategory::Unknown as u32, |err| err.category as u32)
        })
    }

    pub fn last_error_as_str() -> Option<String> {
        LAST_ERROR.with(|slot| {
            slot.borrow()
                .as_ref()
                .map(|err| err.message.to_string_lossy().into_owned())
        })
    }

}
