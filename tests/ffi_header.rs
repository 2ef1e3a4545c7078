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

use mind_xcall::ffi::header::generate_header;

#[test]
fn header_contains_expected_symbols() {
    let header = generate_header();
    assert!(header.contains("} XcallFrame;"));
    assert!(header.contains("} XcallErrorRecord;"));
    assert!(header.contains("int mind_xcall_register("));
    assert!(header.contains("#define MIND_XCALL_API_VERSION 1u"));
}

#[cfg(feature = "ffi-c")]
mod capi {
    use std::ffi::{CStr, CString};

    use mind_xcall::abi::{XcallErrorRecord, XcallFrame};
    use mind_xcall::ffi::capi::*;
    use mind_xcall::prelude::*;

    unsafe extern "C" fn fill_ones(frame: *mut XcallFrame) -> *mut XcallErrorRecord {
        let frame = &mut *frame;
        match frame.rets()[0].as_mut_slice::<i32>() {
            Ok(out) => {
                out.fill(1);
                std::ptr::null_mut()
            }
            Err(err) => XcallErrorRecord::from_error(&err),
        }
    }

    #[test]
    fn registered_through_c_then_called_from_rust() {
        let name = CString::new("ffi_header_fill_ones").unwrap();
        let host = CString::new("host").unwrap();
        let rc = unsafe {
            mind_xcall_register(
                name.as_ptr(),
                host.as_ptr(),
                Some(fill_ones),
                mind_xcall_api_version(),
            )
        };
        assert_eq!(rc, 0);

        let site = CallSite::builder(
            "ffi_header_fill_ones",
            vec![ShapeDType::new(DType::I32, &[3])],
        )
        .config(BridgeConfig::default())
        .build()
        .unwrap();
        let out = site.call(&[], Attributes::new()).unwrap();
        assert_eq!(out[0].to_vec::<i32>().unwrap(), vec![1, 1, 1]);
    }

    #[test]
    fn bad_platform_string_is_reported() {
        let name = CString::new("ffi_header_bad").unwrap();
        let rc =
            unsafe { mind_xcall_register(name.as_ptr(), std::ptr::null(), Some(fill_ones), 1) };
        assert_eq!(rc, -1);
        let message = unsafe { CStr::from_ptr(mind_xcall_last_error()) };
        assert!(message.to_str().unwrap().contains("platform is null"));
    }
}
