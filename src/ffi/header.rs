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

//! C header for native handler authors.

use std::fmt::Write;

use crate::abi::{ATTR_BOOL, ATTR_F64, ATTR_F64_ARRAY, ATTR_I64, ATTR_I64_ARRAY, ATTR_STR};
use crate::error::ErrorCategory;
use crate::frame::API_VERSION;
use crate::types::DType;

const PRELUDE: &str = r#"#ifndef MIND_XCALL_H
#define MIND_XCALL_H
#include <stddef.h>
#include <stdint.h>
#ifdef __cplusplus
extern "C" {
#endif
"#;

const BODY: &str = r#"
typedef struct {
    uint32_t dtype;
    uint32_t rank;
    const int64_t* dims;
    void* data;
} XcallBuffer;

typedef struct {
    const char* name;
    size_t name_len;
    uint32_t kind;
    int64_t i64_value;
    double f64_value;
    const void* ptr;
    size_t len;
} XcallAttr;

typedef struct {
    size_t struct_size;
    uint32_t api_version;
    const char* platform;
    void* stream;
    const XcallBuffer* args;
    size_t num_args;
    XcallBuffer* rets;
    size_t num_rets;
    const XcallAttr* attrs;
    size_t num_attrs;
    const void* scratch;
} XcallFrame;

typedef struct {
    uint32_t category;
    char* message;
} XcallErrorRecord;

/* Return NULL on success. */
typedef XcallErrorRecord* (*XcallHostHandler)(XcallFrame* frame);
typedef XcallErrorRecord* (*XcallStreamHandler)(void* stream, XcallFrame* frame);

uint32_t mind_xcall_api_version(void);
int mind_xcall_register(const char* name, const char* platform, XcallHostHandler handler, uint32_t api_version);
int mind_xcall_register_stream(const char* name, const char* platform, XcallStreamHandler handler, uint32_t api_version);
XcallErrorRecord* mind_xcall_error_new(uint32_t category, const char* message);
const char* mind_xcall_last_error(void);
uint32_t mind_xcall_last_error_category(void);

#ifdef __cplusplus
} // extern "C"
#endif
#endif
"#;

pub fn generate_header() -> String {
    let mut out = String::from(PRELUDE);
    let _ = writeln!(out, "\n#define MIND_XCALL_API_VERSION {API_VERSION}u\n");

    for dtype in DType::ALL {
        let _ = writeln!(
            out,
            "#define MIND_XCALL_DTYPE_{} {}",
            dtype.name().to_ascii_uppercase(),
            dtype.tag()
        );
    }
    out.push('\n');

    for raw in 0..=6u32 {
        let category = ErrorCategory::from_raw(raw);
        let _ = writeln!(
            out,
            "#define MIND_XCALL_ERROR_{} {raw}",
            category.as_str().replace(' ', "_").to_ascii_uppercase()
        );
    }
    out.push('\n');

    for (name, kind) in [
        ("BOOL", ATTR_BOOL),
        ("I64", ATTR_I64),
        ("F64", ATTR_F64),
        ("STR", ATTR_STR),
        ("I64_ARRAY", ATTR_I64_ARRAY),
        ("F64_ARRAY", ATTR_F64_ARRAY),
    ] {
        let _ = writeln!(out, "#define MIND_XCALL_ATTR_{name} {kind}");
    }

    out.push_str(BODY);
    out
}
