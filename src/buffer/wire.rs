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

//! Self-describing byte encoding of a buffer.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic    [u8; 4]   "MXCB"
//! version  u8
//! dtype    u8        element type tag
//! reserved u16       zero
//! rank     u32
//! dims     [u64; rank]
//! len      u64       payload length in bytes
//! payload  [u8; len] row-major elements
//! ```

use crate::error::{invalid, Result, XcallError};
use crate::types::DType;

use super::{HostArray, TypedBuffer};

pub const WIRE_MAGIC: [u8; 4] = *b"MXCB";
pub const WIRE_VERSION: u8 = 1;

const HEADER_LEN: usize = 12;

pub fn encode(buf: &TypedBuffer<'_>) -> Vec<u8> {
    let payload = buf.bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + 8 * buf.rank() + 8 + payload.len());
    out.extend_from_slice(&WIRE_MAGIC);
    out.push(WIRE_VERSION);
    out.push(buf.dtype().tag());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(buf.rank() as u32).to_le_bytes());
    for &d in buf.dims() {
        out.extend_from_slice(&(d as u64).to_le_bytes());
    }
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn decode(bytes: &[u8]) -> Result<HostArray> {
    let mut cursor = Cursor { bytes, pos: 0 };
    if cursor.take(4)? != WIRE_MAGIC {
        return Err(invalid("buffer encoding has a bad magic number"));
    }
    let version = cursor.take(1)?[0];
    if version != WIRE_VERSION {
        return Err(XcallError::NotImplemented(format!(
            "buffer encoding version {version}"
        )));
    }
    let dtype = DType::from_tag(cursor.take(1)?[0])?;
    cursor.take(2)?;
    let rank = cursor.u32()? as usize;
    let mut dims = Vec::with_capacity(rank.min(64));
    for _ in 0..rank {
        let d = cursor.u64()?;
        dims.push(usize::try_from(d).map_err(|_| {
            XcallError::OutOfRange(format!("dimension {d} does not fit this platform"))
        })?);
    }
    let len = cursor.u64()? as usize;
    let payload = cursor.take(len)?;
    if cursor.pos != bytes.len() {
        return Err(invalid(format!(
            "{} trailing bytes after encoded buffer",
            bytes.len() - cursor.pos
        )));
    }
    HostArray::from_bytes(dtype, &dims, payload)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| invalid("truncated buffer encoding"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_dtype_tag() {
        let arr = HostArray::from_slice(&[1], &[1.0f32]).unwrap();
        let mut bytes = encode(&arr.view());
        bytes[5] = 99;
        assert!(matches!(decode(&bytes), Err(XcallError::NotImplemented(_))));
    }

    #[test]
    fn rejects_truncation_and_trailing_bytes() {
        let arr = HostArray::from_slice(&[2], &[1i16, 2]).unwrap();
        let bytes = encode(&arr.view());
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(decode(&longer).is_err());
        assert_eq!(decode(&bytes).unwrap(), arr);
    }

    #[test]
    fn rejects_future_versions() {
        let arr = HostArray::scalar(1u8);
        let mut bytes = encode(&arr.view());
        bytes[4] = WIRE_VERSION + 1;
        assert!(matches!(decode(&bytes), Err(XcallError::NotImplemented(_))));
    }
}
