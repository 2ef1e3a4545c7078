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

//! Caret diagnostics for sharding-rule strings.

use std::fmt;
use std::ops::Range;

/// Byte span in the rule source (inclusive start, exclusive end).
pub type Span = Range<usize>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub span: Span,
    /// 1-based column of `span.start`. Rules are single-line.
    pub col: usize,
}

impl Diagnostic {
    pub fn new(src: &str, message: impl Into<String>, span: Span) -> Self {
        let start = span.start.min(src.len());
        let col = src
            .get(..start)
            .map(|prefix| prefix.chars().count() + 1)
            .unwrap_or(start + 1);
        Self {
            message: message.into(),
            span,
            col,
        }
    }

    /// Construct from a chumsky `Simple` error.
    pub fn from_parse_error(src: &str, e: chumsky::error::Simple<char>) -> Self {
        let message = match e.reason() {
            chumsky::error::SimpleReason::Custom(msg) => msg.clone(),
            _ => e.to_string(),
        };
        Self::new(src, message, e.span())
    }

    /// Message, the offending line, and a caret underline.
    pub fn render(&self, src: &str) -> String {
        let line = src.lines().next().unwrap_or("");
        let caret_start = self.col.saturating_sub(1);
        let caret_len = self.span.end.saturating_sub(self.span.start).max(1);
        format!(
            "error: {}\n--> col {}\n{}\n{}{}",
            self.message,
            self.col,
            line,
            " ".repeat(caret_start),
            "^".repeat(caret_len)
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at col {}", self.message, self.col)
    }
}
