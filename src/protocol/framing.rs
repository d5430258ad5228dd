// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reassembly of stream reads into newline-terminated lines.

use tracing::{debug, warn};

/// Default upper bound for a single line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024;

/// Accumulates stream chunks and yields complete lines.
pub struct LineBuffer {
    buffer: Vec<u8>,
    max_line_length: usize,
    /// Skipping the rest of an overlong line up to its terminator.
    discarding: bool,
}

impl LineBuffer {
    /// Create a new line buffer.
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_line_length.min(4096)),
            max_line_length,
            discarding: false,
        }
    }

    /// Feed a chunk read from the stream.
    ///
    /// Returns every line completed by this chunk, without the terminator
    /// (`\n` or `\r\n`). Empty lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if self.discarding {
                if byte == b'\n' {
                    self.discarding = false;
                }
                continue;
            }

            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.buffer);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if !line.is_empty() {
                    lines.push(line);
                }
                continue;
            }

            if self.buffer.len() >= self.max_line_length {
                warn!(
                    "Discarding partial line longer than {} bytes",
                    self.max_line_length
                );
                self.buffer.clear();
                self.discarding = true;
                continue;
            }
            self.buffer.push(byte);
        }

        if !self.buffer.is_empty() {
            debug!("Holding {} bytes of partial line", self.buffer.len());
        }

        lines
    }

    /// Bytes of the pending, not yet terminated line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}
