//! Shell output buffer with fence-based incremental reads.

use std::borrow::Cow;

use tracing::debug;

use perfkit_core::ShellSettings;

/// Append-only shell output with a bounded retained window.
///
/// `fence` counts every byte ever appended and survives [`ShellBuffer::clear`],
/// so a reader holding an old fence never re-reads data it has already seen.
/// Once the retained window grows past the high-water mark the head is
/// trimmed down to the low-water mark.
#[derive(Debug)]
pub struct ShellBuffer {
    data: Vec<u8>,
    fence: u64,
    fresh: bool,
    high_water: usize,
    low_water: usize,
}

/// Result of [`ShellBuffer::read_since`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellRead<'a> {
    /// Unread bytes still retained
    pub bytes: &'a [u8],
    /// Fence to pass to the next read
    pub fence: u64,
    /// Unread bytes that were trimmed before this read
    pub skipped: u64,
}

impl ShellRead<'_> {
    /// Bytes as text, replacing invalid UTF-8 sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.bytes)
    }
}

impl ShellBuffer {
    /// Create a buffer with the default water marks.
    pub fn new() -> Self {
        Self::with_settings(&ShellSettings::default())
    }

    /// Create a buffer with custom water marks.
    pub fn with_settings(settings: &ShellSettings) -> Self {
        Self {
            data: Vec::new(),
            fence: 0,
            fresh: false,
            high_water: settings.high_water_bytes,
            low_water: settings.low_water_bytes.min(settings.high_water_bytes),
        }
    }

    /// Append output, bump the fence and set the fresh latch.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.data.extend_from_slice(bytes);
        self.fence += bytes.len() as u64;
        self.fresh = true;

        if self.data.len() > self.high_water {
            let excess = self.data.len() - self.low_water;
            self.data.drain(..excess);
            debug!(
                "Trimmed shell buffer: dropped={} retained={} fence={}",
                excess,
                self.data.len(),
                self.fence
            );
        }
    }

    /// Everything appended after `fence` that is still retained.
    pub fn read_since(&self, fence: u64) -> ShellRead<'_> {
        let unread = self.fence.saturating_sub(fence);
        let available = unread.min(self.data.len() as u64);
        let start = self.data.len() - available as usize;
        ShellRead {
            bytes: &self.data[start..],
            fence: self.fence,
            skipped: unread - available,
        }
    }

    /// Test-and-clear the fresh latch.
    pub fn take_fresh(&mut self) -> bool {
        std::mem::take(&mut self.fresh)
    }

    /// Total bytes ever appended.
    pub fn fence(&self) -> u64 {
        self.fence
    }

    /// Retained bytes.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Retained byte count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop retained output. The fence is kept.
    pub fn clear(&mut self) {
        self.data.clear();
        self.fresh = false;
    }
}

impl Default for ShellBuffer {
    fn default() -> Self {
        Self::new()
    }
}
