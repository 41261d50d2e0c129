use capwire::{ReaderLimits, DEFAULT_FIRST_SEGMENT_WORDS};
use std::time::Duration;

/// Tunables of one session.
#[derive(Debug, Clone, Copy)]
pub struct VatConfiguration {
    reader_limits: ReaderLimits,
    first_segment_words: u32,
    default_wait_timeout: Option<Duration>,
}

impl Default for VatConfiguration {
    fn default() -> Self {
        Self {
            reader_limits: ReaderLimits::default(),
            first_segment_words: DEFAULT_FIRST_SEGMENT_WORDS,
            default_wait_timeout: None,
        }
    }
}

impl VatConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds on inbound message framing.
    pub fn with_reader_limits(mut self, limits: ReaderLimits) -> Self {
        self.reader_limits = limits;
        self
    }

    /// First-segment sizing of outbound message builders.
    pub fn with_first_segment_words(mut self, words: u32) -> Self {
        self.first_segment_words = words.max(1);
        self
    }

    /// Timeout applied by `wait` when the caller does not pass one.
    pub fn with_default_wait_timeout(mut self, timeout: Duration) -> Self {
        self.default_wait_timeout = Some(timeout);
        self
    }

    pub fn reader_limits(&self) -> ReaderLimits {
        self.reader_limits
    }

    pub fn first_segment_words(&self) -> u32 {
        self.first_segment_words
    }

    pub fn default_wait_timeout(&self) -> Option<Duration> {
        self.default_wait_timeout
    }
}
