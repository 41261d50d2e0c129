use crate::{WireResult, BYTES_PER_WORD, DEFAULT_FIRST_SEGMENT_WORDS};
use debug_ignore::DebugIgnore;
use std::sync::{Arc, Mutex};

/// Index of a segment within a message.
pub type SegmentId = u32;

/// Shared handle to the segment store of one message.
pub type AmSegments = Arc<Mutex<SegmentStore>>;

// One word-aligned buffer. `cap_words` is fixed at creation; allocation is
// bump-style within it. The buffer itself only ever grows.
#[derive(Debug)]
struct Segment {
    buf: DebugIgnore<Vec<u8>>,
    cap_words: u32,
}

impl Segment {
    fn with_capacity(cap_words: u32) -> Self {
        // eager reservation is capped; cap_words only bounds allocation
        let reserve = (cap_words as usize).min(4096) * BYTES_PER_WORD;
        Self {
            buf: DebugIgnore(Vec::with_capacity(reserve)),
            cap_words,
        }
    }

    fn from_bytes(bytes: Vec<u8>) -> Self {
        let cap_words = u32::try_from(bytes.len() / BYTES_PER_WORD).unwrap_or(u32::MAX);
        Self {
            buf: DebugIgnore(bytes),
            cap_words,
        }
    }

    fn len_words(&self) -> u32 {
        u32::try_from(self.buf.len() / BYTES_PER_WORD).unwrap_or(u32::MAX)
    }

    fn free_words(&self) -> u32 {
        self.cap_words - self.len_words()
    }
}

/// The single source of truth for the byte content of one message.
///
/// Readers obtain slices through [`SegmentStore::get`]; writers obtain
/// `(segment_id, word_offset)` tokens through [`SegmentStore::alloc`] and
/// patch bytes in place through [`SegmentStore::update`].
#[derive(Debug)]
pub struct SegmentStore {
    segments: Vec<Segment>,
    first_segment_words: u32,
    max_total_words: Option<u64>,
}

impl Default for SegmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentStore {
    /// An empty builder-side store with the default segment sizing.
    pub fn new() -> Self {
        Self::with_first_segment_words(DEFAULT_FIRST_SEGMENT_WORDS)
    }

    /// An empty builder-side store whose first segment holds `words` words.
    pub fn with_first_segment_words(words: u32) -> Self {
        Self {
            segments: Vec::new(),
            first_segment_words: words.max(1),
            max_total_words: None,
        }
    }

    /// Caps the total allocatable size; [`SegmentStore::alloc`] fails with
    /// `OutOfMemory` once the cap would be exceeded.
    pub fn set_max_total_words(&mut self, max: u64) {
        self.max_total_words = Some(max);
    }

    /// A reader-side store over received segment bodies.
    pub fn from_segments(bodies: Vec<Vec<u8>>) -> WireResult<Self> {
        for (id, body) in bodies.iter().enumerate() {
            if body.len() % BYTES_PER_WORD != 0 {
                return Err(usage_err!(
                    "segment {id} has non-word-aligned length {}",
                    body.len()
                ));
            }
        }
        Ok(Self {
            segments: bodies.into_iter().map(Segment::from_bytes).collect(),
            first_segment_words: DEFAULT_FIRST_SEGMENT_WORDS,
            max_total_words: None,
        })
    }

    /// Wraps a store into the shared handle used by [`Ref`](crate::Ref).
    pub fn into_shared(self) -> AmSegments {
        Arc::new(Mutex::new(self))
    }

    pub fn segment_count(&self) -> u32 {
        u32::try_from(self.segments.len()).unwrap_or(u32::MAX)
    }

    /// Current length of a segment, in words.
    pub fn segment_len(&self, seg: SegmentId) -> WireResult<u32> {
        Ok(self.segment(seg)?.len_words())
    }

    fn segment(&self, seg: SegmentId) -> WireResult<&Segment> {
        self.segments
            .get(seg as usize)
            .ok_or_else(|| bounds_err!("no segment with id {seg}"))
    }

    fn total_words(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.len_words())).sum()
    }

    /// Allocates `words` contiguous zeroed words and returns their location.
    ///
    /// Prefers `hint` if it has room, else the first segment with room, else
    /// creates a new segment with doubled capacity.
    pub fn alloc(&mut self, hint: SegmentId, words: u32) -> WireResult<(SegmentId, u32)> {
        if let Some(max) = self.max_total_words {
            if self.total_words() + u64::from(words) > max {
                return Err(crate::WireError::OutOfMemory);
            }
        }

        let chosen = match self.segments.get(hint as usize) {
            Some(seg) if seg.free_words() >= words => Some(hint),
            _ => self
                .segments
                .iter()
                .position(|seg| seg.free_words() >= words)
                .map(|idx| u32::try_from(idx).unwrap_or(u32::MAX)),
        };
        let id = match chosen {
            Some(id) => id,
            None => {
                let last_cap = self
                    .segments
                    .last()
                    .map_or(self.first_segment_words, |seg| seg.cap_words);
                let cap = words.max(last_cap.saturating_mul(2));
                self.segments.push(Segment::with_capacity(cap));
                trace!("alloc: created segment {} with {cap} words", self.segments.len() - 1);
                u32::try_from(self.segments.len() - 1).unwrap_or(u32::MAX)
            }
        };

        let seg = &mut self.segments[id as usize];
        let word_offset = seg.len_words();
        seg.buf.extend(std::iter::repeat(0).take(words as usize * BYTES_PER_WORD));
        trace!("alloc: {words} words at ({id}, {word_offset})");
        Ok((id, word_offset))
    }

    /// Allocates `words` zeroed words inside `seg` only; `None` when that
    /// segment has no room (no new segment is created).
    pub(crate) fn try_alloc_in(&mut self, seg: SegmentId, words: u32) -> WireResult<Option<u32>> {
        if let Some(max) = self.max_total_words {
            if self.total_words() + u64::from(words) > max {
                return Err(crate::WireError::OutOfMemory);
            }
        }
        let Some(segment) = self.segments.get_mut(seg as usize) else {
            return Ok(None);
        };
        if segment.free_words() < words {
            return Ok(None);
        }
        let word_offset = segment.len_words();
        segment
            .buf
            .extend(std::iter::repeat(0).take(words as usize * BYTES_PER_WORD));
        Ok(Some(word_offset))
    }

    /// A view of `words` words starting at `word_offset`.
    pub fn get(&self, seg: SegmentId, word_offset: u32, words: u32) -> WireResult<&[u8]> {
        let segment = self.segment(seg)?;
        let start = word_offset as usize * BYTES_PER_WORD;
        let end = start + words as usize * BYTES_PER_WORD;
        segment.buf.get(start..end).ok_or_else(|| {
            bounds_err!(
                "read of {words} words at ({seg}, {word_offset}) exceeds segment length {}",
                segment.len_words()
            )
        })
    }

    /// Overwrites bytes in place, starting at a word boundary. The range
    /// must lie within the segment.
    pub fn update(&mut self, seg: SegmentId, word_offset: u32, bytes: &[u8]) -> WireResult<()> {
        let len_words = self.segment(seg)?.len_words();
        let segment = &mut self.segments[seg as usize];
        let start = word_offset as usize * BYTES_PER_WORD;
        let end = start + bytes.len();
        match segment.buf.get_mut(start..end) {
            Some(window) => {
                window.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(bounds_err!(
                "write of {} bytes at ({seg}, {word_offset}) exceeds segment length {len_words}",
                bytes.len()
            )),
        }
    }

    /// The segment bodies in id order, for serialization.
    pub fn segments(&self) -> Vec<&[u8]> {
        self.segments.iter().map(|seg| &seg.buf[..]).collect()
    }

    /// Clones the segment bodies in id order.
    pub fn to_segment_vecs(&self) -> Vec<Vec<u8>> {
        self.segments.iter().map(|seg| seg.buf.to_vec()).collect()
    }
}
