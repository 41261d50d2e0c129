//! Stream framing: the segment table and its streaming parser.
//!
//! Layout: `u32le` segment count minus one, `u32le` size in words per
//! segment, a 4-byte pad when the count is odd (so bodies start on a word
//! boundary), then the bodies in order.

use crate::{WireError, WireResult, BYTES_PER_WORD, DEFAULT_MAX_SEGMENTS, DEFAULT_MAX_TOTAL_WORDS};

/// Bounds on what the parser accepts from a peer.
///
/// A malicious segment table could otherwise make the receiver commit to
/// unbounded buffering before the first body byte arrives.
#[derive(Debug, Clone, Copy)]
pub struct ReaderLimits {
    pub max_segments: u32,
    pub max_total_words: u64,
}

impl Default for ReaderLimits {
    fn default() -> Self {
        Self {
            max_segments: DEFAULT_MAX_SEGMENTS,
            max_total_words: DEFAULT_MAX_TOTAL_WORDS,
        }
    }
}

#[derive(Debug)]
enum State {
    // waiting for the first word: count-minus-one and the first size
    Header,
    // count known, waiting for the remaining size words incl. padding
    Sizes { seg_count: usize, first_len: usize },
    // sizes known, accumulating bodies
    Bodies { sizes: Vec<usize> },
}

/// Streaming message assembler.
///
/// Feed arbitrary chunks; whole messages fall out as soon as their last
/// body byte arrives, leftover bytes stay buffered for the next message.
#[derive(Debug)]
pub struct FrameParser {
    limits: ReaderLimits,
    state: State,
    buf: Vec<u8>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(ReaderLimits::default())
    }
}

impl FrameParser {
    pub fn new(limits: ReaderLimits) -> Self {
        Self {
            limits,
            state: State::Header,
            buf: Vec::new(),
        }
    }

    /// Bytes buffered but not yet part of a completed message.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Appends `chunk` and returns every message it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> WireResult<Vec<Vec<Vec<u8>>>> {
        self.buf.extend_from_slice(chunk);
        let mut complete = Vec::new();
        while let Some(message) = self.advance()? {
            complete.push(message);
        }
        Ok(complete)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn advance(&mut self) -> WireResult<Option<Vec<Vec<u8>>>> {
        loop {
            match &self.state {
                State::Header => {
                    if self.buf.len() < 8 {
                        return Ok(None);
                    }
                    let seg_count =
                        u32::from_le_bytes(self.buf[0..4].try_into().unwrap()).wrapping_add(1);
                    if seg_count == 0 {
                        return Err(WireError::Framing("too few segments: 0".to_string()));
                    }
                    if seg_count > self.limits.max_segments {
                        return Err(WireError::Framing(format!(
                            "too many segments: {seg_count}"
                        )));
                    }
                    let first_len =
                        u32::from_le_bytes(self.buf[4..8].try_into().unwrap()) as usize;
                    self.buf.drain(0..8);
                    self.state = State::Sizes {
                        seg_count: seg_count as usize,
                        first_len,
                    };
                }
                State::Sizes {
                    seg_count,
                    first_len,
                } => {
                    let (seg_count, first_len) = (*seg_count, *first_len);
                    // remaining sizes plus the pad that keeps bodies word-aligned
                    let rest = (seg_count - 1) * 4 + if seg_count % 2 == 0 { 4 } else { 0 };
                    if self.buf.len() < rest {
                        return Ok(None);
                    }
                    let mut sizes = Vec::with_capacity(seg_count);
                    sizes.push(first_len);
                    for idx in 0..seg_count - 1 {
                        sizes.push(u32::from_le_bytes(
                            self.buf[idx * 4..(idx + 1) * 4].try_into().unwrap(),
                        ) as usize);
                    }
                    let total_words: u64 = sizes.iter().map(|s| *s as u64).sum();
                    if total_words > self.limits.max_total_words {
                        return Err(WireError::Framing(format!(
                            "message of {total_words} words exceeds the {} word limit",
                            self.limits.max_total_words
                        )));
                    }
                    self.buf.drain(0..rest);
                    self.state = State::Bodies { sizes };
                }
                State::Bodies { sizes } => {
                    let total_bytes: usize = sizes.iter().map(|s| s * BYTES_PER_WORD).sum();
                    if self.buf.len() < total_bytes {
                        return Ok(None);
                    }
                    let sizes = sizes.clone();
                    let mut bodies = Vec::with_capacity(sizes.len());
                    let mut at = 0;
                    for size in &sizes {
                        let len = size * BYTES_PER_WORD;
                        bodies.push(self.buf[at..at + len].to_vec());
                        at += len;
                    }
                    self.buf.drain(0..total_bytes);
                    self.state = State::Header;
                    trace!(
                        "frame complete: {} segments, {total_bytes} body bytes, {} left over",
                        sizes.len(),
                        self.buf.len()
                    );
                    return Ok(Some(bodies));
                }
            }
        }
    }
}

/// Emits the segment table and bodies as one buffer.
///
/// Every segment must be word-aligned; the message is built fresh, never
/// rewritten in place.
pub fn emit_message(segments: &[&[u8]]) -> WireResult<Vec<u8>> {
    if segments.is_empty() {
        return Err(usage_err!("a message needs at least one segment"));
    }
    let mut out = Vec::new();
    let seg_count = segments.len();
    out.extend_from_slice(&(u32::try_from(seg_count).map_err(|_| usage_err!("segment count"))? - 1).to_le_bytes());
    for segment in segments {
        if segment.len() % BYTES_PER_WORD != 0 {
            return Err(usage_err!(
                "segment of {} bytes is not word-aligned",
                segment.len()
            ));
        }
        let words = u32::try_from(segment.len() / BYTES_PER_WORD)
            .map_err(|_| usage_err!("segment too long"))?;
        out.extend_from_slice(&words.to_le_bytes());
    }
    if seg_count % 2 == 0 {
        out.extend_from_slice(&[0; 4]);
    }
    for segment in segments {
        out.extend_from_slice(segment);
    }
    Ok(out)
}

// Byte length of the size section that follows the first header word.
fn sizes_section_len(seg_count: usize) -> usize {
    (seg_count - 1) * 4 + if seg_count % 2 == 0 { 4 } else { 0 }
}

// Parses and bounds-checks the segment count of the first header word.
fn parse_seg_count(first: [u8; 8], limits: ReaderLimits) -> WireResult<usize> {
    let seg_count = u32::from_le_bytes(first[0..4].try_into().unwrap()).wrapping_add(1);
    if seg_count == 0 {
        return Err(WireError::Framing("too few segments: 0".to_string()));
    }
    if seg_count > limits.max_segments {
        return Err(WireError::Framing(format!("too many segments: {seg_count}")));
    }
    Ok(seg_count as usize)
}

#[allow(clippy::cast_possible_truncation)]
fn check_and_split_header(
    first: [u8; 8],
    rest: &[u8],
    limits: ReaderLimits,
) -> WireResult<Vec<usize>> {
    let seg_count = parse_seg_count(first, limits)?;
    let mut sizes = Vec::with_capacity(seg_count);
    sizes.push(u32::from_le_bytes(first[4..8].try_into().unwrap()) as usize);
    for idx in 0..seg_count - 1 {
        sizes.push(u32::from_le_bytes(rest[idx * 4..(idx + 1) * 4].try_into().unwrap()) as usize);
    }
    let total_words: u64 = sizes.iter().map(|s| *s as u64).sum();
    if total_words > limits.max_total_words {
        return Err(WireError::Framing(format!(
            "message of {total_words} words exceeds the {} word limit",
            limits.max_total_words
        )));
    }
    Ok(sizes)
}

/// Reads exactly one message from `rdr`; `None` on a clean end of stream.
#[cfg(feature = "sync")]
pub fn read_message(
    rdr: &mut dyn std::io::Read,
    limits: ReaderLimits,
) -> WireResult<Option<Vec<Vec<u8>>>> {
    let mut first = [0_u8; 8];
    {
        let n = rdr.read(&mut first)?;
        if n == 0 {
            return Ok(None);
        }
        if n < 8 {
            rdr.read_exact(&mut first[n..])?;
        }
    }
    let seg_count = parse_seg_count(first, limits)?;
    let mut rest = vec![0_u8; sizes_section_len(seg_count)];
    rdr.read_exact(&mut rest)?;
    let sizes = check_and_split_header(first, &rest, limits)?;

    let mut bodies = Vec::with_capacity(sizes.len());
    for size in sizes {
        let mut body = vec![0_u8; size * BYTES_PER_WORD];
        rdr.read_exact(&mut body)?;
        bodies.push(body);
    }
    Ok(Some(bodies))
}

/// Writes header and bodies to `w` and flushes.
#[cfg(feature = "sync")]
pub fn write_message(w: &mut dyn std::io::Write, segments: &[&[u8]]) -> WireResult<()> {
    let bytes = emit_message(segments)?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

/// Reads exactly one message from an async reader; `None` on a clean EOF.
#[cfg(feature = "async")]
pub async fn read_message_async<R>(
    rdr: &mut R,
    limits: ReaderLimits,
) -> WireResult<Option<Vec<Vec<u8>>>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut first = [0_u8; 8];
    {
        let n = rdr.read(&mut first).await?;
        if n == 0 {
            return Ok(None);
        }
        if n < 8 {
            rdr.read_exact(&mut first[n..]).await?;
        }
    }
    let seg_count = parse_seg_count(first, limits)?;
    let mut rest = vec![0_u8; sizes_section_len(seg_count)];
    rdr.read_exact(&mut rest).await?;
    let sizes = check_and_split_header(first, &rest, limits)?;

    let mut bodies = Vec::with_capacity(sizes.len());
    for size in sizes {
        let mut body = vec![0_u8; size * BYTES_PER_WORD];
        rdr.read_exact(&mut body).await?;
        bodies.push(body);
    }
    Ok(Some(bodies))
}

/// Writes header and bodies to an async writer and flushes.
#[cfg(feature = "async")]
pub async fn write_message_async<W>(w: &mut W, segments: &[&[u8]]) -> WireResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let bytes = emit_message(segments)?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}
