use crate::{SegmentId, WireResult};

// Kind bits, the low two bits of the offset half of a preamble.
const KIND_STRUCT: u32 = 0;
const KIND_LIST: u32 = 1;
const KIND_FAR: u32 = 2;
const KIND_CAP: u32 = 3;

/// Element layout of a list, with the on-wire codes 0..=7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemSize {
    Empty = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

impl ElemSize {
    pub(crate) fn from_code(code: u32) -> Self {
        match code & 7 {
            0 => Self::Empty,
            1 => Self::Bit,
            2 => Self::Byte,
            3 => Self::TwoBytes,
            4 => Self::FourBytes,
            5 => Self::EightBytes,
            6 => Self::Pointer,
            _ => Self::InlineComposite,
        }
    }

    /// Bits per element; `None` for `InlineComposite`, whose stride comes
    /// from the tag word. `Pointer` elements are one word wide.
    pub fn bit_width(self) -> Option<u32> {
        match self {
            Self::Empty => Some(0),
            Self::Bit => Some(1),
            Self::Byte => Some(8),
            Self::TwoBytes => Some(16),
            Self::FourBytes => Some(32),
            Self::EightBytes | Self::Pointer => Some(64),
            Self::InlineComposite => None,
        }
    }

    /// Body words needed for `count` elements of this layout.
    pub(crate) fn body_words(self, count: u32) -> u32 {
        match self.bit_width() {
            Some(bits) => {
                let total_bits = u64::from(bits) * u64::from(count);
                u32::try_from(total_bits.div_ceil(64)).unwrap_or(u32::MAX)
            }
            // for InlineComposite, callers account for tag + elements
            None => count,
        }
    }
}

/// Decoded target description of a pointer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Null,
    Struct {
        data_words: u16,
        ptr_words: u16,
    },
    /// For `InlineComposite`, `count` carries the total body words including
    /// the tag, exactly as on the wire; the element count lives in the tag.
    List {
        elem: ElemSize,
        count: u32,
    },
    Far {
        target_segment: SegmentId,
        double: bool,
    },
    Interface {
        cap: u32,
    },
}

/// Parses the 8-byte preamble. Returns the signed word offset (meaningless
/// for `Null`, pad-relative for `Far`, the cap index lives in the kind for
/// `Interface`) and the decoded kind.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn parse_preamble(word: u64) -> WireResult<(i32, RefKind)> {
    if word == 0 {
        return Ok((0, RefKind::Null));
    }
    let offset_and_kind = word as u32;
    let size = (word >> 32) as u32;

    #[allow(clippy::cast_possible_wrap)]
    let kind = match offset_and_kind & 3 {
        KIND_STRUCT => {
            let offset = (offset_and_kind as i32) >> 2;
            #[allow(clippy::cast_possible_truncation)]
            let kind = RefKind::Struct {
                data_words: size as u16,
                ptr_words: (size >> 16) as u16,
            };
            return Ok((offset, kind));
        }
        KIND_LIST => {
            let offset = (offset_and_kind as i32) >> 2;
            let kind = RefKind::List {
                elem: ElemSize::from_code(size & 7),
                count: size >> 3,
            };
            return Ok((offset, kind));
        }
        KIND_FAR => {
            let offset = i32::try_from(offset_and_kind >> 3)
                .map_err(|_| malformed_err!("far pointer offset out of range"))?;
            let kind = RefKind::Far {
                target_segment: size,
                double: offset_and_kind & 4 != 0,
            };
            return Ok((offset, kind));
        }
        _ => {
            // Capability pointer: all bits between the kind and the index
            // must be zero.
            if offset_and_kind >> 2 != 0 {
                return Err(malformed_err!(
                    "unexpected bits in kind-3 pointer: {offset_and_kind:#010x}"
                ));
            }
            RefKind::Interface { cap: size }
        }
    };
    Ok((0, kind))
}

/// Encodes a preamble; the exact inverse of [`parse_preamble`] for all
/// well-formed pointers.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn encode_preamble(offset: i32, kind: RefKind) -> u64 {
    match kind {
        RefKind::Null => 0,
        RefKind::Struct {
            data_words,
            ptr_words,
        } => {
            let low = ((offset << 2) as u32) | KIND_STRUCT;
            let high = u32::from(data_words) | (u32::from(ptr_words) << 16);
            u64::from(low) | (u64::from(high) << 32)
        }
        RefKind::List { elem, count } => {
            let low = ((offset << 2) as u32) | KIND_LIST;
            let high = (elem as u32) | (count << 3);
            u64::from(low) | (u64::from(high) << 32)
        }
        RefKind::Far {
            target_segment,
            double,
        } => {
            let low = ((offset as u32) << 3) | (u32::from(double) << 2) | KIND_FAR;
            u64::from(low) | (u64::from(target_segment) << 32)
        }
        RefKind::Interface { cap } => u64::from(KIND_CAP) | (u64::from(cap) << 32),
    }
}
