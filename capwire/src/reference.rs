use crate::{
    pointer::{encode_preamble, parse_preamble},
    schema::StructSize,
    util, AmSegments, RefKind, SegmentId, WireResult, BYTES_PER_WORD,
};

/// A pointer's location and resolved target.
///
/// `pos` is the word index of the pointer within `segment`; `-1` denotes a
/// synthetic ref (a far landing-pad tag or an inline-composite element) whose
/// content position is carried directly in `offset`. A `Ref` is immutable
/// except through the explicit write operations on its owning store.
#[derive(Debug, Clone)]
pub struct Ref {
    pub(crate) data: AmSegments,
    pub segment: SegmentId,
    pub pos: i32,
    pub offset: i32,
    pub kind: RefKind,
}

impl Ref {
    /// The null reference.
    pub fn null(data: &AmSegments) -> Self {
        Self {
            data: data.clone(),
            segment: 0,
            pos: -1,
            offset: 0,
            kind: RefKind::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, RefKind::Null)
    }

    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn synthetic(data: &AmSegments, segment: SegmentId, content_pos: u32, kind: RefKind) -> Self {
        Self {
            data: data.clone(),
            segment,
            pos: -1,
            offset: content_pos as i32,
            kind,
        }
    }

    fn word_at(data: &AmSegments, segment: SegmentId, pos: u32) -> WireResult<u64> {
        let store = data.lock()?;
        let bytes = store.get(segment, pos, 1)?;
        let mut word = [0_u8; BYTES_PER_WORD];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    /// Reads and decodes the pointer word at `(segment, pos)`.
    ///
    /// With `follow_far` set, far pointers are resolved through their landing
    /// pad; the pad itself is always parsed with far-following disabled.
    #[allow(clippy::cast_possible_wrap)]
    pub fn read_ref(
        data: &AmSegments,
        segment: SegmentId,
        pos: u32,
        follow_far: bool,
    ) -> WireResult<Self> {
        let word = Self::word_at(data, segment, pos)?;
        let (offset, kind) = parse_preamble(word)?;

        if let RefKind::Far {
            target_segment,
            double,
        } = kind
        {
            if follow_far {
                #[allow(clippy::cast_sign_loss)]
                let pad_pos = offset as u32;
                trace!("read_ref: far to ({target_segment}, {pad_pos}), double = {double}");
                let pad = Self::read_ref(data, target_segment, pad_pos, false)?;
                if !double {
                    return Ok(pad);
                }
                // Double-far: the pad is a far to the content, the following
                // word is a tag describing it.
                let RefKind::Far {
                    target_segment: content_segment,
                    double: false,
                } = pad.kind
                else {
                    return Err(malformed_err!(
                        "double-far landing pad at ({target_segment}, {pad_pos}) is not a single far"
                    ));
                };
                let tag_word = Self::word_at(data, target_segment, pad_pos + 1)?;
                let (_, tag_kind) = parse_preamble(tag_word)?;
                #[allow(clippy::cast_sign_loss)]
                let content_pos = pad.offset as u32;
                return Ok(Self::synthetic(data, content_segment, content_pos, tag_kind));
            }
        }

        Ok(Self {
            data: data.clone(),
            segment,
            pos: pos as i32,
            offset,
            kind,
        })
    }

    /// Reads the root pointer of a message.
    pub fn get_root(data: &AmSegments) -> WireResult<Self> {
        Self::read_ref(data, 0, 0, true)
    }

    /// Word index where this ref's content begins.
    pub(crate) fn content_pos(&self) -> WireResult<u32> {
        let pos = if self.pos < 0 {
            self.offset
        } else {
            self.pos + 1 + self.offset
        };
        u32::try_from(pos).map_err(|_| malformed_err!("pointer target before segment start"))
    }

    // ---------------------------------------------------------------
    // struct navigation
    // ---------------------------------------------------------------

    /// Slices `bit_len` bits at `bit_align` out of the struct's data section.
    ///
    /// Returns `default` when the window exceeds the data section (the
    /// schema-evolution path) or when the ref is not a struct.
    pub fn read_struct_data(&self, bit_align: u32, bit_len: u32, default: u64) -> u64 {
        let RefKind::Struct { data_words, .. } = self.kind else {
            return default;
        };
        if u64::from(bit_align) + u64::from(bit_len) > u64::from(data_words) * 64 {
            return default;
        }
        match self.read_data_bits(bit_align, bit_len) {
            Ok(bits) => bits,
            Err(e) => {
                warn!("read_struct_data: {e}");
                default
            }
        }
    }

    fn read_data_bits(&self, bit_align: u32, bit_len: u32) -> WireResult<u64> {
        let content = self.content_pos()?;
        let first_word = bit_align / 64;
        let last_word = (bit_align + bit_len.max(1) - 1) / 64;
        let store = self.data.lock()?;
        let bytes = store.get(self.segment, content + first_word, last_word - first_word + 1)?;
        Ok(util::read_bits(
            bytes,
            (bit_align - first_word * 64) as usize,
            bit_len,
        ))
    }

    /// Patches `bit_len` bits at `bit_align` of the struct's data section by
    /// read-modify-write of the enclosing word(s).
    pub fn write_struct_data(&self, bit_align: u32, bit_len: u32, value: u64) -> WireResult<()> {
        let RefKind::Struct { data_words, .. } = self.kind else {
            return Err(usage_err!("write_struct_data on {:?}", self.kind));
        };
        if u64::from(bit_align) + u64::from(bit_len) > u64::from(data_words) * 64 {
            return Err(usage_err!(
                "bit window {bit_align}+{bit_len} exceeds {data_words} data words"
            ));
        }
        let content = self.content_pos()?;
        let first_word = bit_align / 64;
        let last_word = (bit_align + bit_len.max(1) - 1) / 64;

        let mut store = self.data.lock()?;
        let mut window =
            store.get(self.segment, content + first_word, last_word - first_word + 1)?.to_vec();
        util::write_bits(
            &mut window,
            (bit_align - first_word * 64) as usize,
            bit_len,
            value,
        );
        store.update(self.segment, content + first_word, &window)
    }

    /// Word index of the `idx`-th pointer slot, if it exists.
    fn ptr_slot(&self, idx: u16) -> WireResult<Option<u32>> {
        let RefKind::Struct {
            data_words,
            ptr_words,
        } = self.kind
        else {
            return Ok(None);
        };
        if idx >= ptr_words {
            return Ok(None);
        }
        Ok(Some(
            self.content_pos()? + u32::from(data_words) + u32::from(idx),
        ))
    }

    /// Decodes the `idx`-th pointer of the struct; null when out of range.
    pub fn read_struct_ptr(&self, idx: u16) -> WireResult<Self> {
        match self.ptr_slot(idx)? {
            Some(slot) => Self::read_ref(&self.data, self.segment, slot, true),
            None => Ok(Self::null(&self.data)),
        }
    }

    /// The `idx`-th pointer slot as an undecoded ref, for writers.
    pub fn ptr(&self, idx: u16) -> WireResult<Self> {
        let slot = self
            .ptr_slot(idx)?
            .ok_or_else(|| usage_err!("pointer index {idx} out of range for {:?}", self.kind))?;
        #[allow(clippy::cast_possible_wrap)]
        let pos = slot as i32;
        Ok(Self {
            data: self.data.clone(),
            segment: self.segment,
            pos,
            offset: 0,
            kind: RefKind::Null,
        })
    }

    /// Emits `child`'s preamble into its slot, which must lie within this
    /// struct's pointer section.
    pub fn write_struct_ptr(&self, child: &Self) -> WireResult<()> {
        let RefKind::Struct {
            data_words,
            ptr_words,
        } = self.kind
        else {
            return Err(usage_err!("write_struct_ptr on {:?}", self.kind));
        };
        let window_start = self.content_pos()? + u32::from(data_words);
        let window_end = window_start + u32::from(ptr_words);
        let slot = u32::try_from(child.pos)
            .map_err(|_| usage_err!("child pointer has synthetic position"))?;
        if child.segment != self.segment || slot < window_start || slot >= window_end {
            return Err(usage_err!(
                "child pointer at ({}, {slot}) outside pointer window ({}, {window_start}..{window_end})",
                child.segment,
                self.segment
            ));
        }
        let word = encode_preamble(child.offset, child.kind);
        let mut store = self.data.lock()?;
        store.update(child.segment, slot, &word.to_le_bytes())
    }

    // ---------------------------------------------------------------
    // allocation
    // ---------------------------------------------------------------

    /// Allocates the root struct of a message: one pointer word followed by
    /// the struct's content, at the start of segment 0.
    pub fn alloc_root(data: &AmSegments, size: StructSize) -> WireResult<Self> {
        let words = 1 + u32::from(size.total_words());
        let (segment, pos) = {
            let mut store = data.lock()?;
            store.alloc(0, words)?
        };
        let kind = RefKind::Struct {
            data_words: size.data_words,
            ptr_words: size.ptr_words,
        };
        Self::write_raw_ptr(data, segment, pos, 0, kind)?;
        #[allow(clippy::cast_possible_wrap)]
        let pos = pos as i32;
        Ok(Self {
            data: data.clone(),
            segment,
            pos,
            offset: 0,
            kind,
        })
    }

    /// Allocates `words` content words and points `slot` at them. When the
    /// slot's segment has no room, pad and content go together into another
    /// segment and the slot gets a single-far to the pad.
    /// Returns `(segment, content_pos)`.
    pub(crate) fn alloc_behind_slot(
        data: &AmSegments,
        slot_segment: SegmentId,
        slot_pos: u32,
        words: u32,
        kind: RefKind,
    ) -> WireResult<(SegmentId, u32)> {
        let same_segment = {
            let mut store = data.lock()?;
            store.try_alloc_in(slot_segment, words)?
        };
        if let Some(content) = same_segment {
            let offset = i32::try_from(content)
                .map_err(|_| impl_err!("allocation beyond i32 words"))?
                - i32::try_from(slot_pos + 1).map_err(|_| impl_err!("slot beyond i32 words"))?;
            Self::write_raw_ptr(data, slot_segment, slot_pos, offset, kind)?;
            return Ok((slot_segment, content));
        }

        // Landing pad immediately before the content, in whichever segment
        // takes pad + content contiguously.
        let (segment, pad_pos) = {
            let mut store = data.lock()?;
            store.alloc(slot_segment, words + 1)?
        };
        let content = pad_pos + 1;
        Self::write_raw_ptr(data, segment, pad_pos, 0, kind)?;
        #[allow(clippy::cast_possible_wrap)]
        Self::write_raw_ptr(
            data,
            slot_segment,
            slot_pos,
            pad_pos as i32,
            RefKind::Far {
                target_segment: segment,
                double: false,
            },
        )?;
        Ok((segment, content))
    }

    pub(crate) fn write_raw_ptr(
        data: &AmSegments,
        segment: SegmentId,
        pos: u32,
        offset: i32,
        kind: RefKind,
    ) -> WireResult<()> {
        let word = encode_preamble(offset, kind);
        let mut store = data.lock()?;
        store.update(segment, pos, &word.to_le_bytes())
    }

    /// Allocates a child struct behind the `idx`-th pointer slot.
    pub fn init_struct(&self, idx: u16, size: StructSize) -> WireResult<Self> {
        let slot = self
            .ptr_slot(idx)?
            .ok_or_else(|| usage_err!("pointer index {idx} out of range for {:?}", self.kind))?;
        let kind = RefKind::Struct {
            data_words: size.data_words,
            ptr_words: size.ptr_words,
        };
        let (segment, content) =
            Self::alloc_behind_slot(&self.data, self.segment, slot, u32::from(size.total_words()), kind)?;
        Ok(Self::synthetic(&self.data, segment, content, kind))
    }

    /// Writes a capability pointer into the `idx`-th slot.
    pub fn set_cap(&self, idx: u16, cap_index: u32) -> WireResult<()> {
        let slot = self
            .ptr_slot(idx)?
            .ok_or_else(|| usage_err!("pointer index {idx} out of range for {:?}", self.kind))?;
        Self::write_raw_ptr(
            &self.data,
            self.segment,
            slot,
            0,
            RefKind::Interface { cap: cap_index },
        )
    }

    /// Clears the `idx`-th pointer slot back to null.
    pub fn clear_ptr(&self, idx: u16) -> WireResult<()> {
        let slot = self
            .ptr_slot(idx)?
            .ok_or_else(|| usage_err!("pointer index {idx} out of range for {:?}", self.kind))?;
        Self::write_raw_ptr(&self.data, self.segment, slot, 0, RefKind::Null)
    }

    pub(crate) fn shared_data(&self) -> AmSegments {
        self.data.clone()
    }
}

#[cfg(test)]
mod test {
    use super::Ref;
    use crate::{RefKind, SegmentStore, StructSize};

    #[test]
    fn root_struct_round_trip() {
        let data = SegmentStore::new().into_shared();
        let root = Ref::alloc_root(&data, StructSize::new(2, 1)).unwrap();
        root.write_struct_data(0, 32, 0xDEAD_BEEF).unwrap();
        root.write_struct_data(64, 16, 0x1234).unwrap();

        let back = Ref::get_root(&data).unwrap();
        assert_eq!(
            back.kind,
            RefKind::Struct {
                data_words: 2,
                ptr_words: 1
            }
        );
        assert_eq!(back.read_struct_data(0, 32, 0), 0xDEAD_BEEF);
        assert_eq!(back.read_struct_data(64, 16, 0), 0x1234);
    }

    #[test]
    fn out_of_range_field_reads_default() {
        let data = SegmentStore::new().into_shared();
        let root = Ref::alloc_root(&data, StructSize::new(1, 0)).unwrap();
        // field declared beyond the single data word
        assert_eq!(root.read_struct_data(64, 32, 77), 77);
        assert!(root.write_struct_data(64, 32, 1).is_err());
    }

    #[test]
    fn nested_struct_pointers() {
        let data = SegmentStore::new().into_shared();
        let root = Ref::alloc_root(&data, StructSize::new(1, 2)).unwrap();
        let child = root.init_struct(1, StructSize::new(1, 0)).unwrap();
        child.write_struct_data(0, 64, 42).unwrap();

        let back = Ref::get_root(&data).unwrap();
        assert!(back.read_struct_ptr(0).unwrap().is_null());
        let child_back = back.read_struct_ptr(1).unwrap();
        assert_eq!(child_back.read_struct_data(0, 64, 0), 42);
        // out-of-range pointer index reads as null
        assert!(back.read_struct_ptr(2).unwrap().is_null());
    }

    #[test]
    fn cross_segment_child_goes_through_far_pointer() {
        // Tiny first segment: the child cannot fit next to the root.
        let data = SegmentStore::with_first_segment_words(4).into_shared();
        let root = Ref::alloc_root(&data, StructSize::new(1, 1)).unwrap();
        let child = root.init_struct(0, StructSize::new(8, 0)).unwrap();
        assert_ne!(child.segment, root.segment);
        child.write_struct_data(7 * 64, 64, 99).unwrap();

        // the raw pointer word in segment 0 is a far pointer
        let raw = Ref::read_ref(&data, 0, 2, false).unwrap();
        assert!(matches!(raw.kind, RefKind::Far { double: false, .. }));

        // following resolves to the same content, twice over
        let resolved = Ref::get_root(&data).unwrap().read_struct_ptr(0).unwrap();
        assert_eq!(resolved.read_struct_data(7 * 64, 64, 0), 99);
        assert_eq!(resolved.segment, child.segment);
        assert_eq!(resolved.content_pos().unwrap(), child.content_pos().unwrap());
    }

    #[test]
    fn far_pointer_literal_scenario() {
        // far pointer `02 00 00 00 01 00 00 00` at segment 0 -> segment 1 offset 0
        let seg0 = vec![0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let mut seg1 = 12_u64.to_le_bytes().to_vec(); // struct pointer, offset 3
        seg1.extend_from_slice(&[0; 8 * 4]);
        let data = SegmentStore::from_segments(vec![seg0, seg1])
            .unwrap()
            .into_shared();
        let resolved = Ref::get_root(&data).unwrap();
        assert_eq!(resolved.segment, 1);
        assert_eq!(resolved.pos, 0);
        assert!(matches!(resolved.kind, RefKind::Struct { .. }));
    }

    #[test]
    fn write_struct_ptr_checks_the_window() {
        let data = SegmentStore::new().into_shared();
        let root = Ref::alloc_root(&data, StructSize::new(0, 1)).unwrap();
        let slot = root.ptr(0).unwrap();
        let child = Ref {
            kind: RefKind::Struct {
                data_words: 1,
                ptr_words: 0,
            },
            offset: 5,
            ..slot
        };
        root.write_struct_ptr(&child).unwrap();

        let outside = Ref {
            pos: 40,
            ..child.clone()
        };
        assert!(root.write_struct_ptr(&outside).is_err());
    }
}
