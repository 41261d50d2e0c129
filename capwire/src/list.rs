use crate::{
    pointer::{encode_preamble, parse_preamble},
    schema::StructSize,
    util, ElemSize, Ref, RefKind, WireResult, BYTES_PER_WORD,
};

/// One decoded list element.
#[derive(Debug, Clone)]
pub enum ElemView {
    /// An `Empty` element; carries no bits.
    Blank,
    /// A fixed-width primitive element, widened to 64 bits.
    Bits(u64),
    /// A `Pointer` element, decoded (far pointers followed).
    Ptr(Ref),
    /// An inline-composite element, as a synthetic struct ref.
    Struct(Ref),
}

// Bit lists are byte-big-endian: element 0 occupies bit 7 of byte 0.
fn bit_list_align(index: u32) -> u32 {
    (index / 8) * 8 + (7 - index % 8)
}

impl Ref {
    /// Number of elements in the list.
    ///
    /// For inline-composite lists this is the element count from the tag,
    /// not the word count of the pointer.
    pub fn list_elem_count(&self) -> WireResult<u32> {
        match self.kind {
            RefKind::Null => Ok(0),
            RefKind::List {
                elem: ElemSize::InlineComposite,
                ..
            } => Ok(self.composite_layout()?.0),
            RefKind::List { count, .. } => Ok(count),
            _ => Err(usage_err!("list_elem_count on {:?}", self.kind)),
        }
    }

    // Parses the tag word: (element count, element struct size).
    pub(crate) fn composite_layout(&self) -> WireResult<(u32, StructSize)> {
        let content = self.content_pos()?;
        let tag_word = {
            let store = self.data.lock()?;
            let bytes = store.get(self.segment, content, 1)?;
            let mut word = [0_u8; BYTES_PER_WORD];
            word.copy_from_slice(bytes);
            u64::from_le_bytes(word)
        };
        let (elem_count, tag_kind) = parse_preamble(tag_word)?;
        let RefKind::Struct {
            data_words,
            ptr_words,
        } = tag_kind
        else {
            return Err(malformed_err!(
                "inline-composite tag is {tag_kind:?}, expected a struct preamble"
            ));
        };
        let elem_count = u32::try_from(elem_count)
            .map_err(|_| malformed_err!("negative element count in composite tag"))?;
        Ok((elem_count, StructSize::new(data_words, ptr_words)))
    }

    /// Decodes the `index`-th element.
    pub fn list_elem(&self, index: u32) -> WireResult<ElemView> {
        let RefKind::List { elem, count } = self.kind else {
            return Err(usage_err!("list_elem on {:?}", self.kind));
        };
        let content = self.content_pos()?;
        match elem {
            ElemSize::Empty => {
                if index >= count {
                    return Err(bounds_err!("element {index} of {count}"));
                }
                Ok(ElemView::Blank)
            }
            ElemSize::InlineComposite => {
                let (elem_count, size) = self.composite_layout()?;
                if index >= elem_count {
                    return Err(bounds_err!("element {index} of {elem_count}"));
                }
                let stride = u32::from(size.total_words());
                let elem_pos = content + 1 + index * stride;
                let kind = RefKind::Struct {
                    data_words: size.data_words,
                    ptr_words: size.ptr_words,
                };
                Ok(ElemView::Struct(Self::synthetic(
                    &self.data, self.segment, elem_pos, kind,
                )))
            }
            ElemSize::Pointer => {
                if index >= count {
                    return Err(bounds_err!("element {index} of {count}"));
                }
                Ok(ElemView::Ptr(Self::read_ref(
                    &self.data,
                    self.segment,
                    content + index,
                    true,
                )?))
            }
            _ => Ok(ElemView::Bits(self.read_list_data(index)?)),
        }
    }

    /// All elements of the list in order; empty for a null ref.
    pub fn read_list(&self) -> WireResult<Vec<ElemView>> {
        if self.is_null() {
            return Ok(Vec::new());
        }
        let count = self.list_elem_count()?;
        (0..count).map(|i| self.list_elem(i)).collect()
    }

    fn primitive_window(&self, index: u32) -> WireResult<(u32, u32, u32)> {
        let RefKind::List { elem, count } = self.kind else {
            return Err(usage_err!("primitive list access on {:?}", self.kind));
        };
        if index >= count {
            return Err(bounds_err!("element {index} of {count}"));
        }
        let width = elem
            .bit_width()
            .filter(|w| *w > 0 && *w <= 64 && elem != ElemSize::Pointer)
            .ok_or_else(|| usage_err!("data access on {elem:?} list"))?;
        let bit_align = match elem {
            ElemSize::Bit => bit_list_align(index),
            _ => index * width,
        };
        Ok((bit_align / 64, bit_align % 64, width))
    }

    /// Reads the `index`-th element of a fixed-width list, widened to u64.
    pub fn read_list_data(&self, index: u32) -> WireResult<u64> {
        let (word, in_word, width) = self.primitive_window(index)?;
        let content = self.content_pos()?;
        let store = self.data.lock()?;
        let bytes = store.get(self.segment, content + word, 1)?;
        Ok(util::read_bits(bytes, in_word as usize, width))
    }

    /// Read-modify-writes the `index`-th element's bit window.
    pub fn write_list_data(&self, index: u32, value: u64) -> WireResult<()> {
        let (word, in_word, width) = self.primitive_window(index)?;
        let content = self.content_pos()?;
        let mut store = self.data.lock()?;
        let mut window = store.get(self.segment, content + word, 1)?.to_vec();
        util::write_bits(&mut window, in_word as usize, width, value);
        store.update(self.segment, content + word, &window)
    }

    // ---------------------------------------------------------------
    // allocation
    // ---------------------------------------------------------------

    /// Allocates a fixed-width or pointer list behind the `idx`-th pointer
    /// slot of this struct.
    pub fn init_list(&self, idx: u16, elem: ElemSize, count: u32) -> WireResult<Self> {
        if elem == ElemSize::InlineComposite {
            return Err(usage_err!("init_list cannot build composite lists"));
        }
        let slot = self.require_ptr_slot(idx)?;
        let kind = RefKind::List { elem, count };
        let words = elem.body_words(count);
        let (segment, content) =
            Self::alloc_behind_slot(&self.data, self.segment, slot, words, kind)?;
        Ok(Self::synthetic(&self.data, segment, content, kind))
    }

    /// Allocates an inline-composite list: a tag word followed by
    /// `count * size.total_words()` element words.
    pub fn init_struct_list(&self, idx: u16, count: u32, size: StructSize) -> WireResult<Self> {
        let slot = self.require_ptr_slot(idx)?;
        let body_words = count * u32::from(size.total_words());
        let kind = RefKind::List {
            elem: ElemSize::InlineComposite,
            count: body_words,
        };
        let (segment, content) =
            Self::alloc_behind_slot(&self.data, self.segment, slot, body_words + 1, kind)?;
        #[allow(clippy::cast_possible_wrap)]
        let tag = encode_preamble(
            count as i32,
            RefKind::Struct {
                data_words: size.data_words,
                ptr_words: size.ptr_words,
            },
        );
        {
            let mut store = self.data.lock()?;
            store.update(segment, content, &tag.to_le_bytes())?;
        }
        Ok(Self::synthetic(&self.data, segment, content, kind))
    }

    pub(crate) fn require_ptr_slot(&self, idx: u16) -> WireResult<u32> {
        let RefKind::Struct {
            data_words,
            ptr_words,
        } = self.kind
        else {
            return Err(usage_err!("pointer slot on {:?}", self.kind));
        };
        if idx >= ptr_words {
            return Err(usage_err!("pointer index {idx} out of range ({ptr_words})"));
        }
        Ok(self.content_pos()? + u32::from(data_words) + u32::from(idx))
    }

    // ---------------------------------------------------------------
    // text and data
    // ---------------------------------------------------------------

    /// Writes `text` as a byte list with a trailing NUL (not part of the
    /// user-visible length) behind the `idx`-th pointer slot.
    pub fn set_text(&self, idx: u16, text: &str) -> WireResult<Self> {
        let bytes = text.as_bytes();
        let count = u32::try_from(bytes.len() + 1)
            .map_err(|_| usage_err!("text too long for a list pointer"))?;
        let list = self.init_list(idx, ElemSize::Byte, count)?;
        let content = list.content_pos()?;
        let mut store = self.data.lock()?;
        // the NUL and the word padding are already zero-filled
        store.update(list.segment, content, bytes)?;
        drop(store);
        Ok(list)
    }

    /// Reads a text list; the trailing NUL is checked and stripped.
    pub fn read_text(&self) -> WireResult<String> {
        let bytes = self.read_raw_bytes()?;
        match bytes.split_last() {
            Some((0, init)) => String::from_utf8(init.to_vec())
                .map_err(|_| malformed_err!("text payload is not valid UTF-8")),
            Some((last, _)) => Err(malformed_err!("text list ends in {last:#04x}, not NUL")),
            None => Err(malformed_err!("text list without the trailing NUL")),
        }
    }

    /// Writes `bytes` as a data list (no trailing NUL).
    pub fn set_data_blob(&self, idx: u16, bytes: &[u8]) -> WireResult<Self> {
        let count = u32::try_from(bytes.len())
            .map_err(|_| usage_err!("data blob too long for a list pointer"))?;
        let list = self.init_list(idx, ElemSize::Byte, count)?;
        let content = list.content_pos()?;
        let mut store = self.data.lock()?;
        store.update(list.segment, content, bytes)?;
        drop(store);
        Ok(list)
    }

    /// Reads a data list as raw bytes.
    pub fn read_data_blob(&self) -> WireResult<Vec<u8>> {
        self.read_raw_bytes()
    }

    fn read_raw_bytes(&self) -> WireResult<Vec<u8>> {
        let RefKind::List {
            elem: ElemSize::Byte,
            count,
        } = self.kind
        else {
            return Err(usage_err!("byte-list access on {:?}", self.kind));
        };
        let content = self.content_pos()?;
        let words = ElemSize::Byte.body_words(count);
        let store = self.data.lock()?;
        let bytes = store.get(self.segment, content, words)?;
        Ok(bytes[..count as usize].to_vec())
    }
}

#[cfg(test)]
mod test {
    use crate::{ElemSize, ElemView, Ref, RefKind, SegmentStore, StructSize};

    fn root() -> (crate::AmSegments, Ref) {
        let data = SegmentStore::new().into_shared();
        let root = Ref::alloc_root(&data, StructSize::new(0, 4)).unwrap();
        (data, root)
    }

    #[test]
    fn bit_list_is_byte_big_endian() {
        let (_data, root) = root();
        let list = root.init_list(0, ElemSize::Bit, 4).unwrap();
        // element bytes 0xA0 = 1010_0000 -> [1, 0, 1, 0]
        list.write_list_data(0, 1).unwrap();
        list.write_list_data(2, 1).unwrap();

        let content = list.content_pos().unwrap();
        {
            let store = list.shared_data();
            let store = store.lock().unwrap();
            assert_eq!(store.get(list.segment, content, 1).unwrap()[0], 0xA0);
        }
        let values: Vec<u64> = (0..4).map(|i| list.read_list_data(i).unwrap()).collect();
        assert_eq!(values, [1, 0, 1, 0]);
    }

    #[test]
    fn bit_list_write_leaves_other_indices_unchanged() {
        let (_data, root) = root();
        let list = root.init_list(0, ElemSize::Bit, 16).unwrap();
        for i in 0..16 {
            list.write_list_data(i, u64::from(i % 2 == 0)).unwrap();
        }
        list.write_list_data(5, 1).unwrap();
        for i in 0..16 {
            let expected = if i == 5 { 1 } else { u64::from(i % 2 == 0) };
            assert_eq!(list.read_list_data(i).unwrap(), expected, "index {i}");
        }
    }

    #[test]
    fn fixed_width_lists_round_trip() {
        let (_data, root) = root();
        for (slot, elem) in [
            (0, ElemSize::Byte),
            (1, ElemSize::TwoBytes),
            (2, ElemSize::FourBytes),
            (3, ElemSize::EightBytes),
        ] {
            let list = root.init_list(slot, elem, 3).unwrap();
            for i in 0..3 {
                list.write_list_data(i, u64::from(i) + 7).unwrap();
            }
            for i in 0..3 {
                assert_eq!(list.read_list_data(i).unwrap(), u64::from(i) + 7);
            }
        }
    }

    #[test]
    fn exact_word_multiple_of_bits_takes_no_padding() {
        let (data, root) = root();
        let seg_before = data.lock().unwrap().segment_len(0).unwrap();
        root.init_list(0, ElemSize::Bit, 128).unwrap();
        let seg_after = data.lock().unwrap().segment_len(0).unwrap();
        assert_eq!(seg_after - seg_before, 2);
    }

    #[test]
    fn empty_elements_consume_no_body_words() {
        let (data, root) = root();
        let before = data.lock().unwrap().segment_len(0).unwrap();
        let list = root.init_list(0, ElemSize::Empty, 1000).unwrap();
        let after = data.lock().unwrap().segment_len(0).unwrap();
        assert_eq!(before, after);
        assert_eq!(list.list_elem_count().unwrap(), 1000);
        assert!(matches!(list.list_elem(999).unwrap(), ElemView::Blank));
    }

    #[test]
    fn struct_list_round_trip() {
        let (data, root) = root();
        let list = root.init_struct_list(0, 3, StructSize::new(1, 1)).unwrap();
        for i in 0..3 {
            let ElemView::Struct(elem) = list.list_elem(i).unwrap() else {
                panic!("expected struct element");
            };
            elem.write_struct_data(0, 32, u64::from(i) * 10).unwrap();
            elem.set_text(0, &format!("e{i}")).unwrap();
        }

        let back = Ref::get_root(&data).unwrap().read_struct_ptr(0).unwrap();
        assert_eq!(back.list_elem_count().unwrap(), 3);
        for i in 0..3 {
            let ElemView::Struct(elem) = back.list_elem(i).unwrap() else {
                panic!("expected struct element");
            };
            assert_eq!(elem.read_struct_data(0, 32, 0), u64::from(i) * 10);
            assert_eq!(elem.read_struct_ptr(0).unwrap().read_text().unwrap(), format!("e{i}"));
        }
    }

    #[test]
    fn empty_struct_list_yields_no_elements() {
        let (data, root) = root();
        root.init_struct_list(0, 0, StructSize::new(2, 2)).unwrap();
        let back = Ref::get_root(&data).unwrap().read_struct_ptr(0).unwrap();
        assert_eq!(back.list_elem_count().unwrap(), 0);
        assert!(back.read_list().unwrap().is_empty());
    }

    #[test]
    fn pointer_list_round_trip() {
        let (data, root) = root();
        let list = root.init_list(0, ElemSize::Pointer, 2).unwrap();
        // write a text list into slot 1 of the pointer list by treating the
        // list body as a pointer section
        let holder = Ref {
            kind: RefKind::Struct {
                data_words: 0,
                ptr_words: 2,
            },
            ..list.clone()
        };
        holder.set_text(1, "pointed").unwrap();

        let back = Ref::get_root(&data).unwrap().read_struct_ptr(0).unwrap();
        let ElemView::Ptr(first) = back.list_elem(0).unwrap() else {
            panic!("expected pointer element");
        };
        assert!(first.is_null());
        let ElemView::Ptr(second) = back.list_elem(1).unwrap() else {
            panic!("expected pointer element");
        };
        assert_eq!(second.read_text().unwrap(), "pointed");
    }

    #[test]
    fn text_hi_occupies_one_word() {
        let (data, root) = root();
        let list = root.set_text(0, "hi").unwrap();
        let content = list.content_pos().unwrap();
        let store = root.shared_data();
        {
            let store = store.lock().unwrap();
            assert_eq!(
                store.get(list.segment, content, 1).unwrap(),
                [0x68, 0x69, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
            );
        }
        let back = Ref::get_root(&data).unwrap().read_struct_ptr(0).unwrap();
        assert_eq!(back.read_text().unwrap(), "hi");
        assert_eq!(back.list_elem_count().unwrap(), 3); // two chars + NUL
    }

    #[test]
    fn empty_text_is_a_single_nul() {
        let (data, root) = root();
        root.set_text(0, "").unwrap();
        let back = Ref::get_root(&data).unwrap().read_struct_ptr(0).unwrap();
        assert_eq!(back.list_elem_count().unwrap(), 1);
        assert_eq!(back.read_text().unwrap(), "");
    }

    #[test]
    fn data_blob_has_no_trailing_nul() {
        let (data, root) = root();
        root.set_data_blob(0, &[1, 2, 3]).unwrap();
        let back = Ref::get_root(&data).unwrap().read_struct_ptr(0).unwrap();
        assert_eq!(back.list_elem_count().unwrap(), 3);
        assert_eq!(back.read_data_blob().unwrap(), vec![1, 2, 3]);
    }
}
