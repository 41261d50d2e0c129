//! Deep copy of pointer trees.
//!
//! [`copy`] flattens a subtree into a self-contained blob (root pointer
//! first), used when a payload is forwarded to another message or session.
//! [`copy_into`] grafts a subtree into another builder in place. Both walk
//! the tree through resolved refs, so far pointers in the source collapse
//! into plain pointers in the destination.

use crate::{
    pointer::encode_preamble, AmSegments, ElemSize, ElemView, Ref, RefKind, SegmentId,
    SegmentStore, StructSize, WireResult,
};

/// Flattens the subtree under `src` into a standalone byte image.
///
/// The first word is a synthetic root pointer; reading the blob as a
/// one-segment message yields a structurally equal object. A null ref
/// flattens to a single zero word.
pub fn copy(src: &Ref) -> WireResult<Vec<u8>> {
    let dst = SegmentStore::with_first_segment_words(u32::MAX).into_shared();
    {
        let mut store = dst.lock()?;
        store.alloc(0, 1)?; // the root pointer word
    }
    copy_object(src, &dst, 0, 0)?;
    let store = dst.lock()?;
    if store.segment_count() != 1 {
        return Err(impl_err!("copy spilled into multiple segments"));
    }
    Ok(store.get(0, 0, store.segment_len(0)?)?.to_vec())
}

/// Grafts the subtree under `src` into the `idx`-th pointer slot of
/// `parent`, rewriting child offsets for the new location.
pub fn copy_into(src: &Ref, parent: &Ref, idx: u16) -> WireResult<Ref> {
    let slot = parent.require_ptr_slot(idx)?;
    let dst = parent.shared_data();
    copy_object(src, &dst, parent.segment, slot)?;
    parent.read_struct_ptr(idx)
}

fn copy_object(
    src: &Ref,
    dst: &AmSegments,
    slot_segment: SegmentId,
    slot_pos: u32,
) -> WireResult<()> {
    match src.kind {
        RefKind::Null => Ok(()), // slots are zero-filled already
        RefKind::Interface { cap } => {
            Ref::write_raw_ptr(dst, slot_segment, slot_pos, 0, RefKind::Interface { cap })
        }
        RefKind::Struct {
            data_words,
            ptr_words,
        } => {
            let kind = src.kind;
            let words = u32::from(data_words) + u32::from(ptr_words);
            let (seg, content) = Ref::alloc_behind_slot(dst, slot_segment, slot_pos, words, kind)?;
            if data_words > 0 {
                let bytes = src.raw_content(0, u32::from(data_words))?;
                let mut store = dst.lock()?;
                store.update(seg, content, &bytes)?;
            }
            for i in 0..ptr_words {
                let child = src.read_struct_ptr(i)?;
                copy_object(&child, dst, seg, content + u32::from(data_words) + u32::from(i))?;
            }
            Ok(())
        }
        RefKind::List {
            elem: ElemSize::Pointer,
            count,
        } => {
            let (seg, content) =
                Ref::alloc_behind_slot(dst, slot_segment, slot_pos, count, src.kind)?;
            for i in 0..count {
                let ElemView::Ptr(child) = src.list_elem(i)? else {
                    return Err(impl_err!("pointer list yielded a non-pointer element"));
                };
                copy_object(&child, dst, seg, content + i)?;
            }
            Ok(())
        }
        RefKind::List {
            elem: ElemSize::InlineComposite,
            count: body_words,
        } => {
            let (elem_count, size) = src.composite_layout()?;
            let (seg, content) =
                Ref::alloc_behind_slot(dst, slot_segment, slot_pos, body_words + 1, src.kind)?;
            #[allow(clippy::cast_possible_wrap)]
            let tag = encode_preamble(
                elem_count as i32,
                RefKind::Struct {
                    data_words: size.data_words,
                    ptr_words: size.ptr_words,
                },
            );
            {
                let mut store = dst.lock()?;
                store.update(seg, content, &tag.to_le_bytes())?;
            }
            let stride = u32::from(size.total_words());
            for i in 0..elem_count {
                let ElemView::Struct(elem) = src.list_elem(i)? else {
                    return Err(impl_err!("composite list yielded a non-struct element"));
                };
                copy_struct_body(&elem, size, dst, seg, content + 1 + i * stride)?;
            }
            Ok(())
        }
        RefKind::List { elem, count } => {
            let words = elem.body_words(count);
            let (seg, content) =
                Ref::alloc_behind_slot(dst, slot_segment, slot_pos, words, src.kind)?;
            if words > 0 {
                let bytes = src.raw_content(0, words)?;
                let mut store = dst.lock()?;
                store.update(seg, content, &bytes)?;
            }
            Ok(())
        }
        RefKind::Far { .. } => Err(impl_err!("unresolved far pointer reached the copier")),
    }
}

// Copies one composite element body (data raw, pointers recursively) to an
// already-allocated destination position.
fn copy_struct_body(
    elem: &Ref,
    size: StructSize,
    dst: &AmSegments,
    seg: SegmentId,
    elem_pos: u32,
) -> WireResult<()> {
    if size.data_words > 0 {
        let bytes = elem.raw_content(0, u32::from(size.data_words))?;
        let mut store = dst.lock()?;
        store.update(seg, elem_pos, &bytes)?;
    }
    for j in 0..size.ptr_words {
        let child = elem.read_struct_ptr(j)?;
        copy_object(
            &child,
            dst,
            seg,
            elem_pos + u32::from(size.data_words) + u32::from(j),
        )?;
    }
    Ok(())
}

impl Ref {
    // A copy of `words` content words starting `word_off` words into the
    // content. The source guard is dropped before the caller writes, so a
    // copy within one store cannot deadlock.
    fn raw_content(&self, word_off: u32, words: u32) -> WireResult<Vec<u8>> {
        let content = self.content_pos()?;
        let store = self.data.lock()?;
        Ok(store.get(self.segment, content + word_off, words)?.to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::{copy, copy_into};
    use crate::{ElemSize, ElemView, Ref, SegmentStore, StructSize};

    fn reread(blob: Vec<u8>) -> Ref {
        let data = SegmentStore::from_segments(vec![blob]).unwrap().into_shared();
        Ref::get_root(&data).unwrap()
    }

    #[test]
    fn null_copies_to_one_zero_word() {
        let data = SegmentStore::new().into_shared();
        let blob = copy(&Ref::null(&data)).unwrap();
        assert_eq!(blob, vec![0; 8]);
    }

    #[test]
    fn nested_tree_stands_alone() {
        let data = SegmentStore::new().into_shared();
        let root = Ref::alloc_root(&data, StructSize::new(1, 2)).unwrap();
        root.write_struct_data(0, 64, 4711).unwrap();
        root.set_text(0, "greetings").unwrap();
        let child = root.init_struct(1, StructSize::new(1, 1)).unwrap();
        child.write_struct_data(0, 16, 0xBEEF).unwrap();
        child.set_text(0, "inner").unwrap();

        let back = reread(copy(&root).unwrap());
        assert_eq!(back.read_struct_data(0, 64, 0), 4711);
        assert_eq!(back.read_struct_ptr(0).unwrap().read_text().unwrap(), "greetings");
        let child_back = back.read_struct_ptr(1).unwrap();
        assert_eq!(child_back.read_struct_data(0, 16, 0), 0xBEEF);
        assert_eq!(child_back.read_struct_ptr(0).unwrap().read_text().unwrap(), "inner");
    }

    #[test]
    fn copy_collapses_far_pointers() {
        // force the original tree across two segments
        let data = SegmentStore::with_first_segment_words(6).into_shared();
        let root = Ref::alloc_root(&data, StructSize::new(1, 1)).unwrap();
        let child = root.init_struct(0, StructSize::new(4, 0)).unwrap();
        child.write_struct_data(0, 64, 31337).unwrap();
        assert_ne!(child.segment, root.segment);

        let blob = copy(&root).unwrap();
        let back = reread(blob);
        assert_eq!(
            back.read_struct_ptr(0).unwrap().read_struct_data(0, 64, 0),
            31337
        );
    }

    #[test]
    fn composite_and_primitive_lists_copy() {
        let data = SegmentStore::new().into_shared();
        let root = Ref::alloc_root(&data, StructSize::new(0, 2)).unwrap();
        let list = root.init_struct_list(0, 2, StructSize::new(1, 1)).unwrap();
        for i in 0..2 {
            let ElemView::Struct(elem) = list.list_elem(i).unwrap() else {
                panic!("struct element expected");
            };
            elem.write_struct_data(0, 32, u64::from(i) + 1).unwrap();
            elem.set_text(0, "x").unwrap();
        }
        let bits = root.init_list(1, ElemSize::Bit, 4).unwrap();
        bits.write_list_data(0, 1).unwrap();
        bits.write_list_data(2, 1).unwrap();

        let back = reread(copy(&root).unwrap());
        let list_back = back.read_struct_ptr(0).unwrap();
        assert_eq!(list_back.list_elem_count().unwrap(), 2);
        for i in 0..2 {
            let ElemView::Struct(elem) = list_back.list_elem(i).unwrap() else {
                panic!("struct element expected");
            };
            assert_eq!(elem.read_struct_data(0, 32, 0), u64::from(i) + 1);
        }
        let bits_back = back.read_struct_ptr(1).unwrap();
        let values: Vec<u64> = (0..4).map(|i| bits_back.read_list_data(i).unwrap()).collect();
        assert_eq!(values, [1, 0, 1, 0]);
    }

    #[test]
    fn copy_into_grafts_across_messages() {
        let src_data = SegmentStore::new().into_shared();
        let src_root = Ref::alloc_root(&src_data, StructSize::new(1, 1)).unwrap();
        src_root.write_struct_data(0, 8, 0x42).unwrap();
        src_root.set_text(0, "carried").unwrap();

        let dst_data = SegmentStore::new().into_shared();
        let dst_root = Ref::alloc_root(&dst_data, StructSize::new(0, 1)).unwrap();
        let grafted = copy_into(&src_root, &dst_root, 0).unwrap();
        assert_eq!(grafted.read_struct_data(0, 8, 0), 0x42);

        let back = Ref::get_root(&dst_data).unwrap().read_struct_ptr(0).unwrap();
        assert_eq!(back.read_struct_data(0, 8, 0), 0x42);
        assert_eq!(back.read_struct_ptr(0).unwrap().read_text().unwrap(), "carried");
    }
}
