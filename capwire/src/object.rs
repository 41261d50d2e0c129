use crate::{
    copy, AmSegments, DataField, ElemSize, PtrField, Ref, RefKind, SegmentStore, StructSize,
    WireResult,
};

/// A struct ref paired with its schema-declared size: the typed get/set
/// surface consumed by the RPC engine.
///
/// Interface fields read and write cap-table *indices*; the table of
/// capability handles itself travels beside the object in the RPC payload.
#[derive(Debug, Clone)]
pub struct Object {
    root: Ref,
    size: StructSize,
}

impl Object {
    /// Builds a fresh single-rooted message for this struct size.
    pub fn build(size: StructSize) -> WireResult<Self> {
        let data = SegmentStore::new().into_shared();
        let root = Ref::alloc_root(&data, size)?;
        Ok(Self { root, size })
    }

    /// Wraps an already-decoded ref; `size` comes from the schema adapter.
    pub fn with_ref(root: Ref, size: StructSize) -> Self {
        Self { root, size }
    }

    /// Reads the root of a received message as an object of type `size`.
    pub fn read_root(data: &AmSegments, size: StructSize) -> WireResult<Self> {
        Ok(Self {
            root: Ref::get_root(data)?,
            size,
        })
    }

    pub fn reference(&self) -> &Ref {
        &self.root
    }

    pub fn size(&self) -> StructSize {
        self.size
    }

    pub fn shared_data(&self) -> AmSegments {
        self.root.shared_data()
    }

    /// Reads a data field; the schema default when the field lies beyond
    /// this struct's data section.
    pub fn get_data(&self, field: &DataField) -> u64 {
        self.root
            .read_struct_data(field.bit_offset, field.bit_len, field.default)
    }

    pub fn set_data(&self, field: &DataField, value: u64) -> WireResult<()> {
        self.root
            .write_struct_data(field.bit_offset, field.bit_len, value)
    }

    /// Reads a boolean data field.
    pub fn get_bool(&self, field: &DataField) -> bool {
        self.get_data(field) != 0
    }

    pub fn set_bool(&self, field: &DataField, value: bool) -> WireResult<()> {
        self.set_data(field, u64::from(value))
    }

    pub fn get_ptr(&self, field: &PtrField) -> WireResult<Ref> {
        self.root.read_struct_ptr(field.index)
    }

    /// Allocates a child struct object behind a pointer field.
    pub fn init_struct(&self, field: &PtrField, size: StructSize) -> WireResult<Self> {
        Ok(Self {
            root: self.root.init_struct(field.index, size)?,
            size,
        })
    }

    /// Reads a child struct object; a null pointer yields an all-default
    /// object backed by the null ref.
    pub fn get_struct(&self, field: &PtrField, size: StructSize) -> WireResult<Self> {
        Ok(Self {
            root: self.root.read_struct_ptr(field.index)?,
            size,
        })
    }

    pub fn init_list(&self, field: &PtrField, elem: ElemSize, count: u32) -> WireResult<Ref> {
        self.root.init_list(field.index, elem, count)
    }

    pub fn init_struct_list(&self, field: &PtrField, count: u32, size: StructSize) -> WireResult<Ref> {
        self.root.init_struct_list(field.index, count, size)
    }

    pub fn get_text(&self, field: &PtrField) -> WireResult<String> {
        let target = self.root.read_struct_ptr(field.index)?;
        if target.is_null() {
            return Ok(String::new());
        }
        target.read_text()
    }

    pub fn set_text(&self, field: &PtrField, text: &str) -> WireResult<()> {
        self.root.set_text(field.index, text)?;
        Ok(())
    }

    pub fn get_data_blob(&self, field: &PtrField) -> WireResult<Vec<u8>> {
        let target = self.root.read_struct_ptr(field.index)?;
        if target.is_null() {
            return Ok(Vec::new());
        }
        target.read_data_blob()
    }

    pub fn set_data_blob(&self, field: &PtrField, bytes: &[u8]) -> WireResult<()> {
        self.root.set_data_blob(field.index, bytes)?;
        Ok(())
    }

    /// Cap-table index stored in an interface field; `None` for null.
    pub fn get_cap_index(&self, field: &PtrField) -> WireResult<Option<u32>> {
        let target = self.root.read_struct_ptr(field.index)?;
        match target.kind {
            RefKind::Null => Ok(None),
            RefKind::Interface { cap } => Ok(Some(cap)),
            other => Err(usage_err!("interface field holds {other:?}")),
        }
    }

    pub fn set_cap_index(&self, field: &PtrField, cap_index: u32) -> WireResult<()> {
        self.root.set_cap(field.index, cap_index)
    }

    /// Grafts another object's subtree into a pointer field of this one.
    pub fn adopt(&self, field: &PtrField, source: &Ref) -> WireResult<Ref> {
        copy::copy_into(source, &self.root, field.index)
    }
}

#[cfg(test)]
mod test {
    use super::Object;
    use crate::{DataField, PtrField, StructSize};

    const F_COUNT: DataField = DataField::new(0, 32);
    const F_FLAG: DataField = DataField::with_default(32, 1, 1);
    const F_NAME: PtrField = PtrField::new(0);
    const F_CHILD: PtrField = PtrField::new(1);

    #[test]
    fn typed_round_trip() {
        let object = Object::build(StructSize::new(1, 2)).unwrap();
        object.set_data(&F_COUNT, 99).unwrap();
        object.set_text(&F_NAME, "object").unwrap();
        let child = object.init_struct(&F_CHILD, StructSize::new(1, 0)).unwrap();
        child.set_data(&F_COUNT, 7).unwrap();

        assert_eq!(object.get_data(&F_COUNT), 99);
        // stored zero wins; declared defaults apply beyond the data section
        assert!(!object.get_bool(&F_FLAG));
        assert_eq!(object.get_text(&F_NAME).unwrap(), "object");
        let child_back = object.get_struct(&F_CHILD, StructSize::new(1, 0)).unwrap();
        assert_eq!(child_back.get_data(&F_COUNT), 7);
    }

    #[test]
    fn defaults_beyond_the_data_section() {
        let object = Object::build(StructSize::new(0, 0)).unwrap();
        // zero-size struct: every data field reads its declared default
        assert!(object.get_bool(&F_FLAG));
        assert_eq!(object.get_data(&DataField::with_default(0, 16, 4711)), 4711);
        // and text fields read empty
        assert_eq!(object.get_text(&F_NAME).unwrap(), "");
    }

    #[test]
    fn cap_indices() {
        let object = Object::build(StructSize::new(0, 1)).unwrap();
        assert_eq!(object.get_cap_index(&F_NAME).unwrap(), None);
        object.set_cap_index(&F_NAME, 2).unwrap();
        assert_eq!(object.get_cap_index(&F_NAME).unwrap(), Some(2));
    }
}
