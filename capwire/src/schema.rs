//! Descriptor types handed to the engine by the (external) schema compiler.
//!
//! The engine never looks at `.capnp` sources; it consumes pre-compiled
//! descriptors: struct sizes, field windows, and method metadata.

/// Section sizes of a struct type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructSize {
    pub data_words: u16,
    pub ptr_words: u16,
}

impl StructSize {
    pub const fn new(data_words: u16, ptr_words: u16) -> Self {
        Self {
            data_words,
            ptr_words,
        }
    }

    pub const fn total_words(self) -> u16 {
        self.data_words + self.ptr_words
    }
}

/// A data field: a bit window within the data section, with the
/// schema-declared default returned when the window lies beyond the struct.
#[derive(Debug, Clone, Copy)]
pub struct DataField {
    pub bit_offset: u32,
    pub bit_len: u32,
    pub default: u64,
}

impl DataField {
    pub const fn new(bit_offset: u32, bit_len: u32) -> Self {
        Self {
            bit_offset,
            bit_len,
            default: 0,
        }
    }

    pub const fn with_default(bit_offset: u32, bit_len: u32, default: u64) -> Self {
        Self {
            bit_offset,
            bit_len,
            default,
        }
    }
}

/// A pointer field: an index into the pointer section.
#[derive(Debug, Clone, Copy)]
pub struct PtrField {
    pub index: u16,
}

impl PtrField {
    pub const fn new(index: u16) -> Self {
        Self { index }
    }
}

/// Metadata of one interface method.
#[derive(Debug, Clone, Copy)]
pub struct MethodDescriptor {
    pub interface_id: u64,
    pub method_id: u16,
    pub param_size: StructSize,
    pub result_size: StructSize,
}

/// Metadata of an interface: its id and how many methods it declares.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceDescriptor {
    pub interface_id: u64,
    pub method_count: u16,
}

/// Lookup surface of a compiled schema.
pub trait SchemaAdapter {
    /// Section sizes of the struct type with the given node id.
    fn struct_size(&self, type_id: u64) -> Option<StructSize>;

    /// Descriptor of a method, by interface id and method ordinal.
    fn method(&self, interface_id: u64, method_id: u16) -> Option<MethodDescriptor>;
}
