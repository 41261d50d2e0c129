//! Pre-compiled descriptors of the RPC protocol schema.
//!
//! These are the (offset, width) tables a schema compiler would emit for the
//! classic level-1 `Message` union and its variant structs; the engine
//! consumes them as plain data.

use capwire::{DataField, PtrField, StructSize};

/// The outer `Message` union: a tag word and one body pointer.
pub const MESSAGE: StructSize = StructSize::new(1, 1);

pub mod message {
    use super::{DataField, PtrField};

    pub const TAG: DataField = DataField::new(0, 16);
    pub const BODY: PtrField = PtrField::new(0);

    pub const UNIMPLEMENTED: u64 = 0;
    pub const ABORT: u64 = 1;
    pub const CALL: u64 = 2;
    pub const RETURN: u64 = 3;
    pub const FINISH: u64 = 4;
    pub const RESOLVE: u64 = 5;
    pub const RELEASE: u64 = 6;
    // 7 was `save`; 8 was `restore` before it became `bootstrap`
    pub const RESTORE: u64 = 8;
}

pub mod call {
    use super::{DataField, PtrField, StructSize};

    pub const SIZE: StructSize = StructSize::new(3, 3);
    pub const QUESTION_ID: DataField = DataField::new(0, 32);
    pub const METHOD_ID: DataField = DataField::new(32, 16);
    pub const INTERFACE_ID: DataField = DataField::new(64, 64);
    pub const TARGET: PtrField = PtrField::new(0);
    pub const PARAMS: PtrField = PtrField::new(1);
}

pub mod target {
    use super::{DataField, PtrField, StructSize};

    pub const SIZE: StructSize = StructSize::new(1, 1);
    pub const IMPORTED_CAP: DataField = DataField::new(0, 32);
    pub const TAG: DataField = DataField::new(32, 16);
    pub const PROMISED_ANSWER: PtrField = PtrField::new(0);

    pub const TAG_IMPORTED_CAP: u64 = 0;
    pub const TAG_PROMISED_ANSWER: u64 = 1;
}

pub mod ret {
    use super::{DataField, PtrField, StructSize};

    pub const SIZE: StructSize = StructSize::new(2, 1);
    pub const ANSWER_ID: DataField = DataField::new(0, 32);
    pub const RELEASE_PARAM_CAPS: DataField = DataField::with_default(32, 1, 1);
    pub const TAG: DataField = DataField::new(48, 16);
    pub const BODY: PtrField = PtrField::new(0);

    pub const TAG_RESULTS: u64 = 0;
    pub const TAG_EXCEPTION: u64 = 1;
    pub const TAG_CANCELED: u64 = 2;
}

pub mod finish {
    use super::{DataField, StructSize};

    pub const SIZE: StructSize = StructSize::new(1, 0);
    pub const QUESTION_ID: DataField = DataField::new(0, 32);
    pub const RELEASE_RESULT_CAPS: DataField = DataField::with_default(32, 1, 1);
}

pub mod release {
    use super::{DataField, StructSize};

    pub const SIZE: StructSize = StructSize::new(1, 0);
    pub const ID: DataField = DataField::new(0, 32);
    pub const REFERENCE_COUNT: DataField = DataField::new(32, 32);
}

pub mod restore {
    use super::{DataField, PtrField, StructSize};

    pub const SIZE: StructSize = StructSize::new(1, 1);
    pub const QUESTION_ID: DataField = DataField::new(0, 32);
    pub const OBJECT_ID: PtrField = PtrField::new(0);
}

pub mod exception {
    use super::{DataField, PtrField, StructSize};

    pub const SIZE: StructSize = StructSize::new(1, 1);
    pub const TYPE: DataField = DataField::new(32, 16);
    pub const REASON: PtrField = PtrField::new(0);

    pub const TYPE_FAILED: u64 = 0;
}

pub mod payload {
    use super::{PtrField, StructSize};

    pub const SIZE: StructSize = StructSize::new(0, 2);
    pub const CONTENT: PtrField = PtrField::new(0);
    pub const CAP_TABLE: PtrField = PtrField::new(1);
}

pub mod cap_descriptor {
    use super::{DataField, PtrField, StructSize};

    pub const SIZE: StructSize = StructSize::new(1, 1);
    pub const TAG: DataField = DataField::new(0, 16);
    pub const ID: DataField = DataField::new(32, 32);
    pub const RECEIVER_ANSWER: PtrField = PtrField::new(0);

    pub const TAG_NONE: u64 = 0;
    pub const TAG_SENDER_HOSTED: u64 = 1;
    pub const TAG_SENDER_PROMISE: u64 = 2;
    pub const TAG_RECEIVER_HOSTED: u64 = 3;
    pub const TAG_RECEIVER_ANSWER: u64 = 4;
    pub const TAG_THIRD_PARTY_HOSTED: u64 = 5;
}

pub mod promised_answer {
    use super::{DataField, PtrField, StructSize};

    pub const SIZE: StructSize = StructSize::new(1, 1);
    pub const QUESTION_ID: DataField = DataField::new(0, 32);
    pub const TRANSFORM: PtrField = PtrField::new(0);

    /// One transform op: a tag and the pointer-field ordinal.
    pub const OP_SIZE: StructSize = StructSize::new(1, 0);
    pub const OP_TAG: DataField = DataField::new(0, 16);
    pub const OP_FIELD: DataField = DataField::new(16, 16);

    pub const OP_NOOP: u64 = 0;
    pub const OP_GET_POINTER_FIELD: u64 = 1;
}

/// Convention for `restore` results: a one-pointer struct with the restored
/// capability at pointer 0.
pub mod restored {
    use super::{PtrField, StructSize};

    pub const SIZE: StructSize = StructSize::new(0, 1);
    pub const CAP: PtrField = PtrField::new(0);
}
