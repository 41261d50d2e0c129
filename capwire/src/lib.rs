//! Engine for the segmented Cap'n Proto wire encoding.
//!
//! A message is a set of word-aligned segments ([`SegmentStore`]) navigated
//! through typed pointers ([`Ref`]). This crate covers the byte-level side of
//! the protocol: pointer decoding and encoding, struct and list navigation,
//! deep copies of pointer trees, and the segment-table stream framing.
//!
//! Schema compilation and the typed accessor layer that turns field names
//! into bit offsets live outside this crate; they feed it plain descriptors
//! (see [`schema`]). The RPC session engine is in `capwire_rpc`.

#![deny(missing_debug_implementations)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::similar_names)]
#![cfg_attr(not(any(feature = "sync", feature = "async")), allow(dead_code))]

#[macro_use]
extern crate log;

#[macro_use]
mod wire_error;

mod copy;
mod framing;
mod list;
mod object;
mod pointer;
mod reference;
mod schema;
mod segments;
pub(crate) mod util;

pub use crate::copy::{copy, copy_into};
pub use crate::framing::{emit_message, FrameParser, ReaderLimits};
pub use crate::list::ElemView;
pub use crate::object::Object;
pub use crate::pointer::{ElemSize, RefKind};
pub use crate::reference::Ref;
pub use crate::schema::{
    DataField, InterfaceDescriptor, MethodDescriptor, PtrField, SchemaAdapter, StructSize,
};
pub use crate::segments::{AmSegments, SegmentId, SegmentStore};
pub use crate::wire_error::{WireError, WireResult};

#[cfg(feature = "sync")]
pub use crate::framing::{read_message, write_message};

#[cfg(feature = "async")]
pub use crate::framing::{read_message_async, write_message_async};

/// Number of bytes in a wire word.
pub const BYTES_PER_WORD: usize = 8;

/// Default capacity (in words) of the first segment of a message builder.
///
/// Subsequent segments double in capacity, like the segment sizing of the
/// reference implementation.
pub const DEFAULT_FIRST_SEGMENT_WORDS: u32 = 1024;

/// Default bound on the number of segments accepted from a peer.
///
/// A malicious segment table could otherwise make the receiver allocate
/// unbounded bookkeeping before any body byte arrives.
pub const DEFAULT_MAX_SEGMENTS: u32 = 512;

/// Default bound on the total size, in words, of an accepted message.
pub const DEFAULT_MAX_TOTAL_WORDS: u64 = 16 * 1024 * 1024;
