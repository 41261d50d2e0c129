//! The RPC session engine: one vat per connection.
//!
//! A [`Vat`] owns the four bookkeeping tables of a Cap'n Proto RPC session
//! (questions, answers, imports, exports) behind a single-threaded event
//! loop. Callers hold clonable handles; local method bodies run on spawned
//! worker tasks and post their completions back as events, so the loop never
//! blocks on user code.
//!
//! The wire side (segments, pointers, framing) lives in `capwire`; schema
//! compilation and concrete socket transports are external.

#![deny(missing_debug_implementations)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::similar_names)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::too_many_lines)]

#[macro_use]
extern crate log;

#[macro_use]
mod rpc_error;

mod capability;
mod configuration;
mod message;
pub mod rpc_schema;
mod statistics;
mod tables;
mod transport;
mod vat;

pub use crate::capability::{
    CapDispatch, Capability, LocalRegistry, Payload, PromiseVariant, Restorer,
};
pub use crate::configuration::VatConfiguration;
pub use crate::rpc_error::{RpcError, RpcResult};
pub use crate::statistics::SessionStatistics;
pub use crate::transport::{byte_channel_pair, ChannelTransport, Transport};
pub use crate::vat::{PendingCall, Vat};

/// Id of an outstanding outbound call, allocated by this vat.
pub type QuestionId = u32;
/// Id of an outstanding inbound call, allocated by the peer.
pub type AnswerId = u32;
/// Id under which one of our capabilities is addressable by the peer.
pub type ExportId = u32;
/// Id under which a peer capability is addressable by us.
pub type ImportId = u32;
/// Handle into the local object registry.
pub type LocalId = u32;
