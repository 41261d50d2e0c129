//! The seam between a vat and the byte stream it talks over.
//!
//! Concrete sockets stay outside this crate; the in-memory byte channel is
//! what the tests (and any in-process pair of vats) use.

use crate::{RpcError, RpcResult};
use tokio::sync::mpsc;

/// Outbound half of a connection.
///
/// `send` must not block; a bounded or unbounded queue behind it is fine.
/// A send failure is terminal for the session.
pub trait Transport: Send + std::fmt::Debug {
    fn send(&mut self, frame: &[u8]) -> RpcResult<()>;
}

/// In-memory transport over an unbounded byte-chunk channel.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Transport for ChannelTransport {
    fn send(&mut self, frame: &[u8]) -> RpcResult<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| RpcError::TransportFailed)
    }
}

/// A connected pair of in-memory transports: what the left side sends, the
/// right side's receiver yields, and vice versa. Feed each receiver to
/// [`Vat::pump`](crate::Vat::pump).
pub fn byte_channel_pair() -> (
    (ChannelTransport, mpsc::UnboundedReceiver<Vec<u8>>),
    (ChannelTransport, mpsc::UnboundedReceiver<Vec<u8>>),
) {
    let (tx_ab, rx_ab) = mpsc::unbounded_channel();
    let (tx_ba, rx_ba) = mpsc::unbounded_channel();
    (
        (ChannelTransport { tx: tx_ab }, rx_ba),
        (ChannelTransport { tx: tx_ba }, rx_ab),
    )
}
