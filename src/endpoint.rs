pub mod buffered;
pub mod poller;

use std::fmt::{Debug, Display, Formatter};

use bytes::{Bytes, BytesMut};

use crate::control::ControlChannel;
use crate::driver::DriverRegistry;

/// The identity of a logical connection as seen by the layers above the transport, exchanged
///  at the start of a connection (e.g. the number of the peer's port).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerId(pub u32);

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The size bookkeeping of one layer in a chain.
///
/// * `mtu`: the maximum size of a packet (reserved headers included) that can be moved in one
///     transfer, with all layers below accounted for. 0 means unconstrained.
/// * `header_len`: the bytes this layer itself writes or consumes
/// * `header_offset`: where this layer's header starts in a packet, i.e. the sum of the
///     `header_len` of all layers below it
///
/// A packet of a chain reserves [Framing::headers_len] of its topmost layer in front of the
///  payload.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Framing {
    pub mtu: usize,
    pub header_len: usize,
    pub header_offset: usize,
}

impl Framing {
    pub const fn new(mtu: usize, header_len: usize) -> Framing {
        Framing {
            mtu,
            header_len,
            header_offset: 0,
        }
    }

    /// The bytes reserved by this layer and all layers below it
    pub fn headers_len(&self) -> usize {
        self.header_offset + self.header_len
    }

    /// `None` if the chain is unconstrained
    pub fn max_payload(&self) -> Option<usize> {
        if self.mtu == 0 {
            None
        }
        else {
            Some(self.mtu.saturating_sub(self.headers_len()))
        }
    }

    /// This layer's finalized framing after it was stacked on a sub-layer with finalized
    ///  framing `sub`: the MTU can only shrink going up the stack, and the header offset can
    ///  only grow.
    #[must_use]
    pub fn stacked_on(self, sub: Framing) -> Framing {
        Framing {
            mtu: min_mtu(self.mtu, sub.mtu),
            header_len: self.header_len,
            header_offset: self.header_offset.max(sub.headers_len()),
        }
    }

    #[must_use]
    pub fn with_mtu_limit(self, mtu: usize) -> Framing {
        Framing {
            mtu: min_mtu(self.mtu, mtu),
            ..self
        }
    }
}

/// 0 is 'unconstrained', i.e. larger than any other value
pub fn min_mtu(a: usize, b: usize) -> usize {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

/// Everything a layer needs for setting up one connection: the peer's identity, the control
///  channel for negotiating with the peer's matching layer, and the driver registry for
///  resolving sub-drivers.
pub struct Connection<'a> {
    pub peer: PeerId,
    pub control: &'a mut dyn ControlChannel,
    pub drivers: &'a DriverRegistry,
}

impl<'a> Connection<'a> {
    pub fn new(peer: PeerId, control: &'a mut dyn ControlChannel, drivers: &'a DriverRegistry) -> Connection<'a> {
        Connection { peer, control, drivers }
    }
}

/// The sending half of a layer.
///
/// Lifecycle: an output is created by its driver without any network I/O, set up exactly once
///  via [Output::setup_connection], used for transfer, and finally released by [Output::free].
///  `free` cascades to wrapped sub-outputs, and it must be safe to call on a chain whose setup
///  failed part way, and more than once.
///
/// An output is not safe for concurrent use, and teardown must not race with a write.
pub trait Output: Send {
    fn driver_name(&self) -> &str;

    /// Only final after setup
    fn framing(&self) -> Framing;

    /// Sets up the connection, blocking until the peer's matching layer replied. Returns this
    ///  layer's finalized framing.
    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing>;

    /// Sends a packet. The first [Framing::headers_len] bytes are reserved for the headers of
    ///  this layer and all layers below it; each layer fills in its own header at its
    ///  `header_offset`. The packet (headers included) must not exceed the MTU.
    fn write_packet(&mut self, packet: &mut BytesMut) -> anyhow::Result<()>;

    /// Completes one logical message, flushing whatever a layer buffers
    fn finish(&mut self) -> anyhow::Result<()>;

    fn free(&mut self) -> anyhow::Result<()>;
}

/// The receiving half of a layer, see [Output] for the lifecycle.
pub trait Input: Send {
    fn driver_name(&self) -> &str;

    fn framing(&self) -> Framing;

    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing>;

    /// Non-blocking check if a packet is ready, returning the id of the connection it arrived
    ///  on. The packet is not consumed.
    fn poll(&mut self) -> anyhow::Result<Option<PeerId>>;

    /// Blocks until a packet arrives. The returned packet still contains all headers, i.e.
    ///  the payload starts at [Framing::headers_len].
    fn read_packet(&mut self) -> anyhow::Result<Bytes>;

    fn finish(&mut self) -> anyhow::Result<()>;

    fn free(&mut self) -> anyhow::Result<()>;
}
