//! A layered network transport: logical ports are built by stacking independently replaceable
//!  transport *drivers* into a chain. Each layer may reserve a fixed-size header in front of the
//!  payload, and all layers of a chain agree on a common maximum transfer unit (MTU) during
//!  connection setup.
//!
//! ## Layering
//!
//! A caller asks a [driver::Driver] for an [endpoint::Input] or [endpoint::Output] for a
//!  given [config::PortType] and context. A wrapping driver (e.g. `rel`) looks up the name of its
//!  sub-driver in the port type's properties, asks that driver for its own endpoint, and delegates
//!  to it. Setup then negotiates bottom-up:
//!
//! ```ascii
//!   rel        header_len 0, header_offset 4, mtu min(own, sub) = 1400
//!    |
//!   muxer.udp  header_len 4, header_offset 0, mtu 1400
//! ```
//!
//! A packet buffer reserves `headers_len` bytes (the topmost layer's `header_offset + header_len`)
//!  in front of the payload. Every layer writes its own header at its `header_offset`, so the
//!  innermost header comes first on the wire and no payload bytes are ever shifted:
//!
//! ```ascii
//!  0: muxer key (u32 BE)
//!  4: payload
//! ```
//!
//! ## Drivers
//!
//! * `tcp`: one TCP connection per logical connection, packets framed by a u32 length prefix
//! * `muxer.udp`: many logical connections share a single UDP socket, each datagram tagged with
//!     the 4 byte key of its destination connection
//! * `rel`: a pass-through layer that adds no framing of its own. It gives upper layers a uniform
//!     'reliable' port type while the actual strategy is picked by configuration underneath
//!
//! Blocking background work (the UDP receive loop, connection acceptance) runs on the
//!  [pool::WorkerPool].

pub mod config;
pub mod control;
pub mod driver;
pub mod endpoint;
pub mod pool;
pub mod stack;
pub mod test_util;
pub mod util;
