//! The `muxer.udp` driver: any number of logical connections share a single UDP socket (a
//!  [hub::UdpHub] per driver instance), every datagram carrying the key of its destination
//!  connection:
//!
//! ```ascii
//! 0: mux key (u32 BE)
//! 4: payload
//! ```
//!
//! During setup the [Demuxer] registers a mailbox in the hub's routing table and advertises its
//!  key, address and MTU; the [Muxer] replies with the same information for the reverse
//!  direction. Both sides then use the smaller of the two MTUs.
//!
//! There is no ordering, deduplication or retransmission: datagrams may be lost, and a datagram
//!  for a key that is not (or no longer) registered is dropped.

pub mod hub;
pub mod key_table;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::{Receiver, TryRecvError};
use tracing::{debug, trace};

use crate::config::{NetConfig, PortType};
use crate::control::ControlMessage;
use crate::driver::muxer::hub::{UdpHub, KEY_LEN};
use crate::driver::muxer::key_table::MuxKey;
use crate::driver::{Driver, DriverEnv};
use crate::endpoint::{Connection, Framing, Input, Output, PeerId};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const MUXER_UDP_DRIVER_NAME: &str = "muxer.udp";

pub struct MuxDriver {
    config: Arc<NetConfig>,
    hub: Arc<UdpHub>,
}

impl MuxDriver {
    pub fn new(env: &DriverEnv) -> anyhow::Result<MuxDriver> {
        Ok(MuxDriver {
            config: env.config.clone(),
            hub: Arc::new(UdpHub::bind(&env.config, &env.pool)?),
        })
    }

    pub fn hub(&self) -> &UdpHub {
        &self.hub
    }

    fn framing(&self, port_type: &PortType, context: &str) -> anyhow::Result<Framing> {
        let mtu = match port_type.property_usize(context, PortType::MTU)? {
            None => self.config.udp_mtu,
            Some(mtu) if mtu > self.config.udp_mtu => bail!("port type {}: MTU {} exceeds the UDP MTU of {}", port_type.name(), mtu, self.config.udp_mtu),
            Some(mtu) => mtu,
        };
        if mtu <= KEY_LEN {
            bail!("port type {}: MTU {} leaves no room for payload after the mux key", port_type.name(), mtu);
        }
        Ok(Framing::new(mtu, KEY_LEN))
    }
}

impl Driver for MuxDriver {
    fn name(&self) -> &str {
        MUXER_UDP_DRIVER_NAME
    }

    fn new_input(&self, port_type: &PortType, context: &str) -> anyhow::Result<Box<dyn Input>> {
        Ok(Box::new(Demuxer::new(self.hub.clone(), self.framing(port_type, context)?)))
    }

    fn new_output(&self, port_type: &PortType, context: &str) -> anyhow::Result<Box<dyn Output>> {
        Ok(Box::new(Muxer::new(self.hub.clone(), self.framing(port_type, context)?)))
    }
}

fn to_wire_mtu(mtu: usize) -> u32 {
    // MTUs are bounded by the UDP payload size
    mtu.prechecked_cast()
}

/// The peer's receiving side, as advertised during setup
#[derive(Clone, Copy, Debug)]
struct Route {
    addr: SocketAddr,
    key: MuxKey,
}

fn recv_advertisement(cnx: &mut Connection<'_>, side: &str) -> anyhow::Result<(Route, usize)> {
    match cnx.control.recv_message()? {
        ControlMessage::MuxAdvertise { addr, key, mtu } => Ok((Route { addr, key: MuxKey(key) }, mtu.safe_cast())),
        other => bail!("negotiation mismatch with the {} of {}: expected MUX_ADVERTISE, got {}", side, cnx.peer, other.kind_name()),
    }
}

fn check_framing(framing: Framing) -> anyhow::Result<()> {
    if framing.mtu <= framing.headers_len() {
        bail!("negotiated MTU {} leaves no room for payload after {} bytes of headers", framing.mtu, framing.headers_len());
    }
    Ok(())
}

fn build_datagram(key: MuxKey, payload: &[u8], framing: Framing) -> anyhow::Result<BytesMut> {
    if payload.len() + KEY_LEN > framing.mtu {
        bail!("payload of {} bytes exceeds the MTU of {}", payload.len(), framing.mtu);
    }
    let mut buf = BytesMut::with_capacity(payload.len() + KEY_LEN);
    buf.put_u32(key.0);
    buf.put_slice(payload);
    Ok(buf)
}


/// The receiving side of a multiplexed connection
pub struct Demuxer {
    hub: Arc<UdpHub>,
    framing: Framing,
    peer: Option<PeerId>,
    key: Option<MuxKey>,
    mailbox: Option<Receiver<Bytes>>,
    return_route: Option<Route>,
    /// a packet that was received by [Input::poll] but not read yet
    ready: Option<Bytes>,
}

impl Demuxer {
    fn new(hub: Arc<UdpHub>, framing: Framing) -> Demuxer {
        Demuxer {
            hub,
            framing,
            peer: None,
            key: None,
            mailbox: None,
            return_route: None,
            ready: None,
        }
    }

    /// `None` before setup and after teardown
    pub fn key(&self) -> Option<MuxKey> {
        self.key
    }

    /// Sends a datagram back to the peer's [Muxer], e.g. for acknowledgements
    pub fn send_return(&self, payload: &[u8]) -> anyhow::Result<()> {
        let Some(route) = self.return_route else {
            bail!("demuxer has no return route - it is not set up");
        };
        let datagram = build_datagram(route.key, payload, self.framing)?;
        self.hub.send_to(&datagram, route.addr)
    }

    fn mailbox(&self) -> anyhow::Result<&Receiver<Bytes>> {
        self.mailbox.as_ref()
            .ok_or_else(|| anyhow!("demuxer is not set up"))
    }
}

impl Input for Demuxer {
    fn driver_name(&self) -> &str {
        MUXER_UDP_DRIVER_NAME
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing> {
        if self.key.is_some() {
            bail!("demuxer for {} is already set up", cnx.peer);
        }
        self.peer = Some(cnx.peer);

        let (key, mailbox) = self.hub.register_mailbox()?;
        self.key = Some(key);
        self.mailbox = Some(mailbox);

        cnx.control.send_message(&ControlMessage::MuxAdvertise {
            addr: self.hub.local_addr(),
            key: key.0,
            mtu: to_wire_mtu(self.framing.mtu),
        })?;

        let (return_route, peer_mtu) = recv_advertisement(cnx, "muxer")?;
        self.return_route = Some(return_route);
        self.framing = self.framing.with_mtu_limit(peer_mtu);
        check_framing(self.framing)?;

        debug!("demuxer for {} receives under key {}, returning to {} at {}, mtu {}", cnx.peer, key, return_route.key, return_route.addr, self.framing.mtu);
        Ok(self.framing)
    }

    fn poll(&mut self) -> anyhow::Result<Option<PeerId>> {
        if self.ready.is_none() {
            let received = self.mailbox()?.try_recv();
            match received {
                Ok(packet) => self.ready = Some(packet),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => bail!("mux key of this demuxer was released"),
            }
        }
        Ok(self.ready.as_ref().and(self.peer))
    }

    fn read_packet(&mut self) -> anyhow::Result<Bytes> {
        if let Some(packet) = self.ready.take() {
            return Ok(packet);
        }
        self.mailbox()?.recv()
            .map_err(|_| anyhow!("mux key of this demuxer was released"))
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn free(&mut self) -> anyhow::Result<()> {
        if let Some(key) = self.key.take() {
            self.hub.release(key);
            debug!("demuxer for {:?}: released mux key {}", self.peer, key);
        }
        self.mailbox = None;
        self.return_route = None;
        self.ready = None;
        Ok(())
    }
}


/// The sending side of a multiplexed connection
pub struct Muxer {
    hub: Arc<UdpHub>,
    framing: Framing,
    destination: Option<Route>,
    return_key: Option<MuxKey>,
    return_mailbox: Option<Receiver<Bytes>>,
}

impl Muxer {
    fn new(hub: Arc<UdpHub>, framing: Framing) -> Muxer {
        Muxer {
            hub,
            framing,
            destination: None,
            return_key: None,
            return_mailbox: None,
        }
    }

    /// The key that this muxer's packets are tagged with, i.e. the peer demuxer's key
    pub fn destination_key(&self) -> Option<MuxKey> {
        self.destination.map(|r| r.key)
    }

    /// Non-blocking; returns the payload of a datagram sent by the peer's [Demuxer::send_return]
    pub fn try_recv_return(&mut self) -> anyhow::Result<Option<Bytes>> {
        let Some(mailbox) = &self.return_mailbox else {
            bail!("muxer is not set up");
        };
        match mailbox.try_recv() {
            Ok(datagram) => Ok(Some(datagram.slice(KEY_LEN..))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => bail!("return key of this muxer was released"),
        }
    }
}

impl Output for Muxer {
    fn driver_name(&self) -> &str {
        MUXER_UDP_DRIVER_NAME
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing> {
        if self.destination.is_some() {
            bail!("muxer for {} is already set up", cnx.peer);
        }

        let (destination, peer_mtu) = recv_advertisement(cnx, "demuxer")?;
        self.framing = self.framing.with_mtu_limit(peer_mtu);
        check_framing(self.framing)?;
        self.destination = Some(destination);

        let (return_key, return_mailbox) = self.hub.register_mailbox()?;
        self.return_key = Some(return_key);
        self.return_mailbox = Some(return_mailbox);

        cnx.control.send_message(&ControlMessage::MuxAdvertise {
            addr: self.hub.local_addr(),
            key: return_key.0,
            mtu: to_wire_mtu(self.framing.mtu),
        })?;

        debug!("muxer for {} sends to key {} at {}, mtu {}", cnx.peer, destination.key, destination.addr, self.framing.mtu);
        Ok(self.framing)
    }

    fn write_packet(&mut self, packet: &mut BytesMut) -> anyhow::Result<()> {
        let Some(destination) = self.destination else {
            bail!("muxer is not set up");
        };

        let key_end = self.framing.header_offset + KEY_LEN;
        if packet.len() < key_end {
            bail!("packet of {} bytes has no room for the mux key at offset {}", packet.len(), self.framing.header_offset);
        }
        if packet.len() > self.framing.mtu {
            bail!("packet of {} bytes exceeds the MTU of {}", packet.len(), self.framing.mtu);
        }

        packet[self.framing.header_offset..key_end].copy_from_slice(&destination.key.0.to_be_bytes());
        trace!("sending {} bytes to key {} at {}", packet.len(), destination.key, destination.addr);
        self.hub.send_to(packet, destination.addr)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn free(&mut self) -> anyhow::Result<()> {
        if let Some(key) = self.return_key.take() {
            self.hub.release(key);
            debug!("muxer: released return key {}", key);
        }
        self.destination = None;
        self.return_mailbox = None;
        Ok(())
    }
}
