//! The `tcp` driver: one TCP connection per logical connection. The input side listens, and
//!  advertises its address on the control channel for the output side to connect to.
//!
//! The output side replies with the MTU it settled on, so both ends of a connection use the
//!  same limit.
//!
//! TCP is always at the bottom of a chain. Packets are framed by a length prefix:
//!
//! ```ascii
//! 0: number of bytes following the prefix (u32 BE)
//! 4: headers of upper layers, payload
//! ```

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::config::{NetConfig, PortType};
use crate::control::ControlMessage;
use crate::driver::Driver;
use crate::endpoint::{Connection, Framing, Input, Output, PeerId};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const TCP_DRIVER_NAME: &str = "tcp";

const LENGTH_PREFIX_LEN: usize = 4;

/// Upper bound for packets on a connection without MTU
pub const MAX_UNCONSTRAINED_PACKET_LEN: usize = 16*1024*1024;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct TcpDriver {
    config: Arc<NetConfig>,
}

impl TcpDriver {
    pub fn new(config: Arc<NetConfig>) -> TcpDriver {
        TcpDriver { config }
    }
}

impl Driver for TcpDriver {
    fn name(&self) -> &str {
        TCP_DRIVER_NAME
    }

    fn new_input(&self, _port_type: &PortType, _context: &str) -> anyhow::Result<Box<dyn Input>> {
        Ok(Box::new(TcpInput {
            config: self.config.clone(),
            framing: Framing::new(self.config.tcp_mtu, LENGTH_PREFIX_LEN),
            peer: None,
            stream: None,
        }))
    }

    fn new_output(&self, _port_type: &PortType, _context: &str) -> anyhow::Result<Box<dyn Output>> {
        Ok(Box::new(TcpOutput {
            config: self.config.clone(),
            framing: Framing::new(self.config.tcp_mtu, LENGTH_PREFIX_LEN),
            stream: None,
        }))
    }
}

fn accept_within(listener: &TcpListener, timeout: Duration) -> anyhow::Result<(TcpStream, SocketAddr)> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok(accepted) => return Ok(accepted),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    bail!("no connection on {} within {:?}", listener.local_addr()?, timeout);
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => return Err(e).context("accepting TCP connection"),
        }
    }
}

fn max_packet_len(framing: Framing) -> usize {
    match framing.mtu {
        0 => MAX_UNCONSTRAINED_PACKET_LEN,
        mtu => mtu,
    }
}

fn check_room(framing: Framing) -> anyhow::Result<()> {
    if framing.mtu != 0 && framing.mtu <= framing.headers_len() {
        bail!("negotiated MTU {} leaves no room for payload after {} bytes of headers", framing.mtu, framing.headers_len());
    }
    Ok(())
}

fn close(stream: Option<TcpStream>, side: &str) {
    if let Some(stream) = stream {
        // the peer may have closed the connection already
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            trace!("shutting down TCP {}: {}", side, e);
        }
        debug!("closed TCP {}", side);
    }
}

pub struct TcpInput {
    config: Arc<NetConfig>,
    framing: Framing,
    peer: Option<PeerId>,
    stream: Option<TcpStream>,
}

impl TcpInput {
    fn stream(&mut self) -> anyhow::Result<&mut TcpStream> {
        self.stream.as_mut()
            .ok_or_else(|| anyhow!("TCP input is not connected"))
    }
}

impl Input for TcpInput {
    fn driver_name(&self) -> &str {
        TCP_DRIVER_NAME
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing> {
        if self.stream.is_some() {
            bail!("TCP input for {} is already set up", cnx.peer);
        }
        self.peer = Some(cnx.peer);

        let listener = TcpListener::bind(self.config.tcp_bind_addr)
            .with_context(|| format!("binding TCP listener to {}", self.config.tcp_bind_addr))?;
        let addr = listener.local_addr()?;

        cnx.control.send_message(&ControlMessage::TcpListening {
            addr,
            mtu: self.framing.mtu.prechecked_cast(),
        })?;

        let (stream, from) = accept_within(&listener, self.config.setup_timeout)?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let peer_mtu: usize = match cnx.control.recv_message()? {
            ControlMessage::TcpConnected { mtu } => mtu.safe_cast(),
            other => bail!("negotiation mismatch with the TCP output of {}: expected TCP_CONNECTED, got {}", cnx.peer, other.kind_name()),
        };
        self.framing = self.framing.with_mtu_limit(peer_mtu);
        check_room(self.framing)?;

        debug!("TCP input for {} accepted connection from {} on {}, mtu {}", cnx.peer, from, addr, self.framing.mtu);
        Ok(self.framing)
    }

    /// A connection is reported as ready if a read will not block, which includes the peer
    ///  having closed the connection
    fn poll(&mut self) -> anyhow::Result<Option<PeerId>> {
        let peer = self.peer;
        let stream = self.stream()?;

        stream.set_nonblocking(true)?;
        let mut first_byte = [0u8; 1];
        let peeked = stream.peek(&mut first_byte);
        stream.set_nonblocking(false)?;

        match peeked {
            Ok(_) => Ok(peer),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("polling TCP connection"),
        }
    }

    fn read_packet(&mut self) -> anyhow::Result<Bytes> {
        let max_len = max_packet_len(self.framing);
        let stream = self.stream()?;

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        stream.read_exact(&mut prefix)
            .context("reading packet length")?;
        let len: usize = u32::from_be_bytes(prefix).safe_cast();
        if LENGTH_PREFIX_LEN + len > max_len {
            bail!("received packet length {} exceeds the limit of {} bytes", len, max_len);
        }

        let mut packet = BytesMut::zeroed(LENGTH_PREFIX_LEN + len);
        packet[..LENGTH_PREFIX_LEN].copy_from_slice(&prefix);
        stream.read_exact(&mut packet[LENGTH_PREFIX_LEN..])
            .context("reading packet")?;
        Ok(packet.freeze())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn free(&mut self) -> anyhow::Result<()> {
        close(self.stream.take(), "input");
        Ok(())
    }
}

pub struct TcpOutput {
    config: Arc<NetConfig>,
    framing: Framing,
    stream: Option<TcpStream>,
}

impl Output for TcpOutput {
    fn driver_name(&self) -> &str {
        TCP_DRIVER_NAME
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing> {
        if self.stream.is_some() {
            bail!("TCP output for {} is already set up", cnx.peer);
        }

        let (addr, peer_mtu): (SocketAddr, usize) = match cnx.control.recv_message()? {
            ControlMessage::TcpListening { addr, mtu } => (addr, mtu.safe_cast()),
            other => bail!("negotiation mismatch with the TCP input of {}: expected TCP_LISTENING, got {}", cnx.peer, other.kind_name()),
        };

        let framing = self.framing.with_mtu_limit(peer_mtu);
        check_room(framing)?;

        let stream = TcpStream::connect_timeout(&addr, self.config.setup_timeout)
            .with_context(|| format!("connecting to {}", addr))?;
        stream.set_nodelay(true)?;

        self.framing = framing;
        self.stream = Some(stream);

        cnx.control.send_message(&ControlMessage::TcpConnected {
            mtu: self.framing.mtu.prechecked_cast(),
        })?;
        debug!("TCP output for {} connected to {}, mtu {}", cnx.peer, addr, self.framing.mtu);
        Ok(self.framing)
    }

    fn write_packet(&mut self, packet: &mut BytesMut) -> anyhow::Result<()> {
        if packet.len() < LENGTH_PREFIX_LEN {
            bail!("packet of {} bytes has no room for the length prefix", packet.len());
        }
        if packet.len() > max_packet_len(self.framing) {
            bail!("packet of {} bytes exceeds the limit of {} bytes", packet.len(), max_packet_len(self.framing));
        }

        let len: u32 = (packet.len() - LENGTH_PREFIX_LEN).prechecked_cast();
        packet[..LENGTH_PREFIX_LEN].copy_from_slice(&len.to_be_bytes());

        let Some(stream) = &mut self.stream else {
            bail!("TCP output is not connected");
        };
        stream.write_all(packet)
            .context("writing packet")
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        match &mut self.stream {
            Some(stream) => stream.flush().context("flushing TCP connection"),
            None => Ok(()),
        }
    }

    fn free(&mut self) -> anyhow::Result<()> {
        close(self.stream.take(), "output");
        Ok(())
    }
}
