//! The companion control channel of a connection, used by matching layers on both sides to
//!  negotiate during setup. Convention: the input side of a layer speaks first, the output side
//!  replies where its protocol needs a reply.
//!
//! Setup messages (all numbers in network byte order):
//!
//! ```ascii
//! 0: kind (u8)
//!
//! TCP_LISTENING
//! 1: listener address (1 byte discriminator 4 / 6, IP, u16 port)
//! *: mtu (varint u32)
//!
//! MUX_ADVERTISE
//! 1: UDP address of the sender's hub (as above)
//! *: key under which the sender receives (u32)
//! *: mtu (varint u32)
//! ```

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
#[cfg(test)] use mockall::automock;
use num_enum::TryFromPrimitive;
use tracing::trace;

use crate::util::buf::{put_socket_addr, put_u32_varint, try_get_socket_addr, try_get_u32_varint};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Upper bound for a single control frame, protecting against garbage length prefixes
pub const MAX_CONTROL_FRAME_LEN: usize = 64*1024;

#[cfg_attr(test, automock)]
pub trait ControlChannel: Send {
    fn send(&mut self, frame: &[u8]) -> anyhow::Result<()>;

    /// blocks until a frame arrives or the channel's timeout expires
    fn recv(&mut self) -> anyhow::Result<Bytes>;
}

impl dyn ControlChannel + '_ {
    pub fn send_message(&mut self, msg: &ControlMessage) -> anyhow::Result<()> {
        trace!("sending control message {:?}", msg);
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        self.send(&buf)
    }

    pub fn recv_message(&mut self) -> anyhow::Result<ControlMessage> {
        let frame = self.recv()?;
        let msg = ControlMessage::deser(&mut frame.as_ref())?;
        trace!("received control message {:?}", msg);
        Ok(msg)
    }
}


/// An in-process control channel, one half of a [memory_pair]
pub struct MemoryControlChannel {
    send: Sender<Bytes>,
    recv: Receiver<Bytes>,
    timeout: Duration,
}

pub fn memory_pair(timeout: Duration) -> (MemoryControlChannel, MemoryControlChannel) {
    let (send_a, recv_a) = unbounded();
    let (send_b, recv_b) = unbounded();
    (
        MemoryControlChannel { send: send_a, recv: recv_b, timeout },
        MemoryControlChannel { send: send_b, recv: recv_a, timeout },
    )
}

impl ControlChannel for MemoryControlChannel {
    fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        self.send.send(Bytes::copy_from_slice(frame))
            .map_err(|_| anyhow!("control channel peer is gone"))
    }

    fn recv(&mut self) -> anyhow::Result<Bytes> {
        match self.recv.recv_timeout(self.timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => bail!("no control message from peer within {:?}", self.timeout),
            Err(RecvTimeoutError::Disconnected) => bail!("control channel peer is gone"),
        }
    }
}


/// Control frames over a byte stream, each prefixed with its length (u32 BE). Timeouts are
///  the stream's business, e.g. [std::net::TcpStream::set_read_timeout].
pub struct StreamControlChannel<S: Read + Write + Send> {
    stream: S,
}

impl<S: Read + Write + Send> StreamControlChannel<S> {
    pub fn new(stream: S) -> StreamControlChannel<S> {
        StreamControlChannel { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write + Send> ControlChannel for StreamControlChannel<S> {
    fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        if frame.len() > MAX_CONTROL_FRAME_LEN {
            bail!("control frame of {} bytes exceeds the maximum of {}", frame.len(), MAX_CONTROL_FRAME_LEN);
        }
        let len: u32 = frame.len().prechecked_cast();
        self.stream.write_all(&len.to_be_bytes())
            .and_then(|_| self.stream.write_all(frame))
            .and_then(|_| self.stream.flush())
            .context("writing control frame")
    }

    fn recv(&mut self) -> anyhow::Result<Bytes> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)
            .context("reading control frame length")?;
        let len: usize = u32::from_be_bytes(len_buf).safe_cast();
        if len > MAX_CONTROL_FRAME_LEN {
            bail!("control frame length {} exceeds the maximum of {}", len, MAX_CONTROL_FRAME_LEN);
        }

        let mut frame = vec![0u8; len];
        self.stream.read_exact(&mut frame)
            .context("reading control frame")?;
        Ok(frame.into())
    }
}


#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
enum ControlMessageKind {
    TcpListening = 1,
    MuxAdvertise = 2,
    TcpConnected = 3,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlMessage {
    TcpListening {
        addr: SocketAddr,
        mtu: u32,
    },
    MuxAdvertise {
        addr: SocketAddr,
        key: u32,
        mtu: u32,
    },
    /// the output side's reply to [ControlMessage::TcpListening], carrying the MTU both
    ///  sides use
    TcpConnected {
        mtu: u32,
    },
}

impl ControlMessage {
    fn kind(&self) -> ControlMessageKind {
        match self {
            ControlMessage::TcpListening { .. } => ControlMessageKind::TcpListening,
            ControlMessage::MuxAdvertise { .. } => ControlMessageKind::MuxAdvertise,
            ControlMessage::TcpConnected { .. } => ControlMessageKind::TcpConnected,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            ControlMessageKind::TcpListening => "TCP_LISTENING",
            ControlMessageKind::MuxAdvertise => "MUX_ADVERTISE",
            ControlMessageKind::TcpConnected => "TCP_CONNECTED",
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind() as u8);
        match self {
            ControlMessage::TcpListening { addr, mtu } => {
                put_socket_addr(buf, addr);
                put_u32_varint(buf, *mtu);
            }
            ControlMessage::MuxAdvertise { addr, key, mtu } => {
                put_socket_addr(buf, addr);
                buf.put_u32(*key);
                put_u32_varint(buf, *mtu);
            }
            ControlMessage::TcpConnected { mtu } => {
                put_u32_varint(buf, *mtu);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessage> {
        let raw_kind = buf.try_get_u8()?;
        let kind = ControlMessageKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid control message kind {}", raw_kind))?;

        let msg = match kind {
            ControlMessageKind::TcpListening => ControlMessage::TcpListening {
                addr: try_get_socket_addr(buf)?,
                mtu: try_get_u32_varint(buf)?,
            },
            ControlMessageKind::MuxAdvertise => ControlMessage::MuxAdvertise {
                addr: try_get_socket_addr(buf)?,
                key: buf.try_get_u32()?,
                mtu: try_get_u32_varint(buf)?,
            },
            ControlMessageKind::TcpConnected => ControlMessage::TcpConnected {
                mtu: try_get_u32_varint(buf)?,
            },
        };

        if buf.has_remaining() {
            bail!("{} bytes of garbage after {} control message", buf.remaining(), msg.kind_name());
        }
        Ok(msg)
    }
}
