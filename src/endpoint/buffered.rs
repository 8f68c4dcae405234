//! Byte-oriented reading and writing on top of a set-up chain. Bytes are collected into packets
//!  of the chain's MTU (with room for all headers reserved at the front), and a read can span
//!  any number of packets.
//!
//! Typed values are written in network byte order. A serialization layer is expected to build
//!  on these primitives, the transport never interprets them.

use std::mem::size_of;

use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::endpoint::{Framing, Input, Output, PeerId};

macro_rules! write_impl {
    ($write: ident, $write_array: ident, $ty: ty) => {
        pub fn $write(&mut self, value: $ty) -> anyhow::Result<()> {
            self.write(&value.to_be_bytes())
        }

        pub fn $write_array(&mut self, values: &[$ty]) -> anyhow::Result<()> {
            for &value in values {
                self.$write(value)?;
            }
            Ok(())
        }
    }
}

macro_rules! read_impl {
    ($read: ident, $read_array: ident, $ty: ty) => {
        pub fn $read(&mut self) -> anyhow::Result<$ty> {
            let mut raw = [0u8; size_of::<$ty>()];
            self.read(&mut raw)?;
            Ok(<$ty>::from_be_bytes(raw))
        }

        pub fn $read_array(&mut self, values: &mut [$ty]) -> anyhow::Result<()> {
            for value in values.iter_mut() {
                *value = self.$read()?;
            }
            Ok(())
        }
    }
}

/// The size of packets that a chain with the given framing is written with
pub fn packet_capacity(framing: Framing, default_buffer_size: usize) -> anyhow::Result<usize> {
    let capacity = if framing.mtu == 0 { default_buffer_size } else { framing.mtu };
    if capacity <= framing.headers_len() {
        bail!("packet size {} leaves no room for payload after {} bytes of headers", capacity, framing.headers_len());
    }
    Ok(capacity)
}

pub struct BufferedOutput {
    output: Box<dyn Output>,
    headers_len: usize,
    capacity: usize,
    packet: BytesMut,
}

impl BufferedOutput {
    /// `output` must be set up. `default_buffer_size` is used as the packet size if the chain
    ///  is unconstrained.
    pub fn new(output: Box<dyn Output>, default_buffer_size: usize) -> anyhow::Result<BufferedOutput> {
        let framing = output.framing();
        let capacity = packet_capacity(framing, default_buffer_size)?;
        let headers_len = framing.headers_len();
        Ok(BufferedOutput {
            output,
            headers_len,
            capacity,
            packet: Self::empty_packet(capacity, headers_len),
        })
    }

    fn empty_packet(capacity: usize, headers_len: usize) -> BytesMut {
        let mut result = BytesMut::with_capacity(capacity);
        result.resize(headers_len, 0);
        result
    }

    pub fn output(&self) -> &dyn Output {
        self.output.as_ref()
    }

    /// the number of payload bytes in the packet that is currently being filled
    pub fn buffered(&self) -> usize {
        self.packet.len() - self.headers_len
    }

    pub fn write(&mut self, mut data: &[u8]) -> anyhow::Result<()> {
        while !data.is_empty() {
            let room = self.capacity - self.packet.len();
            if room == 0 {
                self.send_packet()?;
                continue;
            }
            let n = room.min(data.len());
            self.packet.extend_from_slice(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }

    fn send_packet(&mut self) -> anyhow::Result<()> {
        let mut packet = std::mem::replace(&mut self.packet, Self::empty_packet(self.capacity, self.headers_len));
        trace!("sending packet with {} bytes of payload", packet.len() - self.headers_len);
        self.output.write_packet(&mut packet)
    }

    /// Sends buffered data (if any) as a packet of its own
    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.buffered() > 0 {
            self.send_packet()?;
        }
        Ok(())
    }

    /// Completes a logical message: the next message starts in a new packet
    pub fn finish(&mut self) -> anyhow::Result<()> {
        self.flush()?;
        self.output.finish()
    }

    /// Releases the chain without sending buffered data
    pub fn free(&mut self) -> anyhow::Result<()> {
        self.packet.truncate(self.headers_len);
        self.output.free()
    }

    pub fn write_bool(&mut self, value: bool) -> anyhow::Result<()> {
        self.write_u8(value as u8)
    }

    pub fn write_bool_array(&mut self, values: &[bool]) -> anyhow::Result<()> {
        for &value in values {
            self.write_bool(value)?;
        }
        Ok(())
    }

    write_impl!(write_u8, write_u8_array, u8);
    write_impl!(write_i8, write_i8_array, i8);
    write_impl!(write_i16, write_i16_array, i16);
    write_impl!(write_i32, write_i32_array, i32);
    write_impl!(write_i64, write_i64_array, i64);
    write_impl!(write_f32, write_f32_array, f32);
    write_impl!(write_f64, write_f64_array, f64);
}

pub struct BufferedInput {
    input: Box<dyn Input>,
    peer: PeerId,
    headers_len: usize,
    /// payload of the current packet that was not read yet
    current: Bytes,
}

impl BufferedInput {
    /// `input` must be set up for the connection `peer`
    pub fn new(input: Box<dyn Input>, peer: PeerId) -> BufferedInput {
        let headers_len = input.framing().headers_len();
        BufferedInput {
            input,
            peer,
            headers_len,
            current: Bytes::new(),
        }
    }

    pub fn input(&self) -> &dyn Input {
        self.input.as_ref()
    }

    /// bytes that can be read without blocking
    pub fn available(&self) -> usize {
        self.current.remaining()
    }

    /// Non-blocking check if data is ready, either buffered or in the chain
    pub fn poll(&mut self) -> anyhow::Result<Option<PeerId>> {
        if self.current.has_remaining() {
            return Ok(Some(self.peer));
        }
        self.input.poll()
    }

    fn fill(&mut self) -> anyhow::Result<()> {
        while !self.current.has_remaining() {
            let packet = self.input.read_packet()?;
            if packet.len() < self.headers_len {
                bail!("received packet of {} bytes, shorter than the {} bytes of headers", packet.len(), self.headers_len);
            }
            self.current = packet.slice(self.headers_len..);
        }
        Ok(())
    }

    /// Fills `buf` completely, blocking until enough data has arrived
    pub fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut offs = 0;
        while offs < buf.len() {
            self.fill()?;
            let n = self.current.remaining().min(buf.len() - offs);
            self.current.copy_to_slice(&mut buf[offs..offs + n]);
            offs += n;
        }
        Ok(())
    }

    /// Completes reading a logical message, discarding what is left of the current packet
    pub fn finish(&mut self) -> anyhow::Result<()> {
        if self.current.has_remaining() {
            trace!("discarding {} unread bytes at the end of a message", self.current.remaining());
        }
        self.current = Bytes::new();
        self.input.finish()
    }

    pub fn free(&mut self) -> anyhow::Result<()> {
        self.current = Bytes::new();
        self.input.free()
    }

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(anyhow!("invalid bool value {}", n)),
        }
    }

    pub fn read_bool_array(&mut self, values: &mut [bool]) -> anyhow::Result<()> {
        for value in values.iter_mut() {
            *value = self.read_bool()?;
        }
        Ok(())
    }

    read_impl!(read_u8, read_u8_array, u8);
    read_impl!(read_i8, read_i8_array, i8);
    read_impl!(read_i16, read_i16_array, i16);
    read_impl!(read_i32, read_i32_array, i32);
    read_impl!(read_i64, read_i64_array, i64);
    read_impl!(read_f32, read_f32_array, f32);
    read_impl!(read_f64, read_f64_array, f64);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::config::{NetConfig, PortType};
    use crate::driver::{DriverEnv, DriverRegistry};
    use crate::pool::{ExitProcess, WorkerPool};
    use crate::test_util::{setup_pair, FakeDriver, FakeLog, HEADER_LENGTH_PROPERTY, TEST_PEER};

    const WAIT: Duration = Duration::from_secs(5);

    /// a single fake layer with a 4 byte header
    fn chain(log: &FakeLog, mtu: Option<usize>) -> (BufferedOutput, BufferedInput) {
        let mut drivers = DriverRegistry::new(DriverEnv {
            config: Arc::new(NetConfig::default_localhost()),
            pool: WorkerPool::new(Duration::from_secs(30), Arc::new(ExitProcess)),
        });
        let l = log.clone();
        drivers.register("fake", move |_| Ok(Arc::new(FakeDriver::leaf("fake", l.clone()))));

        let mut pt = PortType::new("buffered")
            .with_property("Driver", "fake")
            .with_property(HEADER_LENGTH_PROPERTY, "4");
        if let Some(mtu) = mtu {
            pt = pt.with_property(PortType::MTU, mtu.to_string());
        }

        let mut output = drivers.new_output(&pt).unwrap();
        let mut input = drivers.new_input(&pt).unwrap();
        setup_pair(output.as_mut(), &drivers, input.as_mut(), &drivers, WAIT).unwrap();

        (BufferedOutput::new(output, 64).unwrap(), BufferedInput::new(input, TEST_PEER))
    }

    #[rstest]
    #[case::constrained(Framing::new(1400, 4), 1400)]
    #[case::unconstrained(Framing::new(0, 4), 64)]
    #[case::stacked(Framing { mtu: 0, header_len: 2, header_offset: 4 }, 64)]
    fn test_packet_capacity(#[case] framing: Framing, #[case] expected: usize) {
        assert_eq!(packet_capacity(framing, 64).unwrap(), expected);
    }

    #[rstest]
    #[case::headers_only(Framing::new(4, 4))]
    #[case::default_too_small(Framing { mtu: 0, header_len: 32, header_offset: 32 })]
    fn test_packet_capacity_without_payload(#[case] framing: Framing) {
        assert!(packet_capacity(framing, 64).is_err());
    }

    #[test]
    fn test_writes_span_packets() {
        let log = FakeLog::default();
        let (mut output, mut input) = chain(&log, Some(16));

        let data = (0..30u8).collect::<Vec<_>>();
        output.write(&data).unwrap();
        assert_eq!(log.wire_len(), 2);
        assert_eq!(output.buffered(), 6);

        output.flush().unwrap();
        assert_eq!(log.wire_len(), 3);
        output.flush().unwrap();
        assert_eq!(log.wire_len(), 3);

        let mut received = [0u8; 30];
        input.read(&mut received).unwrap();
        assert_eq!(received.as_slice(), data.as_slice());
        assert_eq!(input.available(), 0);
    }

    #[test]
    fn test_unconstrained_chain_uses_default_size() {
        let log = FakeLog::default();
        let (mut output, _input) = chain(&log, None);

        output.write(&[1; 100]).unwrap();
        // 60 payload bytes per packet of 64
        assert_eq!(log.wire_len(), 1);
        assert_eq!(output.buffered(), 40);
    }

    #[test]
    fn test_typed_values() {
        let log = FakeLog::default();
        let (mut output, mut input) = chain(&log, Some(20));

        output.write_bool(true).unwrap();
        output.write_u8(0xfe).unwrap();
        output.write_i8(-3).unwrap();
        output.write_i16(-1234).unwrap();
        output.write_i32(0x1234_5678).unwrap();
        output.write_i64(i64::MIN).unwrap();
        output.write_f32(1.5).unwrap();
        output.write_f64(-0.25).unwrap();
        output.write_bool_array(&[false, true]).unwrap();
        output.write_i32_array(&[1, -1, 7]).unwrap();
        output.write_f64_array(&[f64::MAX, 0.0]).unwrap();
        output.finish().unwrap();

        assert!(input.read_bool().unwrap());
        assert_eq!(input.read_u8().unwrap(), 0xfe);
        assert_eq!(input.read_i8().unwrap(), -3);
        assert_eq!(input.read_i16().unwrap(), -1234);
        assert_eq!(input.read_i32().unwrap(), 0x1234_5678);
        assert_eq!(input.read_i64().unwrap(), i64::MIN);
        assert_eq!(input.read_f32().unwrap(), 1.5);
        assert_eq!(input.read_f64().unwrap(), -0.25);

        let mut bools = [true, false];
        input.read_bool_array(&mut bools).unwrap();
        assert_eq!(bools, [false, true]);

        let mut ints = [0; 3];
        input.read_i32_array(&mut ints).unwrap();
        assert_eq!(ints, [1, -1, 7]);

        let mut doubles = [1.0; 2];
        input.read_f64_array(&mut doubles).unwrap();
        assert_eq!(doubles, [f64::MAX, 0.0]);
    }

    #[test]
    fn test_big_endian() {
        let log = FakeLog::default();
        let (mut output, mut input) = chain(&log, Some(100));

        output.write_i32(0x0102_0304).unwrap();
        output.flush().unwrap();

        let mut raw = [0u8; 4];
        input.read(&mut raw).unwrap();
        assert_eq!(raw, [1, 2, 3, 4]);
    }

    #[test]
    fn test_invalid_bool() {
        let log = FakeLog::default();
        let (mut output, mut input) = chain(&log, Some(100));

        output.write_u8(2).unwrap();
        output.flush().unwrap();
        assert!(input.read_bool().is_err());
    }

    #[test]
    fn test_finish_starts_new_message() {
        let log = FakeLog::default();
        let (mut output, mut input) = chain(&log, Some(100));

        output.write(b"first message").unwrap();
        output.finish().unwrap();
        output.write(b"second").unwrap();
        output.finish().unwrap();
        assert_eq!(log.wire_len(), 2);

        let mut buf = [0u8; 5];
        input.read(&mut buf).unwrap();
        assert_eq!(&buf, b"first");
        input.finish().unwrap();

        let mut buf = [0u8; 6];
        input.read(&mut buf).unwrap();
        assert_eq!(&buf, b"second");
    }

    #[test]
    fn test_poll() {
        let log = FakeLog::default();
        let (mut output, mut input) = chain(&log, Some(100));
        assert_eq!(input.poll().unwrap(), None);

        output.write(b"ab").unwrap();
        output.flush().unwrap();
        assert_eq!(input.poll().unwrap(), Some(TEST_PEER));

        input.read_u8().unwrap();
        // the rest of the packet is buffered
        assert_eq!(log.wire_len(), 0);
        assert_eq!(input.poll().unwrap(), Some(TEST_PEER));
        input.read_u8().unwrap();
        assert_eq!(input.poll().unwrap(), None);
    }

    #[test]
    fn test_free_discards_buffered_data() {
        let log = FakeLog::default();
        let (mut output, mut input) = chain(&log, Some(100));

        output.write(b"unsent").unwrap();
        output.free().unwrap();
        assert_eq!(output.buffered(), 0);
        assert_eq!(log.wire_len(), 0);

        input.free().unwrap();
        assert_eq!(log.freed().len(), 2);
    }
}
