//! Utilities for testing code built on driver chains. They are used for testing this crate
//!  itself, but they are also exported for application testing, which is why they are part of
//!  the crate's regular (non-#[cfg(test)]) code.
//!
//! The [FakeDriver] is a driver without any I/O: its framing is configured through port type
//!  properties, it records every lifecycle call in a shared [FakeLog], and leaf fakes hand
//!  written packets to inputs through the log's in-memory 'wire'.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{NetConfig, PortType};
use crate::control::memory_pair;
use crate::driver::{Driver, DriverRegistry, SubLayer};
use crate::endpoint::{Connection, Framing, Input, Output, PeerId};
use crate::stack::NetStack;

/// Number of header bytes a fake layer reserves
pub const HEADER_LENGTH_PROPERTY: &str = "HeaderLength";
/// If present, the fake's setup fails (after setting up its sub-layer)
pub const FAIL_SETUP_PROPERTY: &str = "FailSetup";

/// The connection id that [setup_pair] uses on both sides
pub const TEST_PEER: PeerId = PeerId(1);

/// A config for loopback tests with short timeouts
pub fn loopback_config() -> NetConfig {
    NetConfig {
        setup_timeout: Duration::from_secs(5),
        receive_poll_interval: Duration::from_millis(20),
        ..NetConfig::default_localhost()
    }
}

/// Sets up an output and an input as matching peers, connected by an in-memory control
///  channel. The input's setup runs on a separate thread since both sides block on each other.
pub fn setup_pair(
    output: &mut dyn Output,
    out_drivers: &DriverRegistry,
    input: &mut dyn Input,
    in_drivers: &DriverRegistry,
    timeout: Duration,
) -> anyhow::Result<(Framing, Framing)> {
    let (out_control, in_control) = memory_pair(timeout);

    thread::scope(|s| {
        let input_setup = s.spawn(move || {
            let mut control = in_control;
            input.setup_connection(&mut Connection::new(TEST_PEER, &mut control, in_drivers))
        });

        let mut control = out_control;
        let out_result = output.setup_connection(&mut Connection::new(TEST_PEER, &mut control, out_drivers));
        // unblocks the input side if output setup failed
        drop(control);

        let in_result = input_setup.join()
            .map_err(|_| anyhow!("input setup panicked"))?;
        Ok((out_result?, in_result?))
    })
}

/// Connects an output chain on `sender` to an input chain on `receiver`, both built for
///  `port_type`. If either side fails, the
///  other one is freed again.
pub fn connect_pair(sender: &NetStack, receiver: &NetStack, port_type: &PortType, peer: PeerId) -> anyhow::Result<(Box<dyn Output>, Box<dyn Input>)> {
    let (mut out_control, in_control) = memory_pair(sender.config().setup_timeout);
    let accepted = receiver.accept_input(port_type, peer, Box::new(in_control))?;

    let output = sender.connect_output(port_type, peer, &mut out_control);
    drop(out_control);

    match (output, accepted.join()) {
        (Ok(output), Ok(input)) => Ok((output, input)),
        (Ok(mut output), Err(e)) => {
            output.free()?;
            Err(e)
        }
        (Err(e), Ok(mut input)) => {
            input.free()?;
            Err(e)
        }
        (Err(e), Err(_)) => Err(e),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    Input,
    Output,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FakeEvent {
    SetUp { driver: String, side: Side, framing: Framing },
    SetupFailed { driver: String, side: Side },
    Finished { driver: String, side: Side },
    Freed { driver: String, side: Side },
}

#[derive(Clone, Default)]
pub struct FakeLog {
    events: Arc<Mutex<Vec<FakeEvent>>>,
    wire: Arc<Mutex<VecDeque<Bytes>>>,
}

impl FakeLog {
    fn record(&self, event: FakeEvent) {
        debug!("fake event: {:?}", event);
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.events.lock().clone()
    }

    /// the drivers that were freed, in the order of their `free` calls
    pub fn freed(&self) -> Vec<(String, Side)> {
        self.events.lock().iter()
            .filter_map(|e| match e {
                FakeEvent::Freed { driver, side } => Some((driver.clone(), *side)),
                _ => None,
            })
            .collect()
    }

    /// packets that were written by a leaf fake output but not read yet
    pub fn wire_len(&self) -> usize {
        self.wire.lock().len()
    }
}

/// See the module documentation. A 'wrapping' fake stacks on the sub-driver configured in its
///  context, like any other wrapping layer.
pub struct FakeDriver {
    name: String,
    log: FakeLog,
    wrapping: bool,
}

impl FakeDriver {
    pub fn leaf(name: &str, log: FakeLog) -> FakeDriver {
        FakeDriver {
            name: name.to_string(),
            log,
            wrapping: false,
        }
    }

    pub fn wrapping(name: &str, log: FakeLog) -> FakeDriver {
        FakeDriver {
            name: name.to_string(),
            log,
            wrapping: true,
        }
    }

    fn layer<E: ?Sized>(&self, side: Side, port_type: &PortType, context: &str) -> anyhow::Result<FakeLayer<E>> {
        Ok(FakeLayer {
            name: self.name.clone(),
            side,
            log: self.log.clone(),
            framing: Framing::new(
                port_type.property_usize(context, PortType::MTU)?.unwrap_or(0),
                port_type.property_usize(context, HEADER_LENGTH_PROPERTY)?.unwrap_or(0),
            ),
            fail_setup: port_type.property(context, FAIL_SETUP_PROPERTY).is_some(),
            sub: self.wrapping.then(|| SubLayer::new(port_type, context)),
            peer: None,
        })
    }
}

impl Driver for FakeDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_input(&self, port_type: &PortType, context: &str) -> anyhow::Result<Box<dyn Input>> {
        Ok(Box::new(FakeInput(self.layer(Side::Input, port_type, context)?)))
    }

    fn new_output(&self, port_type: &PortType, context: &str) -> anyhow::Result<Box<dyn Output>> {
        Ok(Box::new(FakeOutput(self.layer(Side::Output, port_type, context)?)))
    }
}

struct FakeLayer<E: ?Sized> {
    name: String,
    side: Side,
    log: FakeLog,
    framing: Framing,
    fail_setup: bool,
    sub: Option<SubLayer<E>>,
    peer: Option<PeerId>,
}

impl<E: ?Sized> FakeLayer<E> {
    fn complete_setup(&mut self, cnx: &Connection<'_>, sub_framing: Option<Framing>) -> anyhow::Result<Framing> {
        if self.fail_setup {
            self.log.record(FakeEvent::SetupFailed { driver: self.name.clone(), side: self.side });
            bail!("fake {} failing setup as configured", self.name);
        }

        if let Some(sub_framing) = sub_framing {
            self.framing = self.framing.stacked_on(sub_framing);
        }
        self.peer = Some(cnx.peer);
        self.log.record(FakeEvent::SetUp { driver: self.name.clone(), side: self.side, framing: self.framing });
        Ok(self.framing)
    }

    fn record_finish(&self) {
        self.log.record(FakeEvent::Finished { driver: self.name.clone(), side: self.side });
    }

    /// records every call, so tests can check that teardown reaches each layer exactly once
    fn record_free(&self) {
        self.log.record(FakeEvent::Freed { driver: self.name.clone(), side: self.side });
    }
}

struct FakeInput(FakeLayer<dyn Input>);

impl Input for FakeInput {
    fn driver_name(&self) -> &str {
        &self.0.name
    }

    fn framing(&self) -> Framing {
        self.0.framing
    }

    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing> {
        let sub_framing = match &mut self.0.sub {
            Some(sub) => Some(
                sub.ensure(cnx, |driver, port_type, context| driver.new_input(port_type, context))?
                    .setup_connection(cnx)?
            ),
            None => None,
        };
        self.0.complete_setup(cnx, sub_framing)
    }

    fn poll(&mut self) -> anyhow::Result<Option<PeerId>> {
        match &mut self.0.sub {
            Some(sub) => sub.get()?.poll(),
            None => Ok(if self.0.log.wire_len() > 0 { self.0.peer } else { None }),
        }
    }

    fn read_packet(&mut self) -> anyhow::Result<Bytes> {
        match &mut self.0.sub {
            Some(sub) => sub.get()?.read_packet(),
            None => self.0.log.wire.lock().pop_front()
                .ok_or_else(|| anyhow!("no packet on the fake wire")),
        }
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(sub) = self.0.sub.as_mut().and_then(|s| s.endpoint_mut()) {
            sub.finish()?;
        }
        self.0.record_finish();
        Ok(())
    }

    fn free(&mut self) -> anyhow::Result<()> {
        if let Some(mut sub) = self.0.sub.as_mut().and_then(|s| s.take()) {
            sub.free()?;
        }
        self.0.record_free();
        Ok(())
    }
}

struct FakeOutput(FakeLayer<dyn Output>);

impl Output for FakeOutput {
    fn driver_name(&self) -> &str {
        &self.0.name
    }

    fn framing(&self) -> Framing {
        self.0.framing
    }

    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing> {
        let sub_framing = match &mut self.0.sub {
            Some(sub) => Some(
                sub.ensure(cnx, |driver, port_type, context| driver.new_output(port_type, context))?
                    .setup_connection(cnx)?
            ),
            None => None,
        };
        self.0.complete_setup(cnx, sub_framing)
    }

    /// fills this layer's header with the first byte of the fake's name
    fn write_packet(&mut self, packet: &mut BytesMut) -> anyhow::Result<()> {
        let framing = self.0.framing;
        if packet.len() < framing.headers_len() {
            bail!("packet of {} bytes has no room for {} bytes of headers", packet.len(), framing.headers_len());
        }
        if framing.mtu != 0 && packet.len() > framing.mtu {
            bail!("packet of {} bytes exceeds the MTU of {}", packet.len(), framing.mtu);
        }
        let marker = self.0.name.bytes().next().unwrap_or(0);
        packet[framing.header_offset..framing.headers_len()].fill(marker);

        match &mut self.0.sub {
            Some(sub) => sub.get()?.write_packet(packet),
            None => {
                self.0.log.wire.lock().push_back(Bytes::copy_from_slice(packet));
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(sub) = self.0.sub.as_mut().and_then(|s| s.endpoint_mut()) {
            sub.finish()?;
        }
        self.0.record_finish();
        Ok(())
    }

    fn free(&mut self) -> anyhow::Result<()> {
        if let Some(mut sub) = self.0.sub.as_mut().and_then(|s| s.take()) {
            sub.free()?;
        }
        self.0.record_free();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::control::memory_pair;
    use crate::driver::DriverEnv;
    use crate::pool::{ExitProcess, WorkerPool};

    const WAIT: Duration = Duration::from_secs(5);

    /// fakes 'a' over 'b' over 'c'
    fn registry(log: &FakeLog) -> DriverRegistry {
        let mut result = DriverRegistry::new(DriverEnv {
            config: Arc::new(loopback_config()),
            pool: WorkerPool::new(Duration::from_secs(30), Arc::new(ExitProcess)),
        });
        for (name, wrapping) in [("a", true), ("b", true), ("c", false)] {
            let log = log.clone();
            result.register(name, move |_| Ok(Arc::new(
                if wrapping { FakeDriver::wrapping(name, log.clone()) } else { FakeDriver::leaf(name, log.clone()) }
            )));
        }
        result
    }

    fn chain(mtus: [Option<usize>; 3], header_lens: [usize; 3]) -> PortType {
        let contexts = ["/a", "/a/b", "/a/b/c"];
        let mut result = PortType::new("chain")
            .with_property("Driver", "a")
            .with_property("/a:Driver", "b")
            .with_property("/a/b:Driver", "c");
        for i in 0..3 {
            if let Some(mtu) = mtus[i] {
                result = result.with_property(format!("{}:{}", contexts[i], PortType::MTU), mtu.to_string());
            }
            result = result.with_property(format!("{}:{}", contexts[i], HEADER_LENGTH_PROPERTY), header_lens[i].to_string());
        }
        result
    }

    #[rstest]
    #[case::unconstrained([None, None, None], 0)]
    #[case::bottom([None, None, Some(1400)], 1400)]
    #[case::middle([None, Some(900), Some(1400)], 900)]
    #[case::top([Some(500), Some(900), Some(1400)], 500)]
    #[case::only_top([Some(700), None, None], 700)]
    fn test_chain_mtu_is_minimum(#[case] mtus: [Option<usize>; 3], #[case] expected: usize) {
        let log = FakeLog::default();
        let drivers = registry(&log);
        let pt = chain(mtus, [1, 2, 4]);
        let mut output = drivers.new_output(&pt).unwrap();
        let mut input = drivers.new_input(&pt).unwrap();

        let (out_framing, in_framing) = setup_pair(output.as_mut(), &drivers, input.as_mut(), &drivers, WAIT).unwrap();
        assert_eq!(out_framing.mtu, expected);
        assert_eq!(in_framing.mtu, expected);
    }

    #[test]
    fn test_chain_header_offsets() {
        let log = FakeLog::default();
        let drivers = registry(&log);
        let pt = chain([None, None, Some(100)], [1, 2, 4]);
        let mut output = drivers.new_output(&pt).unwrap();

        let (mut control, _peer_control) = memory_pair(WAIT);
        let framing = output.setup_connection(&mut Connection::new(TEST_PEER, &mut control, &drivers)).unwrap();
        assert_eq!(framing, Framing { mtu: 100, header_len: 1, header_offset: 6 });

        // set up bottom-up, offsets growing monotonically
        assert_eq!(log.events(), vec![
            FakeEvent::SetUp { driver: "c".to_string(), side: Side::Output, framing: Framing { mtu: 100, header_len: 4, header_offset: 0 } },
            FakeEvent::SetUp { driver: "b".to_string(), side: Side::Output, framing: Framing { mtu: 100, header_len: 2, header_offset: 4 } },
            FakeEvent::SetUp { driver: "a".to_string(), side: Side::Output, framing: Framing { mtu: 100, header_len: 1, header_offset: 6 } },
        ]);

        // each layer writes its header at its own offset, innermost first
        let mut packet = BytesMut::zeroed(framing.headers_len());
        packet.extend_from_slice(b"xy");
        output.write_packet(&mut packet).unwrap();
        assert_eq!(log.wire.lock().pop_front().unwrap().as_ref(), b"ccccbbaxy");
    }

    #[test]
    fn test_teardown_inner_to_outer() {
        let log = FakeLog::default();
        let drivers = registry(&log);
        let pt = chain([None, None, None], [0, 0, 0]);
        let mut input = drivers.new_input(&pt).unwrap();

        let (mut control, _peer_control) = memory_pair(WAIT);
        input.setup_connection(&mut Connection::new(TEST_PEER, &mut control, &drivers)).unwrap();
        input.finish().unwrap();
        input.free().unwrap();

        assert_eq!(log.freed(), vec![
            ("c".to_string(), Side::Input),
            ("b".to_string(), Side::Input),
            ("a".to_string(), Side::Input),
        ]);
    }

    #[rstest]
    #[case::innermost("/a/b/c", vec!["c", "b", "a"])]
    #[case::middle("/a/b", vec!["c", "b", "a"])]
    fn test_partial_chain_is_freed_once(#[case] failing: &str, #[case] expected: Vec<&str>) {
        let log = FakeLog::default();
        let drivers = registry(&log);
        let pt = chain([None, None, None], [0, 0, 0])
            .with_property(format!("{}:{}", failing, FAIL_SETUP_PROPERTY), "true");
        let mut output = drivers.new_output(&pt).unwrap();

        let (mut control, _peer_control) = memory_pair(WAIT);
        assert!(output.setup_connection(&mut Connection::new(TEST_PEER, &mut control, &drivers)).is_err());
        output.free().unwrap();

        let expected = expected.into_iter()
            .map(|d| (d.to_string(), Side::Output))
            .collect::<Vec<_>>();
        assert_eq!(log.freed(), expected);
    }

    #[test]
    fn test_setup_pair_propagates_failure() {
        let log = FakeLog::default();
        let drivers = registry(&log);
        let pt = chain([None, None, None], [0, 0, 0])
            .with_property(format!("/a:{}", FAIL_SETUP_PROPERTY), "true");
        let mut output = drivers.new_output(&pt).unwrap();
        let mut input = drivers.new_input(&pt).unwrap();

        assert!(setup_pair(output.as_mut(), &drivers, input.as_mut(), &drivers, WAIT).is_err());
    }
}
