use std::sync::Arc;

use anyhow::bail;
use tracing::{debug, warn};

use crate::config::{NetConfig, PortType};
use crate::control::ControlChannel;
use crate::driver::{Driver, DriverEnv, DriverRegistry};
use crate::endpoint::buffered::{BufferedInput, BufferedOutput};
use crate::endpoint::poller::Poller;
use crate::endpoint::{Connection, Input, Output, PeerId};
use crate::pool::{ExitProcess, TaskHandle, WorkerPool};

/// The entry point for building connections: a validated config, the worker pool for
///  background work, and the registry of drivers (`tcp`, `muxer.udp` and `rel` built in).
///
/// A chain is built for a [PortType] starting with the driver named by its root `Driver`
///  property, and set up against a peer over a control channel. If setup fails, the partial
///  chain is freed before the error is returned.
pub struct NetStack {
    config: Arc<NetConfig>,
    pool: WorkerPool,
    drivers: Arc<DriverRegistry>,
}

impl NetStack {
    /// with a worker pool of its own
    pub fn new(config: NetConfig) -> anyhow::Result<NetStack> {
        let pool = WorkerPool::new(config.worker_idle_timeout, Arc::new(ExitProcess));
        NetStack::with_pool(config, pool)
    }

    /// e.g. for sharing [WorkerPool::global] between stacks
    pub fn with_pool(config: NetConfig, pool: WorkerPool) -> anyhow::Result<NetStack> {
        config.validate()?;
        let config = Arc::new(config);
        let drivers = DriverRegistry::with_default_drivers(DriverEnv {
            config: config.clone(),
            pool: pool.clone(),
        });

        Ok(NetStack {
            config,
            pool,
            drivers: Arc::new(drivers),
        })
    }

    /// Only possible before the first call to [NetStack::accept_input], which shares the
    ///  registry with pool threads
    pub fn register_driver<F>(&mut self, name: &str, factory: F) -> anyhow::Result<()>
    where F: Fn(&DriverEnv) -> anyhow::Result<Arc<dyn Driver>> + Send + Sync + 'static
    {
        match Arc::get_mut(&mut self.drivers) {
            Some(drivers) => {
                drivers.register(name, factory);
                Ok(())
            }
            None => bail!("driver {} can not be registered while the registry is in use", name),
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn connect_output(&self, port_type: &PortType, peer: PeerId, control: &mut dyn ControlChannel) -> anyhow::Result<Box<dyn Output>> {
        connect_output(&self.drivers, port_type, peer, control)
    }

    pub fn connect_input(&self, port_type: &PortType, peer: PeerId, control: &mut dyn ControlChannel) -> anyhow::Result<Box<dyn Input>> {
        connect_input(&self.drivers, port_type, peer, control)
    }

    /// Sets up an input chain on a pool thread, since setup blocks until the peer's output
    ///  side takes part
    pub fn accept_input(&self, port_type: &PortType, peer: PeerId, control: Box<dyn ControlChannel>) -> anyhow::Result<TaskHandle<Box<dyn Input>>> {
        let drivers = self.drivers.clone();
        let port_type = port_type.clone();
        self.pool.spawn_task(format!("accept-{}-{}", port_type.name(), peer), move || {
            let mut control = control;
            connect_input(&drivers, &port_type, peer, control.as_mut())
        })
    }

    pub fn buffered_output(&self, output: Box<dyn Output>) -> anyhow::Result<BufferedOutput> {
        BufferedOutput::new(output, self.config.default_buffer_size)
    }

    pub fn buffered_input(&self, input: Box<dyn Input>, peer: PeerId) -> BufferedInput {
        BufferedInput::new(input, peer)
    }

    /// A single input for many connections of `port_type`. Connections are added either as
    ///  input chains that are already set up ([Poller::add]), or by setting up the poller
    ///  itself against a peer with [NetStack::drivers].
    pub fn new_poller(&self, port_type: &PortType) -> Poller {
        Poller::new(port_type, "")
    }
}

fn connect_output(drivers: &DriverRegistry, port_type: &PortType, peer: PeerId, control: &mut dyn ControlChannel) -> anyhow::Result<Box<dyn Output>> {
    let mut output = drivers.new_output(port_type)?;
    match output.setup_connection(&mut Connection::new(peer, control, drivers)) {
        Ok(framing) => {
            debug!("output chain of port type {} for {} set up: {:?}", port_type.name(), peer, framing);
            Ok(output)
        }
        Err(e) => {
            if let Err(free_err) = output.free() {
                warn!("error freeing output chain after failed setup: {}", free_err);
            }
            Err(e.context(format!("setting up output of port type {} for {}", port_type.name(), peer)))
        }
    }
}

fn connect_input(drivers: &DriverRegistry, port_type: &PortType, peer: PeerId, control: &mut dyn ControlChannel) -> anyhow::Result<Box<dyn Input>> {
    let mut input = drivers.new_input(port_type)?;
    match input.setup_connection(&mut Connection::new(peer, control, drivers)) {
        Ok(framing) => {
            debug!("input chain of port type {} for {} set up: {:?}", port_type.name(), peer, framing);
            Ok(input)
        }
        Err(e) => {
            if let Err(free_err) = input.free() {
                warn!("error freeing input chain after failed setup: {}", free_err);
            }
            Err(e.context(format!("setting up input of port type {} for {}", port_type.name(), peer)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;
    use crate::control::memory_pair;
    use crate::driver::muxer::MUXER_UDP_DRIVER_NAME;
    use crate::driver::rel::REL_DRIVER_NAME;
    use crate::driver::tcp::TCP_DRIVER_NAME;
    use crate::endpoint::Framing;
    use crate::test_util::{connect_pair, loopback_config, FakeDriver, FakeLog, Side, FAIL_SETUP_PROPERTY};

    const WAIT: Duration = Duration::from_secs(5);

    fn stack() -> NetStack {
        NetStack::new(loopback_config()).unwrap()
    }

    fn reliable(sub_driver: &str) -> PortType {
        PortType::new("reliable")
            .with_property(PortType::DRIVER, REL_DRIVER_NAME)
            .with_property(format!("/{}:{}", REL_DRIVER_NAME, PortType::DRIVER), sub_driver)
    }

    #[test]
    fn test_rel_over_muxer() {
        let stack = stack();
        let pt = reliable(MUXER_UDP_DRIVER_NAME)
            .with_property(format!("/{}/{}:{}", REL_DRIVER_NAME, MUXER_UDP_DRIVER_NAME, PortType::MTU), "1400");

        // occupies the hub's first keys, so the connection under test gets a non-zero key
        let (_first_output, _first_input) = connect_pair(&stack, &stack, &pt, PeerId(1)).unwrap();
        let (mut output, mut input) = connect_pair(&stack, &stack, &pt, PeerId(2)).unwrap();

        let expected = Framing { mtu: 1400, header_len: 0, header_offset: 4 };
        assert_eq!(output.framing(), expected);
        assert_eq!(input.framing(), expected);

        let payload = (0..1000).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let mut packet = BytesMut::zeroed(output.framing().headers_len());
        packet.extend_from_slice(&payload);
        output.write_packet(&mut packet).unwrap();

        let received = input.read_packet().unwrap();
        assert_eq!(received.len(), 1004);
        // the demuxer of the first connection got key 0, its muxer's return path key 1
        assert_eq!(&received[..4], &[0, 0, 0, 2]);
        assert_eq!(&received[4..], payload.as_slice());

        output.free().unwrap();
        input.free().unwrap();
    }

    #[rstest]
    #[case::tcp(TCP_DRIVER_NAME)]
    #[case::muxer(MUXER_UDP_DRIVER_NAME)]
    fn test_buffered_between_stacks(#[case] sub_driver: &str) {
        let sender = stack();
        let receiver = stack();
        let pt = reliable(sub_driver);

        let (output, input) = connect_pair(&sender, &receiver, &pt, PeerId(7)).unwrap();
        let mut output = sender.buffered_output(output).unwrap();
        let mut input = receiver.buffered_input(input, PeerId(7));

        // small enough for a single datagram, since the UDP muxer may reorder
        let values = (0..100).collect::<Vec<i32>>();
        output.write_i32_array(&values).unwrap();
        output.write_f64(3.25).unwrap();
        output.finish().unwrap();

        let mut received = vec![0; 100];
        input.read_i32_array(&mut received).unwrap();
        assert_eq!(received, values);
        assert_eq!(input.read_f64().unwrap(), 3.25);

        output.free().unwrap();
        input.free().unwrap();
    }

    #[test]
    fn test_poller_over_reliable_tcp() {
        let receiver = stack();
        let senders = [stack(), stack()];
        let pt = reliable(TCP_DRIVER_NAME);

        let mut poller = receiver.new_poller(&pt);
        let mut outputs = Vec::new();
        for (i, sender) in senders.iter().enumerate() {
            let peer = PeerId(10 + i as u32);
            let (output, input) = connect_pair(sender, &receiver, &pt, peer).unwrap();
            poller.add(peer, input).unwrap();
            outputs.push(output);
        }
        assert_eq!(poller.framing().headers_len(), 4);

        for (i, expected) in [(1, PeerId(11)), (0, PeerId(10))] {
            let mut packet = BytesMut::zeroed(4);
            packet.extend_from_slice(b"hello");
            outputs[i].write_packet(&mut packet).unwrap();
            outputs[i].finish().unwrap();

            let deadline = Instant::now() + WAIT;
            let ready = loop {
                if let Some(peer) = poller.poll().unwrap() {
                    break peer;
                }
                assert!(Instant::now() < deadline);
                thread::sleep(Duration::from_millis(2));
            };
            assert_eq!(ready, expected);
            assert_eq!(&poller.read_packet().unwrap()[4..], b"hello");
            poller.finish().unwrap();
        }

        poller.free().unwrap();
        for mut output in outputs {
            output.free().unwrap();
        }
    }

    #[test]
    fn test_failed_setup_frees_partial_chain() {
        let log = FakeLog::default();
        let mut stack = stack();
        let l = log.clone();
        stack.register_driver("fake", move |_| Ok(Arc::new(FakeDriver::leaf("fake", l.clone())))).unwrap();

        let pt = reliable("fake")
            .with_property(format!("/{}/fake:{}", REL_DRIVER_NAME, FAIL_SETUP_PROPERTY), "true");
        let (mut control, _peer_control) = memory_pair(WAIT);

        let err = stack.connect_output(&pt, PeerId(3), &mut control).err().unwrap();
        assert!(format!("{:#}", err).contains("failing setup"));
        assert_eq!(log.freed(), vec![("fake".to_string(), Side::Output)]);
    }

    #[test]
    fn test_accept_input_reports_failure() {
        let stack = stack();
        let pt = PortType::new("nothing").with_property(PortType::DRIVER, "nonexistent");
        let (control, _peer_control) = memory_pair(WAIT);

        let handle = stack.accept_input(&pt, PeerId(1), Box::new(control)).unwrap();
        assert!(handle.join_timeout(WAIT).is_err());
    }

    #[test]
    fn test_register_driver_while_in_use() {
        let mut stack = stack();
        let pt = PortType::new("tcp").with_property(PortType::DRIVER, TCP_DRIVER_NAME);
        let (control, _peer_control) = memory_pair(Duration::from_secs(1));
        let handle = stack.accept_input(&pt, PeerId(1), Box::new(control)).unwrap();

        assert!(stack.register_driver("late", |_| Ok(Arc::new(FakeDriver::leaf("late", FakeLog::default())))).is_err());
        // no output side connects
        assert!(handle.join().is_err());
    }

    #[test]
    fn test_invalid_config() {
        assert!(NetStack::new(NetConfig { udp_mtu: 1, ..loopback_config() }).is_err());
    }
}
