use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::{Buf, Bytes};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, span, trace, warn, Level};

use crate::config::{NetConfig, MAX_UDP_PAYLOAD};
use crate::driver::muxer::key_table::{KeyRoutingTable, MuxKey};
use crate::pool::WorkerPool;

/// Every datagram starts with the key of the connection it is addressed to
pub const KEY_LEN: usize = 4;

struct HubInner {
    socket: UdpSocket,
    local_addr: SocketAddr,
    routes: KeyRoutingTable<Sender<Bytes>>,
    send_lock: Mutex<()>,
    mailbox_capacity: usize,
    shut_down: AtomicBool,
}

impl HubInner {
    fn recv_loop(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

        while !self.shut_down.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    self.on_datagram(&buf[..len], from);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(e) => {
                    error!("error receiving datagram on {}: {}", self.local_addr, e);
                }
            }
        }

        debug!("UDP hub on {} shut down", self.local_addr);
        Ok(())
    }

    fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let span = span!(Level::TRACE, "datagram", %from, len = datagram.len());
        let _entered = span.enter();

        if datagram.len() < KEY_LEN {
            warn!("datagram of {} bytes from {} is too short for a mux key - dropping", datagram.len(), from);
            return;
        }

        let mut header = datagram;
        let key = MuxKey(header.get_u32());

        let Some(mailbox) = self.routes.locate(key) else {
            debug!("received datagram from {} for unknown mux key {} - dropping", from, key);
            return;
        };

        match mailbox.try_send(Bytes::copy_from_slice(datagram)) {
            Ok(()) => trace!("delivered datagram for mux key {}", key),
            Err(TrySendError::Full(_)) => debug!("mailbox for mux key {} is full - dropping datagram", key),
            Err(TrySendError::Disconnected(_)) => debug!("receiver for mux key {} is gone - dropping datagram", key),
        }
    }
}

/// A UDP socket shared by all `muxer.udp` connections of a driver. Inbound datagrams are routed
///  to per-connection mailboxes by their leading [MuxKey], a datagram for a key that is not
///  registered is dropped.
///
/// The receive loop runs on the worker pool and terminates once the hub is dropped, i.e. within
///  the configured receive poll interval after the last endpoint referencing it is gone.
pub struct UdpHub {
    inner: Arc<HubInner>,
}

impl Debug for UdpHub {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpHub({})", self.inner.local_addr)
    }
}

impl UdpHub {
    pub fn bind(config: &NetConfig, pool: &WorkerPool) -> anyhow::Result<UdpHub> {
        let socket = UdpSocket::bind(config.udp_bind_addr)
            .with_context(|| format!("binding UDP socket to {}", config.udp_bind_addr))?;
        socket.set_read_timeout(Some(config.receive_poll_interval))?;
        let local_addr = socket.local_addr()?;

        let inner = Arc::new(HubInner {
            socket,
            local_addr,
            routes: KeyRoutingTable::new(),
            send_lock: Mutex::new(()),
            mailbox_capacity: config.mailbox_capacity,
            shut_down: AtomicBool::new(false),
        });

        let loop_inner = inner.clone();
        pool.submit(format!("udp-hub-{}", local_addr), move || loop_inner.recv_loop())?;

        debug!("UDP hub bound to {}", local_addr);
        Ok(UdpHub { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Allocates a key, and a mailbox receiving all datagrams addressed to that key. The
    ///  datagrams are delivered as they arrived, i.e. starting with the key.
    pub fn register_mailbox(&self) -> anyhow::Result<(MuxKey, Receiver<Bytes>)> {
        let (send, recv) = bounded(self.inner.mailbox_capacity);
        let key = self.inner.routes.register(send)?;
        Ok((key, recv))
    }

    /// Returns `false` if the key was not registered
    pub fn release(&self, key: MuxKey) -> bool {
        self.inner.routes.release(key).is_some()
    }

    pub fn num_registered(&self) -> usize {
        self.inner.routes.len()
    }

    pub fn send_to(&self, datagram: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        let _guard = self.inner.send_lock.lock();
        let sent = self.inner.socket.send_to(datagram, to)
            .with_context(|| format!("sending datagram of {} bytes to {}", datagram.len(), to))?;
        if sent != datagram.len() {
            bail!("sent only {} of {} bytes to {}", sent, datagram.len(), to);
        }
        Ok(())
    }
}

impl Drop for UdpHub {
    fn drop(&mut self) {
        debug!("shutting down UDP hub on {}", self.inner.local_addr);
        self.inner.shut_down.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::pool::ExitProcess;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> NetConfig {
        NetConfig {
            receive_poll_interval: Duration::from_millis(20),
            ..NetConfig::default_localhost()
        }
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(Duration::from_secs(30), Arc::new(ExitProcess))
    }

    fn raw_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").unwrap()
    }

    fn datagram(key: MuxKey, payload: &[u8]) -> Vec<u8> {
        let mut result = key.0.to_be_bytes().to_vec();
        result.extend_from_slice(payload);
        result
    }

    #[test]
    fn test_delivery() {
        let hub = UdpHub::bind(&config(), &pool()).unwrap();
        let (key, mailbox) = hub.register_mailbox().unwrap();

        let dg = datagram(key, b"hello");
        raw_socket().send_to(&dg, hub.local_addr()).unwrap();

        let received = mailbox.recv_timeout(WAIT).unwrap();
        assert_eq!(received.as_ref(), dg.as_slice());
    }

    #[test]
    fn test_routing_by_key() {
        let hub = UdpHub::bind(&config(), &pool()).unwrap();
        let (key_a, mailbox_a) = hub.register_mailbox().unwrap();
        let (key_b, mailbox_b) = hub.register_mailbox().unwrap();

        let socket = raw_socket();
        socket.send_to(&datagram(key_b, b"for b"), hub.local_addr()).unwrap();
        socket.send_to(&datagram(key_a, b"for a"), hub.local_addr()).unwrap();

        assert_eq!(&mailbox_a.recv_timeout(WAIT).unwrap()[KEY_LEN..], b"for a");
        assert_eq!(&mailbox_b.recv_timeout(WAIT).unwrap()[KEY_LEN..], b"for b");
        assert!(mailbox_a.is_empty());
    }

    #[test]
    fn test_unknown_and_short_datagrams_are_dropped() {
        let hub = UdpHub::bind(&config(), &pool()).unwrap();
        let (key, mailbox) = hub.register_mailbox().unwrap();
        let (released, released_mailbox) = hub.register_mailbox().unwrap();
        assert!(hub.release(released));
        assert!(!hub.release(released));

        let socket = raw_socket();
        socket.send_to(&datagram(MuxKey(0x00ff_ffff), b"unknown"), hub.local_addr()).unwrap();
        socket.send_to(&datagram(released, b"released"), hub.local_addr()).unwrap();
        socket.send_to(&[1, 2], hub.local_addr()).unwrap();
        socket.send_to(&datagram(key, b"marker"), hub.local_addr()).unwrap();

        // datagrams are processed in order, so the marker arriving means the others were handled
        assert_eq!(&mailbox.recv_timeout(WAIT).unwrap()[KEY_LEN..], b"marker");
        assert!(mailbox.is_empty());
        assert!(released_mailbox.try_recv().is_err());
    }

    #[test]
    fn test_full_mailbox_drops() {
        let hub = UdpHub::bind(&NetConfig { mailbox_capacity: 2, ..config() }, &pool()).unwrap();
        let (key, mailbox) = hub.register_mailbox().unwrap();
        let (marker_key, marker_mailbox) = hub.register_mailbox().unwrap();

        let socket = raw_socket();
        for i in 0..5u8 {
            socket.send_to(&datagram(key, &[i]), hub.local_addr()).unwrap();
        }
        socket.send_to(&datagram(marker_key, b"marker"), hub.local_addr()).unwrap();
        marker_mailbox.recv_timeout(WAIT).unwrap();

        assert_eq!(mailbox.len(), 2);
        assert_eq!(&mailbox.recv().unwrap()[KEY_LEN..], &[0]);
        assert_eq!(&mailbox.recv().unwrap()[KEY_LEN..], &[1]);
    }

    #[test]
    fn test_send_to() {
        let hub = UdpHub::bind(&config(), &pool()).unwrap();
        let socket = raw_socket();
        socket.set_read_timeout(Some(WAIT)).unwrap();

        hub.send_to(b"abcdef", socket.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 100];
        let (len, from) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"abcdef");
        assert_eq!(from, hub.local_addr());
    }

    #[test]
    fn test_drop_terminates_receive_loop() {
        let pool = pool();
        let hub = UdpHub::bind(&config(), &pool).unwrap();
        assert_eq!(pool.stats().live_threads, 1);
        assert_eq!(pool.stats().idle_threads, 0);

        drop(hub);

        let deadline = Instant::now() + WAIT;
        while pool.stats().idle_threads == 0 {
            assert!(Instant::now() < deadline, "receive loop did not terminate");
            thread::sleep(Duration::from_millis(5));
        }
    }
}
