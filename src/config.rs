use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::pool::DEFAULT_IDLE_TIMEOUT;

/// The largest payload a single UDP datagram can carry over IPV4
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Sub-driver contexts nest one level per layer, and a chain deeper than this is assumed to be
///  a cyclic `Driver` configuration
pub const MAX_STACK_DEPTH: usize = 16;

#[derive(Clone, Debug)]
pub struct NetConfig {
    /// The UDP socket shared by all `muxer.udp` connections of a driver instance is bound to this
    ///  address. Its IP is advertised to peers, so it should not be the unspecified address
    ///  in a distributed setup.
    pub udp_bind_addr: SocketAddr,

    /// This is the datagram size (including the muxer key and all other headers) that the UDP
    ///  muxer assumes. It is not discovered - the application is responsible for choosing a
    ///  value that all routes between nodes support without fragmentation.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`
    ///  for IPV4.
    pub udp_mtu: usize,

    /// TCP listeners for incoming `tcp` connections are bound to this address, typically with
    ///  port 0.
    pub tcp_bind_addr: SocketAddr,

    /// Packet size on TCP connections. TCP is a stream, so this is a buffering granularity
    ///  rather than a network constraint.
    pub tcp_mtu: usize,

    /// Packet buffer size for chains where no layer constrains the MTU
    pub default_buffer_size: usize,

    /// Upper bound for waiting on the peer during connection setup
    pub setup_timeout: Duration,

    /// Number of datagrams buffered per demultiplexed connection. Datagrams arriving while the
    ///  mailbox is full are dropped.
    pub mailbox_capacity: usize,

    /// The UDP receive loop wakes up at this interval to check if its hub was shut down
    pub receive_poll_interval: Duration,

    /// Idle threads of a stack's worker pool terminate after this time without work
    pub worker_idle_timeout: Duration,
}

impl NetConfig {
    pub fn default_localhost() -> NetConfig {
        NetConfig {
            udp_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            udp_mtu: 1472,
            tcp_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            tcp_mtu: 32*1024,
            default_buffer_size: 16*1024,
            setup_timeout: Duration::from_secs(10),
            mailbox_capacity: 1024,
            receive_poll_interval: Duration::from_millis(100),
            worker_idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.udp_mtu < 64 {
            bail!("UDP MTU {} is too small", self.udp_mtu);
        }
        if self.udp_mtu > MAX_UDP_PAYLOAD {
            bail!("UDP MTU {} exceeds the maximum UDP payload of {}", self.udp_mtu, MAX_UDP_PAYLOAD);
        }
        if self.tcp_mtu > u32::MAX as usize {
            bail!("TCP MTU {} does not fit the length prefix", self.tcp_mtu);
        }
        if self.default_buffer_size == 0 {
            bail!("default buffer size must be positive");
        }
        if self.mailbox_capacity == 0 {
            bail!("mailbox capacity must be positive");
        }
        if self.setup_timeout.is_zero() || self.receive_poll_interval.is_zero() || self.worker_idle_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        Ok(())
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig::default_localhost()
    }
}


/// A named bag of string properties describing how the ports of one kind are built. Properties
///  are scoped by driver context: a context is the path of driver names from the top of the
///  stack, e.g. `/rel/muxer.udp`.
///
/// Lookup of a key in a context tries `{context}:{key}`, then the same for each parent context,
///  and finally the bare key. So a port type with the properties
///
/// ```ascii
/// Driver      = rel
/// /rel:Driver = muxer.udp
/// ```
///
/// stacks `rel` over `muxer.udp`.
#[derive(Clone, Debug, Default)]
pub struct PortType {
    name: String,
    properties: FxHashMap<String, String>,
}

impl PortType {
    pub const DRIVER: &'static str = "Driver";
    /// for drivers that allow lowering their MTU per port type
    pub const MTU: &'static str = "Mtu";

    pub fn new(name: impl Into<String>) -> PortType {
        PortType {
            name: name.into(),
            properties: FxHashMap::default(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> PortType {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn property(&self, context: &str, key: &str) -> Option<&str> {
        let mut context = context;
        loop {
            if context.is_empty() {
                return self.properties.get(key).map(|s| s.as_str());
            }
            if let Some(value) = self.properties.get(&format!("{}:{}", context, key)) {
                return Some(value);
            }
            context = match context.rfind('/') {
                Some(idx) => &context[..idx],
                None => "",
            };
        }
    }

    pub fn property_usize(&self, context: &str, key: &str) -> anyhow::Result<Option<usize>> {
        match self.property(context, key) {
            None => Ok(None),
            Some(raw) => match raw.trim().parse() {
                Ok(n) => Ok(Some(n)),
                Err(_) => bail!("property {} in context '{}' of port type {} is not a number: {}", key, context, self.name, raw),
            }
        }
    }

    /// the name of the driver configured for the layer *below* `context`
    pub fn driver_name(&self, context: &str) -> anyhow::Result<&str> {
        match self.property(context, Self::DRIVER) {
            Some(name) => Ok(name),
            None => bail!("port type {}: no {} property for context '{}'", self.name, Self::DRIVER, context),
        }
    }

    pub fn sub_context(context: &str, driver_name: &str) -> anyhow::Result<String> {
        if context.matches('/').count() >= MAX_STACK_DEPTH {
            bail!("driver stack exceeds {} layers in context '{}' - is the {} configuration cyclic?", MAX_STACK_DEPTH, context, Self::DRIVER);
        }
        Ok(format!("{}/{}", context, driver_name))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn port_type() -> PortType {
        PortType::new("test")
            .with_property("Driver", "rel")
            .with_property("/rel:Driver", "muxer.udp")
            .with_property("/rel/muxer.udp:Mtu", "1000")
            .with_property("Mtu", "abc")
    }

    #[rstest]
    #[case::root("", "Driver", Some("rel"))]
    #[case::exact("/rel", "Driver", Some("muxer.udp"))]
    #[case::parent("/rel/muxer.udp", "Driver", Some("muxer.udp"))]
    #[case::grandparent("/rel/muxer.udp/x", "Mtu", Some("1000"))]
    #[case::fallback("/tcp", "Driver", Some("rel"))]
    #[case::missing("/rel", "Other", None)]
    fn test_property(#[case] context: &str, #[case] key: &str, #[case] expected: Option<&str>) {
        assert_eq!(port_type().property(context, key), expected);
    }

    #[test]
    fn test_property_usize() {
        let pt = port_type();
        assert_eq!(pt.property_usize("/rel/muxer.udp", "Mtu").unwrap(), Some(1000));
        assert_eq!(pt.property_usize("/rel", "Missing").unwrap(), None);
        assert!(pt.property_usize("/rel", "Mtu").is_err());
    }

    #[test]
    fn test_driver_name_missing() {
        assert!(PortType::new("empty").driver_name("").is_err());
    }

    #[test]
    fn test_sub_context_depth() {
        let mut context = String::new();
        for _ in 0..MAX_STACK_DEPTH {
            context = PortType::sub_context(&context, "rel").unwrap();
        }
        assert!(PortType::sub_context(&context, "rel").is_err());
    }

    #[rstest]
    #[case::default(NetConfig::default_localhost(), true)]
    #[case::small_mtu(NetConfig { udp_mtu: 10, ..NetConfig::default_localhost() }, false)]
    #[case::huge_mtu(NetConfig { udp_mtu: 70000, ..NetConfig::default_localhost() }, false)]
    #[case::no_mailbox(NetConfig { mailbox_capacity: 0, ..NetConfig::default_localhost() }, false)]
    #[case::zero_timeout(NetConfig { setup_timeout: Duration::ZERO, ..NetConfig::default_localhost() }, false)]
    fn test_validate(#[case] config: NetConfig, #[case] valid: bool) {
        assert_eq!(config.validate().is_ok(), valid);
    }
}
