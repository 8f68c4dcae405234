//! A [Poller] is a single [Input] for any number of connections, for reactor-style dispatch:
//!  [Input::poll] reports which connection has a packet ready, and subsequent reads go to that
//!  connection until the message is finished.
//!
//! Connections are polled round-robin, each poll starting one connection further than the
//!  previous one, so a busy connection can not starve the others.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::config::PortType;
use crate::driver::SubLayer;
use crate::endpoint::{Connection, Framing, Input, PeerId};

pub const POLLER_NAME: &str = "poller";

const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct Poller {
    port_type: PortType,
    context: String,
    /// common to all connections, `None` before the first one is added
    framing: Option<Framing>,
    inputs: FxHashMap<PeerId, Box<dyn Input>>,
    order: Vec<PeerId>,
    first_to_poll: usize,
    /// the connection a message is currently read from
    active: Option<PeerId>,
}

impl Poller {
    /// Connections set up through [Input::setup_connection] get an input chain of the driver
    ///  configured for `context` in `port_type` (the root `Driver` property for context "").
    pub fn new(port_type: &PortType, context: &str) -> Poller {
        Poller {
            port_type: port_type.clone(),
            context: context.to_string(),
            framing: None,
            inputs: Default::default(),
            order: Vec::new(),
            first_to_poll: 0,
            active: None,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.inputs.contains_key(&peer)
    }

    /// The connection of the message being read, i.e. since the last successful poll and
    ///  until [Input::finish]
    pub fn active(&self) -> Option<PeerId> {
        self.active
    }

    /// Adds an input chain that is already set up for connection `peer`. All connections of a
    ///  poller must reserve the same number of header bytes. A rejected input is freed.
    pub fn add(&mut self, peer: PeerId, mut input: Box<dyn Input>) -> anyhow::Result<()> {
        let framing = input.framing();
        let rejection = match self.framing {
            _ if self.inputs.contains_key(&peer) => Some(format!("poller already has a connection {}", peer)),
            Some(common) if common.headers_len() != framing.headers_len() =>
                Some(format!("connection {} reserves {} header bytes, other connections of this poller reserve {}", peer, framing.headers_len(), common.headers_len())),
            _ => None,
        };
        if let Some(rejection) = rejection {
            if let Err(e) = input.free() {
                warn!("error freeing rejected input of {}: {}", peer, e);
            }
            bail!(rejection);
        }

        self.framing = Some(match self.framing {
            None => framing,
            Some(common) => common.with_mtu_limit(framing.mtu),
        });
        self.inputs.insert(peer, input);
        self.order.push(peer);
        debug!("poller: added connection {}, {} connections now", peer, self.order.len());
        Ok(())
    }

    /// Frees the connection's input chain. Returns `false` if there is no such connection.
    pub fn remove(&mut self, peer: PeerId) -> anyhow::Result<bool> {
        let Some(mut input) = self.inputs.remove(&peer) else {
            return Ok(false);
        };
        self.order.retain(|p| *p != peer);
        if self.active == Some(peer) {
            self.active = None;
        }
        input.free()?;
        debug!("poller: removed connection {}", peer);
        Ok(true)
    }

    fn input(&mut self, peer: PeerId) -> anyhow::Result<&mut dyn Input> {
        self.inputs.get_mut(&peer)
            .map(|input| input.as_mut() as &mut dyn Input)
            .ok_or_else(|| anyhow!("poller has no connection {}", peer))
    }
}

impl Input for Poller {
    fn driver_name(&self) -> &str {
        POLLER_NAME
    }

    fn framing(&self) -> Framing {
        self.framing.unwrap_or_default()
    }

    /// Adds a connection, setting up a new input chain for it
    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing> {
        if self.inputs.contains_key(&cnx.peer) {
            bail!("poller already has a connection {}", cnx.peer);
        }

        let mut sub = SubLayer::<dyn Input>::new(&self.port_type, &self.context);
        let setup = sub.ensure(cnx, |driver, port_type, context| driver.new_input(port_type, context))
            .and_then(|input| input.setup_connection(cnx));

        match (setup, sub.take()) {
            (Ok(_), Some(input)) => {
                self.add(cnx.peer, input)?;
                Ok(self.framing())
            }
            (Ok(_), None) => bail!("input chain of {} vanished during setup", cnx.peer),
            (Err(e), input) => {
                if let Some(mut input) = input {
                    if let Err(free_err) = input.free() {
                        warn!("error freeing input of {} after failed setup: {}", cnx.peer, free_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// While a message is being read, only its connection is polled
    fn poll(&mut self) -> anyhow::Result<Option<PeerId>> {
        if let Some(active) = self.active {
            return Ok(self.input(active)?.poll()?.map(|_| active));
        }

        let num_connections = self.order.len();
        if num_connections == 0 {
            return Ok(None);
        }
        let first = self.first_to_poll % num_connections;
        self.first_to_poll = (first + 1) % num_connections;

        for i in 0..num_connections {
            let peer = self.order[(first + i) % num_connections];
            let ready = self.input(peer)?.poll()
                .with_context(|| format!("polling connection {}", peer))?;
            if ready.is_some() {
                trace!("poller: connection {} is ready", peer);
                self.active = Some(peer);
                return Ok(Some(peer));
            }
        }
        Ok(None)
    }

    fn read_packet(&mut self) -> anyhow::Result<Bytes> {
        let peer = match self.active {
            Some(peer) => peer,
            None => loop {
                if self.order.is_empty() {
                    bail!("poller has no connections");
                }
                if let Some(peer) = self.poll()? {
                    break peer;
                }
                thread::sleep(BLOCKING_POLL_INTERVAL);
            },
        };
        self.input(peer)?.read_packet()
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        match self.active.take() {
            Some(peer) => self.input(peer)?.finish(),
            None => Ok(()),
        }
    }

    /// Frees all connections, continuing past failures; the first error is returned
    fn free(&mut self) -> anyhow::Result<()> {
        self.active = None;
        let mut result = Ok(());
        for peer in std::mem::take(&mut self.order) {
            if let Some(mut input) = self.inputs.remove(&peer) {
                if let Err(e) = input.free() {
                    warn!("error freeing input of {}: {}", peer, e);
                    if result.is_ok() {
                        result = Err(e.context(format!("freeing input of {}", peer)));
                    }
                }
            }
        }
        debug!("poller: freed all connections");
        result
    }
}
