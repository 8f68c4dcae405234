//! The `rel` driver gives upper layers a uniform 'reliable' port type, while the actual
//!  strategy is chosen by configuring its sub-driver (the `Driver` property in the `rel`
//!  context). It adds no header of its own and forwards all transfer to the sub-endpoint.

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::config::PortType;
use crate::driver::{Driver, SubLayer};
use crate::endpoint::{Connection, Framing, Input, Output, PeerId};

pub const REL_DRIVER_NAME: &str = "rel";

pub struct RelDriver;

impl Driver for RelDriver {
    fn name(&self) -> &str {
        REL_DRIVER_NAME
    }

    fn new_input(&self, port_type: &PortType, context: &str) -> anyhow::Result<Box<dyn Input>> {
        Ok(Box::new(RelInput {
            sub: SubLayer::new(port_type, context),
            framing: Framing::new(0, 0),
        }))
    }

    fn new_output(&self, port_type: &PortType, context: &str) -> anyhow::Result<Box<dyn Output>> {
        Ok(Box::new(RelOutput {
            sub: SubLayer::new(port_type, context),
            framing: Framing::new(0, 0),
        }))
    }
}

pub struct RelInput {
    sub: SubLayer<dyn Input>,
    framing: Framing,
}

impl Input for RelInput {
    fn driver_name(&self) -> &str {
        REL_DRIVER_NAME
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing> {
        let sub = self.sub.ensure(cnx, |driver, port_type, context| driver.new_input(port_type, context))?;
        let sub_framing = sub.setup_connection(cnx)?;
        self.framing = self.framing.stacked_on(sub_framing);
        debug!("rel input for {}: {:?} on top of {}", cnx.peer, self.framing, sub.driver_name());
        Ok(self.framing)
    }

    fn poll(&mut self) -> anyhow::Result<Option<PeerId>> {
        self.sub.get()?.poll()
    }

    fn read_packet(&mut self) -> anyhow::Result<Bytes> {
        self.sub.get()?.read_packet()
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        match self.sub.endpoint_mut() {
            Some(sub) => sub.finish(),
            None => Ok(()),
        }
    }

    fn free(&mut self) -> anyhow::Result<()> {
        if let Some(mut sub) = self.sub.take() {
            sub.free()?;
            debug!("{}: freed rel input", self.sub.context());
        }
        Ok(())
    }
}

pub struct RelOutput {
    sub: SubLayer<dyn Output>,
    framing: Framing,
}

impl Output for RelOutput {
    fn driver_name(&self) -> &str {
        REL_DRIVER_NAME
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn setup_connection(&mut self, cnx: &mut Connection<'_>) -> anyhow::Result<Framing> {
        let sub = self.sub.ensure(cnx, |driver, port_type, context| driver.new_output(port_type, context))?;
        let sub_framing = sub.setup_connection(cnx)?;
        self.framing = self.framing.stacked_on(sub_framing);
        debug!("rel output for {}: {:?} on top of {}", cnx.peer, self.framing, sub.driver_name());
        Ok(self.framing)
    }

    fn write_packet(&mut self, packet: &mut BytesMut) -> anyhow::Result<()> {
        if packet.len() < self.framing.headers_len() {
            bail!("packet of {} bytes is shorter than the {} bytes of reserved headers", packet.len(), self.framing.headers_len());
        }
        self.sub.get()?.write_packet(packet)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        match self.sub.endpoint_mut() {
            Some(sub) => sub.finish(),
            None => Ok(()),
        }
    }

    fn free(&mut self) -> anyhow::Result<()> {
        if let Some(mut sub) = self.sub.take() {
            sub.free()?;
            debug!("{}: freed rel output", self.sub.context());
        }
        Ok(())
    }
}
