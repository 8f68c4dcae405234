pub mod muxer;
pub mod rel;
pub mod tcp;

use std::sync::Arc;

use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::{NetConfig, PortType};
use crate::endpoint::{Connection, Input, Output};
use crate::pool::WorkerPool;

/// A factory for matched [Input] / [Output] pairs implementing one transport strategy. Creating
///  an endpoint does no network I/O, that is deferred to setup.
///
/// A driver is shared by all endpoints it creates, and it keeps no per-connection state.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// `context` is the path of driver names above (and including) this driver, used for
    ///  scoped property lookup in the port type
    fn new_input(&self, port_type: &PortType, context: &str) -> anyhow::Result<Box<dyn Input>>;

    fn new_output(&self, port_type: &PortType, context: &str) -> anyhow::Result<Box<dyn Output>>;
}

/// What a driver factory gets to work with
#[derive(Clone)]
pub struct DriverEnv {
    pub config: Arc<NetConfig>,
    pub pool: WorkerPool,
}

pub type DriverFactory = Box<dyn Fn(&DriverEnv) -> anyhow::Result<Arc<dyn Driver>> + Send + Sync>;

/// Maps driver names to factories. A driver is instantiated on first use and then shared.
pub struct DriverRegistry {
    env: DriverEnv,
    factories: FxHashMap<String, DriverFactory>,
    instances: Mutex<FxHashMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    pub fn new(env: DriverEnv) -> DriverRegistry {
        DriverRegistry {
            env,
            factories: Default::default(),
            instances: Default::default(),
        }
    }

    /// with the built-in drivers `tcp`, `muxer.udp` and `rel`
    pub fn with_default_drivers(env: DriverEnv) -> DriverRegistry {
        let mut result = DriverRegistry::new(env);
        result.register(tcp::TCP_DRIVER_NAME, |env| Ok(Arc::new(tcp::TcpDriver::new(env.config.clone()))));
        result.register(muxer::MUXER_UDP_DRIVER_NAME, |env| Ok(Arc::new(muxer::MuxDriver::new(env)?)));
        result.register(rel::REL_DRIVER_NAME, |_| Ok(Arc::new(rel::RelDriver)));
        result
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where F: Fn(&DriverEnv) -> anyhow::Result<Arc<dyn Driver>> + Send + Sync + 'static
    {
        if self.factories.insert(name.to_string(), Box::new(factory)).is_some() {
            debug!("replacing factory for driver {}", name);
        }
    }

    pub fn env(&self) -> &DriverEnv {
        &self.env
    }

    pub fn resolve(&self, name: &str) -> anyhow::Result<Arc<dyn Driver>> {
        let mut instances = self.instances.lock();
        if let Some(driver) = instances.get(name) {
            return Ok(driver.clone());
        }

        let Some(factory) = self.factories.get(name) else {
            bail!("no driver registered under the name '{}'", name);
        };
        debug!("instantiating driver {}", name);
        let driver = factory(&self.env)?;
        instances.insert(name.to_string(), driver.clone());
        Ok(driver)
    }

    /// The endpoint at the top of a port type's driver stack, i.e. for the driver configured
    ///  in the root context
    pub fn new_output(&self, port_type: &PortType) -> anyhow::Result<Box<dyn Output>> {
        let name = port_type.driver_name("")?;
        let driver = self.resolve(name)?;
        driver.new_output(port_type, &PortType::sub_context("", name)?)
    }

    pub fn new_input(&self, port_type: &PortType) -> anyhow::Result<Box<dyn Input>> {
        let name = port_type.driver_name("")?;
        let driver = self.resolve(name)?;
        driver.new_input(port_type, &PortType::sub_context("", name)?)
    }
}

/// The state a wrapping layer keeps about the layer below: what to create, and once created,
///  the endpoint itself
pub struct SubLayer<E: ?Sized> {
    port_type: PortType,
    context: String,
    endpoint: Option<Box<E>>,
}

impl<E: ?Sized> SubLayer<E> {
    pub fn new(port_type: &PortType, context: &str) -> SubLayer<E> {
        SubLayer {
            port_type: port_type.clone(),
            context: context.to_string(),
            endpoint: None,
        }
    }

    /// Resolves the sub-driver and creates the sub-endpoint on first use
    pub fn ensure(&mut self, cnx: &Connection<'_>, create: impl FnOnce(&dyn Driver, &PortType, &str) -> anyhow::Result<Box<E>>) -> anyhow::Result<&mut E> {
        if self.endpoint.is_none() {
            let name = self.port_type.driver_name(&self.context)?;
            let driver = cnx.drivers.resolve(name)?;
            let sub_context = PortType::sub_context(&self.context, name)?;
            debug!("{}: sub-driver is {}", self.context, name);
            self.endpoint = Some(create(driver.as_ref(), &self.port_type, &sub_context)?);
        }
        self.get()
    }

    pub fn get(&mut self) -> anyhow::Result<&mut E> {
        self.endpoint.as_deref_mut()
            .ok_or_else(|| anyhow!("{} has no sub-endpoint - it is not set up", self.context))
    }

    /// `None` if the sub-endpoint was not created yet, or was freed
    pub fn endpoint_mut(&mut self) -> Option<&mut E> {
        self.endpoint.as_deref_mut()
    }

    pub fn take(&mut self) -> Option<Box<E>> {
        self.endpoint.take()
    }

    pub fn context(&self) -> &str {
        &self.context
    }
}
