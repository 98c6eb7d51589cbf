//! Driver entry points and the host that runs them.
//!
//! A driver implements [`DeviceIoService`]. The [`DeviceHost`] brings it up
//! with `bind` then `init`, routes requests to its `dispatch`, and calls
//! `release` when the driver is removed or the host shuts down. A driver whose
//! `init` fails is released immediately and never becomes reachable.

use std::fmt;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::parcel::{Parcel, ParcelReader};
use crate::status::Status;
use crate::stub::RemoteServiceStub;

/// Driver-specific failure code.
pub type DriverResult = Result<(), i32>;

/// A device driver's service surface.
pub trait DeviceIoService: Send + Sync {
    /// Unique module name the host routes by.
    fn module_name(&self) -> &str;

    /// Attach to the device object; allocate what `dispatch` needs.
    fn bind(&mut self) -> DriverResult;

    /// Bring the hardware up.
    fn init(&mut self) -> DriverResult;

    /// Undo `bind` and `init`. Called at most once per successful `bind`.
    fn release(&mut self);

    fn dispatch(&self, code: u32, data: &mut ParcelReader, reply: &mut Parcel) -> Status;
}

/// Runs drivers and routes requests to them.
#[derive(Default)]
pub struct DeviceHost {
    // Registration order; released in reverse.
    drivers: Vec<Box<dyn DeviceIoService>>,
}

impl DeviceHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind and init `driver`, then make it reachable.
    pub fn add(&mut self, mut driver: Box<dyn DeviceIoService>) -> Result<(), DeviceError> {
        let module = driver.module_name().to_owned();
        if self.find(&module).is_some() {
            return Err(DeviceError::AlreadyRegistered(module));
        }

        if let Err(code) = driver.bind() {
            warn!(%module, code, "driver bind failed");
            return Err(DeviceError::Bind { module, code });
        }
        debug!(%module, "driver bound");

        if let Err(code) = driver.init() {
            warn!(%module, code, "driver init failed, releasing");
            driver.release();
            return Err(DeviceError::Init { module, code });
        }
        debug!(%module, "driver initialized");

        self.drivers.push(driver);
        Ok(())
    }

    /// Release and drop the driver named `module`.
    pub fn remove(&mut self, module: &str) -> Result<(), DeviceError> {
        let index = self
            .drivers
            .iter()
            .position(|d| d.module_name() == module)
            .ok_or_else(|| DeviceError::UnknownService(module.to_owned()))?;
        let mut driver = self.drivers.remove(index);
        driver.release();
        debug!(%module, "driver released");
        Ok(())
    }

    fn find(&self, module: &str) -> Option<&dyn DeviceIoService> {
        self.drivers
            .iter()
            .find(|d| d.module_name() == module)
            .map(|d| &**d)
    }

    pub fn contains(&self, module: &str) -> bool {
        self.find(module).is_some()
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.drivers.iter().map(|d| d.module_name())
    }

    /// Route a request to `module`. An unknown module is
    /// [`Status::InvalidObject`].
    pub fn dispatch(&self, module: &str, code: u32, data: Bytes) -> (Status, Bytes) {
        let Some(driver) = self.find(module) else {
            return (Status::InvalidObject, Bytes::new());
        };
        let mut reader = ParcelReader::new(data);
        let mut reply = Parcel::new();
        let status = driver.dispatch(code, &mut reader, &mut reply);
        (status, reply.freeze())
    }

    /// Release every driver, newest first.
    pub fn shutdown(&mut self) {
        while let Some(mut driver) = self.drivers.pop() {
            driver.release();
            debug!(module = driver.module_name(), "driver released");
        }
    }
}

impl Drop for DeviceHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DeviceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHost")
            .field("modules", &self.modules().collect::<Vec<_>>())
            .finish()
    }
}

/// A driver whose dispatch is a [`RemoteServiceStub`].
///
/// Bind and init succeed unconditionally; drivers that need hardware setup
/// implement [`DeviceIoService`] themselves and can still delegate dispatch
/// to a stub.
pub struct StubDevice {
    module: String,
    stub: RemoteServiceStub,
    bound: bool,
}

impl StubDevice {
    pub fn new(module: impl Into<String>, stub: RemoteServiceStub) -> Self {
        Self {
            module: module.into(),
            stub,
            bound: false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }
}

impl DeviceIoService for StubDevice {
    fn module_name(&self) -> &str {
        &self.module
    }

    fn bind(&mut self) -> DriverResult {
        self.bound = true;
        Ok(())
    }

    fn init(&mut self) -> DriverResult {
        Ok(())
    }

    fn release(&mut self) {
        self.bound = false;
    }

    fn dispatch(&self, code: u32, data: &mut ParcelReader, reply: &mut Parcel) -> Status {
        if !self.bound {
            return Status::InvalidObject;
        }
        self.stub.dispatch(code, data, reply)
    }
}

/// Failures managing drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    AlreadyRegistered(String),
    Bind { module: String, code: i32 },
    /// Init failed; the driver was released.
    Init { module: String, code: i32 },
    UnknownService(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::AlreadyRegistered(m) => write!(f, "driver {} is already registered", m),
            DeviceError::Bind { module, code } => {
                write!(f, "driver {} failed to bind ({})", module, code)
            }
            DeviceError::Init { module, code } => {
                write!(f, "driver {} failed to init ({})", module, code)
            }
            DeviceError::UnknownService(m) => write!(f, "no driver named {}", m),
        }
    }
}

impl std::error::Error for DeviceError {}
