//! Service status listeners.
//!
//! A [`ServiceStatusListener`] is an exported object the service manager
//! calls back whenever a service starts, changes, or stops. The owner builds
//! it, marshals a reference to it into a registration request, and frees it
//! when done. The peer that receives the reference turns it into a
//! [`ServiceStatusListenerProxy`] with [`ServiceStatusListener::unmarshal`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::object::{ObjectHandle, ObjectId, ObjectRegistry, RegistryError, RemoteObject, RemoteProxy};
use crate::parcel::{Decode, Encode, Parcel, ParcelError, ParcelReader};
use crate::status::Status;
use crate::stub::{DispatchError, DispatchTable, RemoteServiceStub};

pub const SERVICE_STATUS_LISTENER_DESCRIPTOR: &str = "HDI.IServiceStatusListener.V1_0";

/// The one notification code a listener understands.
pub const ON_RECEIVE: u32 = 1;

/// Lifecycle transition being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServiceState {
    Start = 0,
    Change = 1,
    Stop = 2,
}

impl TryFrom<u16> for ServiceState {
    type Error = ParcelError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ServiceState::Start),
            1 => Ok(ServiceState::Change),
            2 => Ok(ServiceState::Stop),
            other => Err(ParcelError::OutOfRange(u64::from(other))),
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Start => write!(f, "start"),
            ServiceState::Change => write!(f, "change"),
            ServiceState::Stop => write!(f, "stop"),
        }
    }
}

/// A status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub service_name: String,
    pub device_class: u16,
    pub status: ServiceState,
    pub info: String,
}

impl ServiceStatus {
    pub fn new(service_name: impl Into<String>, device_class: u16, status: ServiceState) -> Self {
        Self {
            service_name: service_name.into(),
            device_class,
            status,
            info: String::new(),
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }
}

impl Encode for ServiceStatus {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_string(&self.service_name);
        parcel.write(&self.device_class);
        parcel.write(&(self.status as u16));
        parcel.write_string(&self.info);
    }
}

impl Decode for ServiceStatus {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
        let service_name = reader.read_string()?;
        let device_class = reader.read::<u16>()?;
        let status = ServiceState::try_from(reader.read::<u16>()?)?;
        let info = reader.read_string()?;
        Ok(Self {
            service_name,
            device_class,
            status,
            info,
        })
    }
}

type StatusCallback = dyn Fn(&ServiceStatus) + Send + Sync;

#[derive(Default)]
struct CallbackSlot {
    callback: RwLock<Option<Arc<StatusCallback>>>,
}

impl CallbackSlot {
    fn on_notify(&self, status: &ServiceStatus) -> Status {
        // Clone out so the callback runs without the lock held.
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => {
                callback(status);
                Status::Ok
            }
            None => Status::InvalidObject,
        }
    }
}

/// Builder for [`ServiceStatusListener`]. Either every step succeeds or
/// nothing stays registered.
pub struct ServiceStatusListenerBuilder {
    registry: ObjectRegistry,
    descriptor: String,
    callback: Option<Arc<StatusCallback>>,
}

impl ServiceStatusListenerBuilder {
    pub fn callback(mut self, f: impl Fn(&ServiceStatus) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(f));
        self
    }

    /// Override the interface descriptor.
    pub fn descriptor(mut self, descriptor: impl Into<String>) -> Self {
        self.descriptor = descriptor.into();
        self
    }

    pub fn build(self) -> Result<ServiceStatusListener, ListenerError> {
        let slot = Arc::new(CallbackSlot {
            callback: RwLock::new(self.callback),
        });

        let notify_slot = slot.clone();
        let table = DispatchTable::builder(self.descriptor)
            .raw_route(ON_RECEIVE, move |data, reply| {
                let status = match data.read::<ServiceStatus>() {
                    Ok(status) => status,
                    Err(_) => return Status::FlattenObject,
                };
                let outcome = notify_slot.on_notify(&status);
                if outcome.is_ok() {
                    reply.write_i32(0);
                }
                outcome
            })
            .build()?;

        // Dropping `object` on any later failure releases everything built so
        // far; nothing has been exported yet.
        let object: Arc<dyn RemoteObject> = Arc::new(RemoteServiceStub::new(Arc::new(table)));
        let handle = self.registry.register(&object)?;

        debug!(id = %handle.id(), "service status listener created");
        Ok(ServiceStatusListener {
            handle: Some(handle),
            object,
            slot,
        })
    }
}

/// An exported status observer.
pub struct ServiceStatusListener {
    handle: Option<ObjectHandle>,
    object: Arc<dyn RemoteObject>,
    slot: Arc<CallbackSlot>,
}

impl ServiceStatusListener {
    pub fn builder(registry: &ObjectRegistry) -> ServiceStatusListenerBuilder {
        ServiceStatusListenerBuilder {
            registry: registry.clone(),
            descriptor: SERVICE_STATUS_LISTENER_DESCRIPTOR.to_owned(),
            callback: None,
        }
    }

    /// Transport id, while attached.
    pub fn id(&self) -> Option<ObjectId> {
        self.handle.as_ref().map(ObjectHandle::id)
    }

    pub fn descriptor(&self) -> &str {
        self.object.descriptor()
    }

    /// Install or replace the callback.
    pub fn set_callback(&self, f: impl Fn(&ServiceStatus) + Send + Sync + 'static) {
        *self.slot.callback.write() = Some(Arc::new(f));
    }

    pub fn clear_callback(&self) {
        *self.slot.callback.write() = None;
    }

    /// Write a reference to this listener into `parcel`.
    ///
    /// Returns `false`, writing nothing, once the listener is detached.
    pub fn marshal(&self, parcel: &mut Parcel) -> bool {
        match self.id() {
            Some(id) => {
                parcel.write_object(Some(id));
                true
            }
            None => false,
        }
    }

    /// Deliver a notification directly, as the dispatch route would.
    pub fn on_notify(&self, status: &ServiceStatus) -> Status {
        self.slot.on_notify(status)
    }

    /// Stop receiving transactions but keep the object.
    pub fn detach(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(id = %handle.id(), "service status listener detached");
        }
    }

    /// Detach from the transport, then release the listener.
    pub fn free(mut self) {
        self.detach();
    }

    /// Read a listener reference sent by its owner.
    pub fn unmarshal(
        reader: &mut ParcelReader,
        registry: &ObjectRegistry,
    ) -> Result<ServiceStatusListenerProxy, ListenerError> {
        let id = reader.read_object()?.ok_or(ListenerError::NullReference)?;
        let descriptor = registry
            .descriptor(id)
            .unwrap_or_else(|| SERVICE_STATUS_LISTENER_DESCRIPTOR.to_owned());
        Ok(ServiceStatusListenerProxy {
            remote: RemoteProxy::new(registry.clone(), id, descriptor),
        })
    }
}

impl Drop for ServiceStatusListener {
    fn drop(&mut self) {
        // The transport must forget the object before the object goes away.
        self.detach();
    }
}

impl fmt::Debug for ServiceStatusListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceStatusListener")
            .field("id", &self.id())
            .field("descriptor", &self.descriptor())
            .finish()
    }
}

/// Peer-side view of a [`ServiceStatusListener`].
#[derive(Debug, Clone)]
pub struct ServiceStatusListenerProxy {
    remote: RemoteProxy,
}

impl ServiceStatusListenerProxy {
    pub fn notify(&self, status: &ServiceStatus) -> Result<(), Status> {
        self.remote.send_request(ON_RECEIVE, status).map(|_| ())
    }

    pub fn remote(&self) -> &RemoteProxy {
        &self.remote
    }
}

/// Failures creating or unmarshaling a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    Dispatch(DispatchError),
    Registry(RegistryError),
    Parcel(ParcelError),
    /// The parcel carried a null object reference.
    NullReference,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Dispatch(e) => write!(f, "listener dispatch table: {}", e),
            ListenerError::Registry(e) => write!(f, "listener registration: {}", e),
            ListenerError::Parcel(e) => write!(f, "listener reference: {}", e),
            ListenerError::NullReference => write!(f, "null listener reference"),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Dispatch(e) => Some(e),
            ListenerError::Registry(e) => Some(e),
            ListenerError::Parcel(e) => Some(e),
            ListenerError::NullReference => None,
        }
    }
}

impl From<DispatchError> for ListenerError {
    fn from(e: DispatchError) -> Self {
        ListenerError::Dispatch(e)
    }
}

impl From<RegistryError> for ListenerError {
    fn from(e: RegistryError) -> Self {
        ListenerError::Registry(e)
    }
}

impl From<ParcelError> for ListenerError {
    fn from(e: ParcelError) -> Self {
        ListenerError::Parcel(e)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn failed_registration_leaves_nothing_behind() {
        let registry = ObjectRegistry::with_limit(0);
        let err = ServiceStatusListener::builder(&registry)
            .callback(|_| {})
            .build()
            .unwrap_err();
        assert_eq!(err, ListenerError::Registry(RegistryError::Full { limit: 0 }));
        assert!(registry.is_empty());
    }

    #[test]
    fn empty_descriptor_fails_before_registration() {
        let registry = ObjectRegistry::new();
        let err = ServiceStatusListener::builder(&registry)
            .descriptor("")
            .build()
            .unwrap_err();
        assert_eq!(err, ListenerError::Dispatch(DispatchError::EmptyDescriptor));
        assert!(registry.is_empty());
    }

    #[test]
    fn notify_without_callback_is_invalid_object() {
        let registry = ObjectRegistry::new();
        let listener = ServiceStatusListener::builder(&registry).build().unwrap();
        let status = ServiceStatus::new("camera", 2, ServiceState::Start);
        assert_eq!(listener.on_notify(&status), Status::InvalidObject);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        listener.set_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(listener.on_notify(&status), Status::Ok);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_listener_does_not_marshal() {
        let registry = ObjectRegistry::new();
        let mut listener = ServiceStatusListener::builder(&registry).build().unwrap();
        let id = listener.id().unwrap();

        listener.detach();
        let mut parcel = Parcel::new();
        assert!(!listener.marshal(&mut parcel));
        assert!(parcel.is_empty());
        assert!(!registry.contains(id));
    }

    #[test]
    fn status_record_round_trips_through_a_parcel() {
        let status = ServiceStatus::new("vibrator", 7, ServiceState::Change).with_info("v1.1");
        let mut parcel = Parcel::new();
        parcel.write(&status);
        assert_eq!(parcel.into_reader().read::<ServiceStatus>(), Ok(status));
    }

    #[test]
    fn unknown_state_is_rejected() {
        let mut parcel = Parcel::new();
        parcel.write_string("svc");
        parcel.write_u32(1);
        parcel.write_u32(9);
        parcel.write_string("");
        assert_eq!(
            parcel.into_reader().read::<ServiceStatus>(),
            Err(ParcelError::OutOfRange(9))
        );
    }

    #[test]
    fn null_reference_does_not_unmarshal() {
        let registry = ObjectRegistry::new();
        let mut parcel = Parcel::new();
        parcel.write_object(None);
        let err = ServiceStatusListener::unmarshal(&mut parcel.into_reader(), &registry).unwrap_err();
        assert_eq!(err, ListenerError::NullReference);
    }
}
