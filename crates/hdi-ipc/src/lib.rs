//! IPC dispatch for HDI services.
//!
//! Requests travel as [`Parcel`]s: little-endian records that open with the
//! target interface's descriptor as a token. A [`RemoteServiceStub`] checks
//! that token, decodes the whole request record, and runs the handler the
//! [`DispatchTable`] names for the transaction code.
//!
//! # Pieces
//!
//! - [`parcel`]: the wire format and the [`Encode`] / [`Decode`] traits.
//! - [`object`]: the in-process [`ObjectRegistry`] standing in for the
//!   transport, plus [`RemoteProxy`] for the calling side.
//! - [`stub`]: token-checked dispatch.
//! - [`listener`]: the service status listener exported to the service
//!   manager.
//! - [`event`]: event-service callback stubs and proxies.
//! - [`device`]: driver entry points and the host that runs them.
//! - [`smq`]: parcel form of shared-memory queue metadata.
//!
//! Handler result codes ride in the reply; the [`Status`] returned from
//! dispatch only describes whether the transaction itself went through.

pub mod device;
pub mod event;
pub mod listener;
pub mod object;
pub mod parcel;
pub mod smq;
pub mod status;
pub mod stub;

pub use device::{DeviceError, DeviceHost, DeviceIoService, DriverResult, StubDevice};
pub use event::{
    EventListener, EventListenerProxy, QueryBatch, QueryCallback, QueryCallbackProxy,
    QueryComplete, SysEvent, event_listener_stub, query_callback_stub,
};
pub use listener::{
    ListenerError, ServiceState, ServiceStatus, ServiceStatusListener,
    ServiceStatusListenerBuilder, ServiceStatusListenerProxy,
};
pub use object::{ObjectHandle, ObjectId, ObjectRegistry, RegistryError, RemoteObject, RemoteProxy};
pub use parcel::{Decode, Encode, Parcel, ParcelError, ParcelLimits, ParcelReader};
pub use status::Status;
pub use stub::{
    DispatchError, DispatchTable, DispatchTableBuilder, HandlerResult, RemoteServiceStub,
    RequestState, read_result,
};
