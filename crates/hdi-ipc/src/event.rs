//! Event-service callback interfaces.
//!
//! Two interfaces a client exports so the event service can call it back:
//! a query callback that receives query results in batches, and an event
//! listener that receives individual events. Each comes with a stub builder
//! for the exporting side and a proxy for the calling side.

use std::sync::Arc;

use crate::object::RemoteProxy;
use crate::parcel::{Decode, Encode, Parcel, ParcelError, ParcelReader};
use crate::status::Status;
use crate::stub::{DispatchError, DispatchTable, HandlerResult, RemoteServiceStub, read_result};

pub const QUERY_CALLBACK_DESCRIPTOR: &str = "OHOS.HiviewDFX.IQueryBaseCallback";
pub const ON_QUERY: u32 = 1;
pub const ON_COMPLETE: u32 = 2;

pub const EVENT_LISTENER_DESCRIPTOR: &str = "OHOS.HiviewDFX.IHiSysEventListener";
pub const ON_EVENT: u32 = 1;
pub const ON_SERVICE_DIED: u32 = 2;

/// One batch of query results: `[stringArray names][int64Array seqs]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBatch {
    pub event_names: Vec<String>,
    pub sequences: Vec<i64>,
}

impl Encode for QueryBatch {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_array(&self.event_names);
        parcel.write_array(&self.sequences);
    }
}

impl Decode for QueryBatch {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
        Ok(Self {
            event_names: reader.read_array()?,
            sequences: reader.read_array()?,
        })
    }
}

/// End of a query: `[i32 reason][i32 total]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryComplete {
    pub reason: i32,
    pub total: i32,
}

impl Encode for QueryComplete {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_i32(self.reason);
        parcel.write_i32(self.total);
    }
}

impl Decode for QueryComplete {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
        Ok(Self {
            reason: reader.read_i32()?,
            total: reader.read_i32()?,
        })
    }
}

/// Receiver of query results.
pub trait QueryCallback: Send + Sync {
    fn on_query(&self, batch: QueryBatch) -> HandlerResult;
    fn on_complete(&self, done: QueryComplete) -> HandlerResult;
}

/// Stub exporting `callback` under [`QUERY_CALLBACK_DESCRIPTOR`].
pub fn query_callback_stub(
    callback: Arc<dyn QueryCallback>,
) -> Result<RemoteServiceStub, DispatchError> {
    let on_complete = callback.clone();
    let table = DispatchTable::builder(QUERY_CALLBACK_DESCRIPTOR)
        .route(ON_QUERY, move |batch: QueryBatch| callback.on_query(batch))
        .route(ON_COMPLETE, move |done: QueryComplete| {
            on_complete.on_complete(done)
        })
        .build()?;
    Ok(RemoteServiceStub::new(Arc::new(table)))
}

/// Caller side of a remote [`QueryCallback`].
#[derive(Debug, Clone)]
pub struct QueryCallbackProxy {
    remote: RemoteProxy,
}

impl QueryCallbackProxy {
    pub fn new(remote: RemoteProxy) -> Self {
        Self { remote }
    }

    pub fn on_query(&self, batch: &QueryBatch) -> Result<HandlerResult, Status> {
        read_result(&mut self.remote.send_request(ON_QUERY, batch)?)
    }

    pub fn on_complete(&self, reason: i32, total: i32) -> Result<HandlerResult, Status> {
        let done = QueryComplete { reason, total };
        read_result(&mut self.remote.send_request(ON_COMPLETE, &done)?)
    }
}

/// A system event: `[string domain][string name][u32 type][string detail]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysEvent {
    pub domain: String,
    pub name: String,
    pub event_type: u32,
    pub detail: String,
}

impl Encode for SysEvent {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_string(&self.domain);
        parcel.write_string(&self.name);
        parcel.write_u32(self.event_type);
        parcel.write_string(&self.detail);
    }
}

impl Decode for SysEvent {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
        Ok(Self {
            domain: reader.read_string()?,
            name: reader.read_string()?,
            event_type: reader.read_u32()?,
            detail: reader.read_string()?,
        })
    }
}

/// Receiver of live events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: SysEvent) -> HandlerResult;
    /// The event service went away.
    fn on_service_died(&self) -> HandlerResult;
}

/// Stub exporting `listener` under [`EVENT_LISTENER_DESCRIPTOR`].
pub fn event_listener_stub(
    listener: Arc<dyn EventListener>,
) -> Result<RemoteServiceStub, DispatchError> {
    let on_died = listener.clone();
    let table = DispatchTable::builder(EVENT_LISTENER_DESCRIPTOR)
        .route(ON_EVENT, move |event: SysEvent| listener.on_event(event))
        .route(ON_SERVICE_DIED, move |()| on_died.on_service_died())
        .build()?;
    Ok(RemoteServiceStub::new(Arc::new(table)))
}

/// Caller side of a remote [`EventListener`].
#[derive(Debug, Clone)]
pub struct EventListenerProxy {
    remote: RemoteProxy,
}

impl EventListenerProxy {
    pub fn new(remote: RemoteProxy) -> Self {
        Self { remote }
    }

    pub fn on_event(&self, event: &SysEvent) -> Result<HandlerResult, Status> {
        read_result(&mut self.remote.send_request(ON_EVENT, event)?)
    }

    pub fn on_service_died(&self) -> Result<HandlerResult, Status> {
        read_result(&mut self.remote.send_request(ON_SERVICE_DIED, &())?)
    }
}
