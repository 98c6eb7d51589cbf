//! Interface-token checked request dispatch.
//!
//! A [`DispatchTable`] maps transaction codes to handlers and is built once,
//! when the service binds, then shared read-only. [`RemoteServiceStub`] runs
//! each request through it:
//!
//! 1. read the interface token and compare it with the table's descriptor;
//!    a mismatch is rejected with [`Status::InvalidValue`] before any code is
//!    looked at;
//! 2. look up the code; unknown codes go to the fallback;
//! 3. decode the complete request record; any decode failure is rejected
//!    with [`Status::FlattenObject`] and the handler never runs;
//! 4. run the handler and write its result code into the reply. The
//!    transport status is [`Status::Ok`] whatever the handler returned.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::object::RemoteObject;
use crate::parcel::{Decode, Parcel, ParcelReader};
use crate::status::Status;

/// Result code a handler reports in the reply (0 for success).
pub type HandlerResult = i32;

type RouteFn = dyn Fn(&mut ParcelReader, &mut Parcel) -> Status + Send + Sync;
type FallbackFn = dyn Fn(u32, &mut ParcelReader, &mut Parcel) -> Status + Send + Sync;

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    TokenValidated,
    Dispatched,
    Replied,
    Rejected,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Idle => "idle",
            RequestState::TokenValidated => "token-validated",
            RequestState::Dispatched => "dispatched",
            RequestState::Replied => "replied",
            RequestState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Immutable code → handler mapping for one interface.
pub struct DispatchTable {
    descriptor: String,
    routes: HashMap<u32, Box<RouteFn>>,
    fallback: Box<FallbackFn>,
}

impl DispatchTable {
    pub fn builder(descriptor: impl Into<String>) -> DispatchTableBuilder {
        DispatchTableBuilder {
            descriptor: descriptor.into(),
            routes: HashMap::new(),
            fallback: None,
            duplicate: None,
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn has_route(&self, code: u32) -> bool {
        self.routes.contains_key(&code)
    }

    pub fn codes(&self) -> impl Iterator<Item = u32> + '_ {
        self.routes.keys().copied()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<u32> = self.codes().collect();
        codes.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("descriptor", &self.descriptor)
            .field("codes", &codes)
            .finish()
    }
}

/// Builder for [`DispatchTable`].
pub struct DispatchTableBuilder {
    descriptor: String,
    routes: HashMap<u32, Box<RouteFn>>,
    fallback: Option<Box<FallbackFn>>,
    duplicate: Option<u32>,
}

impl DispatchTableBuilder {
    /// Route `code` to `handler` after decoding a complete `R`.
    ///
    /// The handler's result is written to the reply as an `i32`.
    pub fn route<R, F>(self, code: u32, handler: F) -> Self
    where
        R: Decode + 'static,
        F: Fn(R) -> HandlerResult + Send + Sync + 'static,
    {
        self.route_with_reply(code, move |request: R, _reply: &mut Parcel| handler(request))
    }

    /// Like [`route`](Self::route), but the handler may append to the reply
    /// after its result code.
    pub fn route_with_reply<R, F>(self, code: u32, handler: F) -> Self
    where
        R: Decode + 'static,
        F: Fn(R, &mut Parcel) -> HandlerResult + Send + Sync + 'static,
    {
        self.raw_route(code, move |data, reply| {
            let request = match data.read::<R>() {
                Ok(request) => request,
                Err(err) => {
                    warn!(code, error = %err, "rejecting malformed request");
                    return Status::FlattenObject;
                }
            };
            let mut out = Parcel::new();
            let result = handler(request, &mut out);
            reply.write_i32(result);
            reply.append_raw(out.as_bytes());
            Status::Ok
        })
    }

    /// Route `code` to a handler that reads the payload itself.
    pub fn raw_route<F>(mut self, code: u32, handler: F) -> Self
    where
        F: Fn(&mut ParcelReader, &mut Parcel) -> Status + Send + Sync + 'static,
    {
        if self.routes.insert(code, Box::new(handler)).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(code);
        }
        self
    }

    /// Handler for codes without a route. The token has already been checked.
    pub fn fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn(u32, &mut ParcelReader, &mut Parcel) -> Status + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> Result<DispatchTable, DispatchError> {
        if self.descriptor.is_empty() {
            return Err(DispatchError::EmptyDescriptor);
        }
        if let Some(code) = self.duplicate {
            return Err(DispatchError::DuplicateRoute(code));
        }
        Ok(DispatchTable {
            descriptor: self.descriptor,
            routes: self.routes,
            fallback: self
                .fallback
                .unwrap_or_else(|| Box::new(unknown_transaction)),
        })
    }
}

fn unknown_transaction(_code: u32, _data: &mut ParcelReader, _reply: &mut Parcel) -> Status {
    Status::UnknownTransaction
}

/// Errors building a [`DispatchTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Two routes for one code.
    DuplicateRoute(u32),
    EmptyDescriptor,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::DuplicateRoute(code) => {
                write!(f, "transaction code {} is routed twice", code)
            }
            DispatchError::EmptyDescriptor => write!(f, "interface descriptor is empty"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Server-side endpoint of one interface.
#[derive(Debug, Clone)]
pub struct RemoteServiceStub {
    table: Arc<DispatchTable>,
}

impl RemoteServiceStub {
    pub fn new(table: Arc<DispatchTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    /// Handle one request given as raw bytes. Returns the transport status
    /// and the reply bytes.
    pub fn on_request(&self, code: u32, data: Bytes) -> (Status, Bytes) {
        let mut reader = ParcelReader::new(data);
        let mut reply = Parcel::new();
        let status = self.dispatch(code, &mut reader, &mut reply);
        (status, reply.freeze())
    }

    /// Handle one request into `reply`.
    ///
    /// On any status other than [`Status::Ok`] the reply is left as it was.
    pub fn dispatch(&self, code: u32, data: &mut ParcelReader, reply: &mut Parcel) -> Status {
        let descriptor = self.table.descriptor();
        trace!(code, state = %RequestState::Idle, "request received");

        match data.read_interface_token() {
            Some(token) if token == descriptor => {}
            token => {
                warn!(
                    code,
                    expected = descriptor,
                    got = token.as_deref().unwrap_or("<unreadable>"),
                    "interface token mismatch"
                );
                trace!(code, state = %RequestState::Rejected, "request rejected");
                return Status::InvalidValue;
            }
        }
        trace!(code, state = %RequestState::TokenValidated, "token accepted");

        let mut out = Parcel::new();
        let status = match self.table.routes.get(&code) {
            Some(route) => {
                trace!(code, state = %RequestState::Dispatched, "routing request");
                route(data, &mut out)
            }
            None => {
                trace!(code, state = %RequestState::Dispatched, "no route, using fallback");
                (self.table.fallback)(code, data, &mut out)
            }
        };

        if status.is_ok() {
            reply.append_raw(out.as_bytes());
            trace!(code, state = %RequestState::Replied, "request replied");
        } else {
            trace!(code, state = %RequestState::Rejected, %status, "request rejected");
        }
        status
    }
}

impl RemoteObject for RemoteServiceStub {
    fn descriptor(&self) -> &str {
        self.table.descriptor()
    }

    fn on_remote_request(&self, code: u32, data: &mut ParcelReader, reply: &mut Parcel) -> Status {
        self.dispatch(code, data, reply)
    }
}

/// Read the handler result code at the head of a reply.
pub fn read_result(reply: &mut ParcelReader) -> Result<HandlerResult, Status> {
    reply.read_i32().map_err(Status::from)
}
