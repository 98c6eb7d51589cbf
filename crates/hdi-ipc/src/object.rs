//! In-process object registry.
//!
//! The registry plays the part of the transport: it hands out ids for
//! exported objects, resolves an id back to its object when a transaction
//! arrives, and forgets the id when the exporting side drops its handle.
//!
//! The registry only ever holds a [`Weak`] reference. The owning reference
//! stays with whoever created the object, and the [`ObjectHandle`] returned by
//! [`ObjectRegistry::register`] is the owner's proof of registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::parcel::{Encode, Parcel, ParcelReader};
use crate::status::Status;

/// Identifier of an exported object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Anything that can receive transactions.
pub trait RemoteObject: Send + Sync {
    /// Interface descriptor; requests must carry it as their token.
    fn descriptor(&self) -> &str;

    /// Handle one transaction. The returned status describes the transport
    /// outcome only.
    fn on_remote_request(&self, code: u32, data: &mut ParcelReader, reply: &mut Parcel) -> Status;
}

struct Entry {
    object: Weak<dyn RemoteObject>,
    descriptor: String,
}

struct Objects {
    entries: HashMap<ObjectId, Entry>,
    next_id: u64,
    limit: usize,
}

/// Shared, cloneable registry of exported objects.
#[derive(Clone)]
pub struct ObjectRegistry {
    inner: Arc<Mutex<Objects>>,
}

/// Default cap on live registrations.
pub const DEFAULT_OBJECT_LIMIT: usize = 4096;

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_OBJECT_LIMIT)
    }

    /// Registry refusing more than `limit` live objects.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Objects {
                entries: HashMap::new(),
                next_id: 1,
                limit,
            })),
        }
    }

    /// Export `object`. It stays reachable until the returned handle is
    /// dropped or the object itself is.
    pub fn register(&self, object: &Arc<dyn RemoteObject>) -> Result<ObjectHandle, RegistryError> {
        let descriptor = object.descriptor().to_owned();
        if descriptor.is_empty() {
            return Err(RegistryError::EmptyDescriptor);
        }

        let mut objects = self.inner.lock();
        objects.entries.retain(|_, e| e.object.strong_count() > 0);
        if objects.entries.len() >= objects.limit {
            return Err(RegistryError::Full {
                limit: objects.limit,
            });
        }

        let id = ObjectId(objects.next_id);
        objects.next_id += 1;
        objects.entries.insert(
            id,
            Entry {
                object: Arc::downgrade(object),
                descriptor: descriptor.clone(),
            },
        );
        drop(objects);

        debug!(%id, %descriptor, "registered remote object");
        Ok(ObjectHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Remove `id`. Returns whether it was registered.
    pub fn unregister(&self, id: ObjectId) -> bool {
        let removed = self.inner.lock().entries.remove(&id).is_some();
        if removed {
            debug!(%id, "unregistered remote object");
        }
        removed
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.resolve(id).is_some()
    }

    pub fn descriptor(&self, id: ObjectId) -> Option<String> {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|e| e.descriptor.clone())
    }

    /// Live registrations.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.object.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, id: ObjectId) -> Option<Arc<dyn RemoteObject>> {
        let mut objects = self.inner.lock();
        let object = objects.entries.get(&id)?.object.upgrade();
        if object.is_none() {
            objects.entries.remove(&id);
        }
        object
    }

    /// Deliver a transaction to `id`.
    ///
    /// The object runs without the registry lock held, so it may itself
    /// register objects or transact.
    pub fn transact(&self, id: ObjectId, code: u32, data: Bytes) -> (Status, Bytes) {
        let Some(object) = self.resolve(id) else {
            trace!(%id, code, "transaction to dead or unknown object");
            return (Status::InvalidObject, Bytes::new());
        };
        let mut reader = ParcelReader::new(data);
        let mut reply = Parcel::new();
        let status = object.on_remote_request(code, &mut reader, &mut reply);
        (status, reply.freeze())
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("live", &self.len())
            .finish()
    }
}

/// Owning side of a registration. Dropping it detaches the object.
#[derive(Debug)]
pub struct ObjectHandle {
    id: ObjectId,
    registry: Weak<Mutex<Objects>>,
}

impl ObjectHandle {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Detach now rather than at drop.
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade()
            && inner.lock().entries.remove(&self.id).is_some()
        {
            debug!(id = %self.id, "detached remote object");
        }
    }
}

impl fmt::Debug for Objects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Objects")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Client-side view of a remote object.
#[derive(Debug, Clone)]
pub struct RemoteProxy {
    registry: ObjectRegistry,
    id: ObjectId,
    descriptor: String,
}

impl RemoteProxy {
    pub fn new(registry: ObjectRegistry, id: ObjectId, descriptor: impl Into<String>) -> Self {
        Self {
            registry,
            id,
            descriptor: descriptor.into(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn is_alive(&self) -> bool {
        self.registry.contains(self.id)
    }

    /// Build a request (token, then `body`) and send it. Returns the reply on
    /// [`Status::Ok`].
    pub fn send_request<B: Encode + ?Sized>(
        &self,
        code: u32,
        body: &B,
    ) -> Result<ParcelReader, Status> {
        let mut data = Parcel::new();
        data.write_interface_token(&self.descriptor);
        data.write(body);
        self.send_raw(code, data.freeze())
    }

    /// Send pre-built request bytes unchanged.
    pub fn send_raw(&self, code: u32, data: Bytes) -> Result<ParcelReader, Status> {
        let (status, reply) = self.registry.transact(self.id, code, data);
        status.into_result()?;
        Ok(ParcelReader::new(reply))
    }
}

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The live-object limit is reached.
    Full { limit: usize },
    /// Objects must name their interface.
    EmptyDescriptor,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Full { limit } => {
                write!(f, "object registry is full ({} live objects)", limit)
            }
            RegistryError::EmptyDescriptor => write!(f, "object has an empty descriptor"),
        }
    }
}

impl std::error::Error for RegistryError {}
