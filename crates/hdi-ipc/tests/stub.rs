//! Stub dispatch seen from the wire: raw request bytes in, status and reply
//! bytes out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use hdi_ipc::event::{ON_COMPLETE, ON_QUERY, QUERY_CALLBACK_DESCRIPTOR};
use hdi_ipc::{
    DispatchTable, HandlerResult, ObjectRegistry, Parcel, ParcelReader, QueryBatch,
    QueryCallback, QueryCallbackProxy, QueryComplete, RemoteObject, RemoteProxy,
    RemoteServiceStub, Status, query_callback_stub, read_result,
};
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const DESCRIPTOR: &str = "test.ICounter";

fn counting_stub(calls: Arc<AtomicU32>) -> RemoteServiceStub {
    let add_calls = calls.clone();
    let table = DispatchTable::builder(DESCRIPTOR)
        .route(1, move |(a, b): (i32, i32)| {
            add_calls.fetch_add(1, Ordering::SeqCst);
            a + b
        })
        .route(2, move |(name, tags): (String, Vec<String>)| {
            calls.fetch_add(1, Ordering::SeqCst);
            (name.len() + tags.len()) as i32
        })
        .build()
        .unwrap();
    RemoteServiceStub::new(Arc::new(table))
}

fn request(token: &str, code: u32) -> Bytes {
    let mut p = Parcel::new();
    p.write_interface_token(token);
    match code {
        1 => {
            p.write_i32(40);
            p.write_i32(2);
        }
        2 => {
            p.write_string("sensor");
            p.write_array(&["a".to_owned(), "b".to_owned()]);
        }
        _ => {}
    }
    p.freeze()
}

#[test]
fn wrong_token_is_rejected_for_every_code() {
    init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let stub = counting_stub(calls.clone());

    for code in [0, 1, 2, 3, u32::MAX] {
        for token in ["", "test.ICounte", "test.ICounterX", "TEST.ICOUNTER"] {
            let (status, reply) = stub.on_request(code, request(token, code));
            assert_eq!(status, Status::InvalidValue, "code {} token {:?}", code, token);
            assert!(reply.is_empty());
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn unreadable_token_is_rejected() {
    init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let stub = counting_stub(calls.clone());

    assert_eq!(stub.on_request(1, Bytes::new()).0, Status::InvalidValue);
    // Length prefix claims more bytes than follow.
    assert_eq!(
        stub.on_request(1, Bytes::from_static(&[200, 0, 0, 0, b'x'])).0,
        Status::InvalidValue
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn every_truncation_after_the_token_is_a_flatten_error() {
    init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let stub = counting_stub(calls.clone());
    let token_len = 4 + DESCRIPTOR.len();

    for code in [1, 2] {
        let full = request(DESCRIPTOR, code);
        for cut in token_len..full.len() {
            let (status, reply) = stub.on_request(code, full.slice(..cut));
            assert_eq!(status, Status::FlattenObject, "code {} cut at {}", code, cut);
            assert!(reply.is_empty());
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let (status, reply) = stub.on_request(1, request(DESCRIPTOR, 1));
    assert_eq!(status, Status::Ok);
    assert_eq!(read_result(&mut ParcelReader::new(reply)), Ok(42));
    let (status, reply) = stub.on_request(2, request(DESCRIPTOR, 2));
    assert_eq!(status, Status::Ok);
    assert_eq!(read_result(&mut ParcelReader::new(reply)), Ok(8));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn unknown_code_with_valid_token_is_unknown_transaction() {
    init_tracing();
    let stub = counting_stub(Arc::new(AtomicU32::new(0)));
    let (status, reply) = stub.on_request(77, request(DESCRIPTOR, 77));
    assert_eq!(status, Status::UnknownTransaction);
    assert!(reply.is_empty());
}

#[derive(Default)]
struct Collector {
    batches: Mutex<Vec<QueryBatch>>,
    completions: Mutex<Vec<QueryComplete>>,
}

impl QueryCallback for Collector {
    fn on_query(&self, batch: QueryBatch) -> HandlerResult {
        self.batches.lock().push(batch);
        0
    }

    fn on_complete(&self, done: QueryComplete) -> HandlerResult {
        self.completions.lock().push(done);
        0
    }
}

#[test]
fn query_then_complete() {
    init_tracing();
    let collector = Arc::new(Collector::default());
    let stub = query_callback_stub(collector.clone()).unwrap();

    let mut data = Parcel::new();
    data.write_interface_token(QUERY_CALLBACK_DESCRIPTOR);
    data.write_array(&["domainA".to_owned()]);
    data.write_array(&[42i64]);
    let (status, reply) = stub.on_request(ON_QUERY, data.freeze());
    assert_eq!(status, Status::Ok);
    assert_eq!(read_result(&mut ParcelReader::new(reply)), Ok(0));

    let mut data = Parcel::new();
    data.write_interface_token(QUERY_CALLBACK_DESCRIPTOR);
    data.write_i32(0);
    data.write_i32(1);
    let (status, reply) = stub.on_request(ON_COMPLETE, data.freeze());
    assert_eq!(status, Status::Ok);
    assert_eq!(read_result(&mut ParcelReader::new(reply)), Ok(0));

    assert_eq!(
        collector.batches.lock().as_slice(),
        &[QueryBatch {
            event_names: vec!["domainA".to_owned()],
            sequences: vec![42],
        }]
    );
    assert_eq!(
        collector.completions.lock().as_slice(),
        &[QueryComplete { reason: 0, total: 1 }]
    );
}

#[test]
fn query_callback_through_the_registry() {
    init_tracing();
    let collector = Arc::new(Collector::default());
    let object: Arc<dyn RemoteObject> = Arc::new(query_callback_stub(collector.clone()).unwrap());
    let registry = ObjectRegistry::new();
    let handle = registry.register(&object).unwrap();

    let proxy = QueryCallbackProxy::new(RemoteProxy::new(
        registry.clone(),
        handle.id(),
        QUERY_CALLBACK_DESCRIPTOR,
    ));
    let batch = QueryBatch {
        event_names: vec!["domainA".into(), "domainB".into()],
        sequences: vec![1, 2],
    };
    assert_eq!(proxy.on_query(&batch), Ok(0));
    assert_eq!(proxy.on_complete(0, 2), Ok(0));

    drop(handle);
    assert_eq!(proxy.on_complete(0, 2), Err(Status::InvalidObject));
    assert_eq!(collector.completions.lock().len(), 1);
}
