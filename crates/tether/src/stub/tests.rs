//! Unit tests for the client stub against a scripted host

use super::*;
use futures::StreamExt;
use serde_json::json;
use tether_proto::{ErrorDetails, Response, StreamEvent};
use tether_transport::{Listener, MemoryTransport};
use tokio::time::{sleep, timeout, Duration};

fn descriptor() -> Descriptor {
    Descriptor::builder("calc")
        .value("count")
        .function("add")
        .value_stream("ticks")
        .function_stream("range")
        .build()
        .unwrap()
}

/// Client stub plus the raw host end of its transport
struct Fixture {
    stub: Stub,
    host: MemoryTransport,
    client: Arc<MemoryTransport>,
    requests: Listener,
}

impl Fixture {
    fn new() -> Self {
        let (host, client) = MemoryTransport::pair();
        let client = Arc::new(client);
        let requests = host.listen(&Address::channel("calc")).unwrap();
        let stub = Stub::with_default_streams(descriptor(), client.clone()).unwrap();
        Self { stub, host, client, requests }
    }

    async fn next_request(&mut self) -> Request {
        match timeout(Duration::from_secs(1), self.requests.recv()).await.unwrap() {
            Some(Message::Request(request)) => request,
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn reply(&self, request: &Request, response: Response) {
        self.host
            .send(&request.reply_address(), Message::response(response))
            .unwrap();
    }

    fn push(&self, request: &Request, event: StreamEvent) {
        self.host
            .send(&request.reply_address(), Message::stream(event))
            .unwrap();
    }
}

#[test]
fn test_streams_require_a_constructor() {
    let (_host, client) = MemoryTransport::pair();
    let err = Stub::new(descriptor(), None, Arc::new(client)).unwrap_err();
    assert!(matches!(err, BridgeError::MissingStreamConstructor { ref channel } if channel == "calc"));

    let (_host, client) = MemoryTransport::pair();
    let plain = Descriptor::builder("plain").function("add").build().unwrap();
    assert!(Stub::new(plain, None, Arc::new(client)).is_ok());
}

#[tokio::test]
async fn test_value_access_is_memoized() {
    let mut fixture = Fixture::new();

    let first = fixture.stub.value("count").unwrap();
    let second = fixture.stub.value("count").unwrap();
    assert!(first.ptr_eq(&second));

    let request = fixture.next_request().await;
    assert_eq!(request.kind(), "get");
    assert_eq!(request.prop_key(), Some("count"));
    fixture.reply(&request, Response::result(request.id(), json!(3)));

    assert_eq!(first.await.unwrap(), json!(3));
    assert_eq!(second.decode::<i64>().await.unwrap(), 3);

    // only one request was ever sent
    assert!(fixture.requests.try_recv().is_err());
}

#[tokio::test]
async fn test_function_calls_are_independent() {
    let mut fixture = Fixture::new();
    let add = fixture.stub.function("add").unwrap();
    assert!(add.ptr_eq(&fixture.stub.function("add").unwrap()));

    let nine = add.call(vec![json!(4), json!(5)]);
    let eleven = add.call(vec![json!(4), json!(7)]);
    assert_ne!(nine.request_id(), eleven.request_id());

    let first = fixture.next_request().await;
    let second = fixture.next_request().await;
    // reply out of order
    fixture.reply(&second, Response::result(second.id(), json!(11)));
    fixture.reply(&first, Response::result(first.id(), json!(9)));

    assert_eq!(nine.await.unwrap(), json!(9));
    assert_eq!(eleven.await.unwrap(), json!(11));
    assert_eq!(fixture.client.listener_count(), 0);
}

#[tokio::test]
async fn test_error_replies_reject() {
    let mut fixture = Fixture::new();
    let call = fixture.stub.function("add").unwrap().call(vec![]);

    let request = fixture.next_request().await;
    fixture.reply(
        &request,
        Response::error(request.id(), ErrorDetails::new("TypeError", "bad operands")),
    );

    let err = call.await.unwrap_err();
    assert_eq!(err.kind(), "TypeError");
    assert_eq!(err.to_string(), "TypeError: bad operands");
}

#[tokio::test]
async fn test_undeclared_and_mismatched_properties() {
    let fixture = Fixture::new();
    assert!(fixture.stub.get("secret").is_none());
    assert!(fixture.stub.function("count").is_none());
    assert!(fixture.stub.value("add").is_none());
    assert_eq!(fixture.stub.get("ticks").unwrap().kind(), PropertyKind::ValueStream);
}

#[tokio::test]
async fn test_set_is_rejected() {
    let fixture = Fixture::new();
    let err = fixture.stub.set("count", json!(5)).unwrap_err();
    assert_eq!(err.to_string(), "Stub property [count] is read-only");
    assert!(matches!(fixture.stub.set("secret", json!(1)), Err(BridgeError::ReadOnlyProperty { .. })));
}

#[tokio::test]
async fn test_subscription_lifecycle() {
    let mut fixture = Fixture::new();
    let ticks = fixture.stub.stream("ticks").unwrap();
    assert!(ticks.ptr_eq(&fixture.stub.stream("ticks").unwrap()));

    // nothing is sent until subscribe
    assert!(fixture.requests.try_recv().is_err());

    let mut subscription = ticks.subscribe();
    let request = fixture.next_request().await;
    assert_eq!(request, Request::Subscribe {
        subscription_id: subscription.id(),
        prop_key: "ticks".to_string(),
        args: None,
    });
    assert_eq!(fixture.stub.open_subscriptions(), 1);

    fixture.push(&request, StreamEvent::Next { subscription_id: request.id(), value: json!(1) });
    assert_eq!(subscription.next().await.unwrap().unwrap(), json!(1));

    subscription.unsubscribe();
    assert_eq!(fixture.next_request().await, Request::unsubscribe(request.id()));
    assert_eq!(fixture.stub.open_subscriptions(), 0);
    assert_eq!(fixture.client.listener_count(), 0);
}

#[tokio::test]
async fn test_no_unsubscribe_after_completion() {
    let mut fixture = Fixture::new();
    let mut subscription = fixture.stub.stream("ticks").unwrap().subscribe();
    let request = fixture.next_request().await;

    fixture.push(&request, StreamEvent::Complete { subscription_id: request.id() });
    assert!(subscription.next().await.is_none());
    assert!(subscription.is_finished());

    drop(subscription);
    sleep(Duration::from_millis(20)).await;
    assert!(fixture.requests.try_recv().is_err());
}

#[tokio::test]
async fn test_stream_function_binds_arguments() {
    let mut fixture = Fixture::new();
    let range = fixture.stub.stream_function("range").unwrap();

    let first = range.call(vec![json!(2)]);
    let second = range.call(vec![json!(2)]);
    assert!(!first.ptr_eq(&second));

    let _subscription = first.subscribe();
    match fixture.next_request().await {
        Request::Subscribe { prop_key, args, .. } => {
            assert_eq!(prop_key, "range");
            assert_eq!(args, Some(vec![json!(2)]));
        }
        other => panic!("expected subscribe, got {:?}", other),
    }

    let _empty = range.call(vec![]).subscribe();
    match fixture.next_request().await {
        Request::Subscribe { args, .. } => assert_eq!(args, Some(vec![])),
        other => panic!("expected subscribe, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_abandons_pending_calls() {
    let mut fixture = Fixture::new();
    let call = fixture.stub.function("add").unwrap().call(vec![json!(1), json!(2)]);
    let request = fixture.next_request().await;

    fixture.host.disconnect();
    assert!(!fixture.stub.is_connected());
    assert!(fixture
        .host
        .send(&request.reply_address(), Message::response(Response::result(request.id(), json!(3))))
        .is_err());

    assert!(timeout(Duration::from_millis(100), call).await.is_err());

    // calls made after the disconnect are abandoned too
    let late = fixture.stub.function("add").unwrap().call(vec![]);
    assert!(timeout(Duration::from_millis(50), late).await.is_err());
}

#[tokio::test]
async fn test_disconnect_abandons_subscriptions() {
    let mut fixture = Fixture::new();
    let mut subscription = fixture.stub.stream("ticks").unwrap().subscribe();
    let request = fixture.next_request().await;
    fixture.push(&request, StreamEvent::Next { subscription_id: request.id(), value: json!(1) });
    assert_eq!(subscription.next().await.unwrap().unwrap(), json!(1));

    fixture.client.disconnect();
    assert!(timeout(Duration::from_millis(100), subscription.next()).await.is_err());
    assert!(!subscription.is_finished());
}
