//! End-to-end client tests against an in-process service: a hand-written
//! stub over the generic call helper, overload resolution, error
//! rehydration and the demand-disciplined stream path.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use wirecall_client::{Client, ErrorMap};
use wirecall_core::{
    AuthVerifier, CallError, ContractBuilder, Credential, Dispatcher, Encoding, ErrorRecord,
    Principal, ServiceContract, ServiceName, Subscriber, Subscription, Verification,
};
use wirecall_transport::LocalTransport;

struct CalcApi;

impl ServiceContract for CalcApi {
    fn service_name() -> ServiceName {
        ServiceName::new("demo", "calc").with_version("0.0")
    }

    fn contract(c: &mut ContractBuilder) {
        c.unary::<(i32, String), String>("getCall")
            .unary::<(String,), String>("getCall")
            .unary::<(), ()>("throwExc")
            .stream::<(i32,), String>("streamCall")
            .stream::<(), String>("failingStream");
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("calculation rejected: {0}")]
struct CalcError(String);

fn dispatcher() -> Arc<Dispatcher> {
    let d = Dispatcher::builder()
        .verifier(TokenVerifier)
        .service::<CalcApi, _, _>(Arc::new(()), |b| {
            b.unary(
                "getCall",
                |_s: Arc<()>, _c, (i, s): (i32, String)| async move {
                    Ok::<String, CalcError>(s.repeat(i as usize))
                },
            )
            .unary("getCall", |_s: Arc<()>, _c, (s,): (String,)| async move {
                Ok::<String, CalcError>(s.to_uppercase())
            })
            .unary("throwExc", |_s: Arc<()>, _c, (): ()| async move {
                Err::<(), CalcError>(CalcError("bad input".to_string()))
            })
            .stream(
                "streamCall",
                |_s: Arc<()>, _c, (n,): (i32,), sink| async move {
                    for i in 0..n {
                        sink.send(i.to_string()).await?;
                    }
                    Ok::<(), wirecall_core::StreamClosed>(())
                },
            )
            .stream("failingStream", |_s: Arc<()>, _c, (): (), sink| async move {
                sink.send("one".to_string()).await.ok();
                Err::<(), CalcError>(CalcError("midstream".to_string()))
            });
        })
        .build()
        .unwrap();
    Arc::new(d)
}

struct TokenVerifier;

#[async_trait]
impl AuthVerifier for TokenVerifier {
    async fn verify(&self, credential: &Credential) -> Verification {
        match credential.token() {
            Some("sesame") => Verification::Granted(Principal::named("alice")),
            _ => Verification::Abstain,
        }
    }
}

fn client(encoding: Encoding) -> Client {
    let transport = Arc::new(LocalTransport::new(dispatcher()));
    Client::new(transport)
        .with_encoding(encoding)
        .with_errors(ErrorMap::new().register("CalcError", |r: &ErrorRecord| {
            CalcError(r.message.clone().unwrap_or_default())
        }))
}

/// The hand-written stub pattern: one line per method, no wire names.
struct CalcStub {
    client: Client,
}

impl CalcStub {
    async fn get_call(&self, i: i32, s: &str) -> Result<String, CallError> {
        self.client
            .unary::<CalcApi, _, String>("getCall", (i, s.to_string()))
            .await
    }

    async fn get_call_upper(&self, s: &str) -> Result<String, CallError> {
        self.client
            .unary::<CalcApi, _, String>("getCall", (s.to_string(),))
            .await
    }

    async fn throw_exc(&self) -> Result<(), CallError> {
        self.client.unary::<CalcApi, _, ()>("throwExc", ()).await
    }

    async fn stream_call<S: Subscriber<String>>(
        &self,
        n: i32,
        subscriber: S,
    ) -> Result<(), CallError> {
        self.client
            .stream::<CalcApi, _, String, S>("streamCall", (n,), subscriber)
            .await
    }
}

#[tokio::test]
async fn unary_call_round_trips_in_both_encodings() {
    for encoding in [Encoding::Json, Encoding::Binary] {
        let stub = CalcStub {
            client: client(encoding),
        };
        assert_eq!(stub.get_call(3, "test").await.unwrap(), "testtesttest");
    }
}

#[tokio::test]
async fn overloads_resolve_by_argument_types() {
    let stub = CalcStub {
        client: client(Encoding::Json),
    };
    assert_eq!(stub.get_call(2, "ab").await.unwrap(), "abab");
    assert_eq!(stub.get_call_upper("ab").await.unwrap(), "AB");
}

#[tokio::test]
async fn registered_error_rehydrates_to_native_type() {
    let stub = CalcStub {
        client: client(Encoding::Binary),
    };
    let err = stub.throw_exc().await.unwrap_err();
    let CallError::Known(inner) = err else {
        panic!("expected rehydrated error, got {err:?}");
    };
    assert_eq!(
        inner.downcast_ref::<CalcError>(),
        Some(&CalcError("calculation rejected: bad input".to_string()))
    );
}

#[tokio::test]
async fn unregistered_error_arrives_verbatim() {
    let transport = Arc::new(LocalTransport::new(dispatcher()));
    let bare = Client::new(transport);
    let err = bare
        .unary::<CalcApi, _, ()>("throwExc", ())
        .await
        .unwrap_err();
    let CallError::Remote {
        origin,
        message,
        correlation_id,
    } = err
    else {
        panic!("expected verbatim remote error");
    };
    assert_eq!(origin, "CalcError");
    assert_eq!(
        message.as_deref(),
        Some("calculation rejected: bad input")
    );
    assert!(!correlation_id.is_empty());
}

#[tokio::test]
async fn unknown_method_is_a_client_side_contract_error() {
    let c = client(Encoding::Json);
    let err = c.unary::<CalcApi, _, ()>("nope", ()).await.unwrap_err();
    assert!(matches!(err, CallError::Contract(_)));
}

#[tokio::test]
async fn wrong_call_kind_is_rejected_before_the_wire() {
    let c = client(Encoding::Json);
    let err = c
        .unary::<CalcApi, _, String>("streamCall", (1i32,))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Contract(_)));
}

/// Records lifecycle markers: -1 on subscribe, each item's value, -2 on
/// completion, -3 on error. Demand is granted in bursts of 3, 2, 1 and
/// then an oversized 101, so item delivery order proves flow control.
struct MarkerSubscriber {
    markers: Arc<Mutex<Vec<i64>>>,
    subscription: Option<Subscription>,
    round: u32,
}

impl MarkerSubscriber {
    fn new(markers: Arc<Mutex<Vec<i64>>>) -> Self {
        MarkerSubscriber {
            markers,
            subscription: None,
            round: 0,
        }
    }
}

impl Subscriber<String> for MarkerSubscriber {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.markers.lock().unwrap().push(-1);
        subscription.request(3);
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, item: String) {
        self.markers.lock().unwrap().push(item.parse().unwrap());
        self.round += 1;
        let subscription = self.subscription.as_ref().unwrap();
        match self.round {
            3 => subscription.request(2),
            5 => subscription.request(1),
            6 => subscription.request(101),
            _ => {}
        }
    }

    fn on_error(&mut self, _error: CallError) {
        self.markers.lock().unwrap().push(-3);
    }

    fn on_complete(&mut self) {
        self.markers.lock().unwrap().push(-2);
    }
}

#[tokio::test]
async fn stream_delivers_in_order_under_staggered_demand() {
    let stub = CalcStub {
        client: client(Encoding::Json),
    };
    let markers = Arc::new(Mutex::new(Vec::new()));
    stub.stream_call(6, MarkerSubscriber::new(Arc::clone(&markers)))
        .await
        .unwrap();
    assert_eq!(*markers.lock().unwrap(), vec![-1, 0, 1, 2, 3, 4, 5, -2]);
}

#[tokio::test]
async fn stream_failure_reaches_on_error_rehydrated() {
    let c = client(Encoding::Json);
    let markers = Arc::new(Mutex::new(Vec::new()));

    struct FailObserver {
        markers: Arc<Mutex<Vec<i64>>>,
        seen_error: Arc<Mutex<Option<CallError>>>,
    }

    impl Subscriber<String> for FailObserver {
        fn on_subscribe(&mut self, subscription: Subscription) {
            subscription.request(100);
        }
        fn on_next(&mut self, _item: String) {
            self.markers.lock().unwrap().push(0);
        }
        fn on_error(&mut self, error: CallError) {
            *self.seen_error.lock().unwrap() = Some(error);
        }
        fn on_complete(&mut self) {
            self.markers.lock().unwrap().push(-2);
        }
    }

    let seen_error = Arc::new(Mutex::new(None));
    c.stream::<CalcApi, _, String, _>(
        "failingStream",
        (),
        FailObserver {
            markers: Arc::clone(&markers),
            seen_error: Arc::clone(&seen_error),
        },
    )
    .await
    .unwrap();

    let error = seen_error.lock().unwrap().take().expect("error delivered");
    let CallError::Known(inner) = error else {
        panic!("expected rehydrated stream error");
    };
    assert_eq!(
        inner.downcast_ref::<CalcError>(),
        Some(&CalcError("calculation rejected: midstream".to_string()))
    );
    // The item sent before the failure arrived, completion never did.
    assert_eq!(*markers.lock().unwrap(), vec![0]);
}

#[tokio::test]
async fn credential_supplier_authenticates_calls() {
    let transport = Arc::new(LocalTransport::new(dispatcher()));
    let c = Client::new(transport).with_credentials(|| Credential::bearer("sesame"));
    assert_eq!(
        c.unary::<CalcApi, _, String>("getCall", (1i32, "x".to_string()))
            .await
            .unwrap(),
        "x"
    );
}

#[tokio::test]
async fn rejected_credential_surfaces_as_auth_error() {
    let transport = Arc::new(LocalTransport::new(dispatcher()));
    let c = Client::new(transport).with_credentials(|| Credential::bearer("wrong"));
    let err = c
        .unary::<CalcApi, _, String>("getCall", (1i32, "x".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Auth(_)));
}
