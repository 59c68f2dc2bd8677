//! A small calculator service served over HTTP and called through a
//! hand-written stub.
//!
//! Run with `cargo run --example calc`.

use std::sync::Arc;
use thiserror::Error;
use wirecall_client::{Client, ErrorMap};
use wirecall_core::{
    CallError, ContractBuilder, Dispatcher, Encoding, ErrorRecord, ServiceContract, ServiceName,
};
use wirecall_server::{init_test_logging, router};
use wirecall_transport::HttpTransport;

struct CalcApi;

impl ServiceContract for CalcApi {
    fn service_name() -> ServiceName {
        ServiceName::new("demo", "calc").with_version("0.0")
    }

    fn contract(c: &mut ContractBuilder) {
        c.unary::<(i64, i64), i64>("add")
            .unary::<(i64, i64), i64>("div")
            .stream::<(i64,), i64>("countTo");
    }
}

#[derive(Debug, Error)]
enum CalcError {
    #[error("division by zero")]
    DivisionByZero,
}

struct CalcStub {
    client: Client,
}

impl CalcStub {
    async fn add(&self, a: i64, b: i64) -> Result<i64, CallError> {
        self.client.unary::<CalcApi, _, i64>("add", (a, b)).await
    }

    async fn div(&self, a: i64, b: i64) -> Result<i64, CallError> {
        self.client.unary::<CalcApi, _, i64>("div", (a, b)).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_test_logging();

    let dispatcher = Dispatcher::builder()
        .service::<CalcApi, _, _>(Arc::new(()), |b| {
            b.unary("add", |_s: Arc<()>, _c, (a, b): (i64, i64)| async move {
                Ok::<i64, CalcError>(a + b)
            })
            .unary("div", |_s: Arc<()>, _c, (a, b): (i64, i64)| async move {
                if b == 0 {
                    return Err(CalcError::DivisionByZero);
                }
                Ok(a / b)
            })
            .stream("countTo", |_s: Arc<()>, _c, (n,): (i64,), sink| async move {
                for i in 0..n {
                    sink.send(i).await?;
                }
                Ok::<(), wirecall_core::StreamClosed>(())
            });
        })
        .build()?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router(Arc::new(dispatcher), "/rpc")).await {
            tracing::error!("server exited: {err}");
        }
    });

    let client = Client::new(Arc::new(HttpTransport::new(format!("http://{addr}/rpc"))))
        .with_encoding(Encoding::Json)
        .with_errors(
            ErrorMap::new().register("CalcError", |r: &ErrorRecord| {
                std::io::Error::other(r.message.clone().unwrap_or_default())
            }),
        );
    let stub = CalcStub { client };

    println!("2 + 3 = {}", stub.add(2, 3).await?);
    match stub.div(1, 0).await {
        Ok(_) => unreachable!(),
        Err(err) => println!("1 / 0 -> {err}"),
    }
    Ok(())
}
