//! Shared fixtures for end-to-end bridge tests
//!
//! Provides a calculator target exercising every member shape and a helper
//! that registers it and builds a client stub over an in-memory transport.

#![allow(dead_code)]

use futures::stream;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether::{arg, Descriptor, Member, MemoryTransport, Registration, Registry, RemoteError, Stub, Target};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

/// Period of the `ticker` stream
pub const TICK: Duration = Duration::from_millis(20);

/// Install a test log subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Host object used across the integration tests
#[derive(Default)]
pub struct Calculator {
    /// Calls to `increment`
    pub hits: AtomicU64,
    /// Values produced by every `ticker` stream so far
    pub ticks_produced: AtomicU64,
}

impl Calculator {
    pub fn ticks(&self) -> u64 {
        self.ticks_produced.load(Ordering::SeqCst)
    }
}

impl Target for Calculator {
    fn member(self: Arc<Self>, key: &str) -> Option<Member> {
        let member = match key {
            "count" => Member::value(3),
            "label" => Member::pending(async {
                sleep(Duration::from_millis(10)).await;
                Ok(json!("calculator"))
            }),
            "hits" => Member::value(self.hits.load(Ordering::SeqCst)),
            "add" => Member::function(|args| {
                let a: i64 = arg(&args, 0)?;
                let b: i64 = arg(&args, 1)?;
                Ok(Member::value(a + b))
            }),
            "slowAdd" => Member::async_function(|args| async move {
                sleep(Duration::from_millis(100)).await;
                let a: i64 = arg(&args, 0)?;
                let b: i64 = arg(&args, 1)?;
                Ok(json!(a + b))
            }),
            "increment" => Member::function(move |_| {
                Ok(Member::value(self.hits.fetch_add(1, Ordering::SeqCst) + 1))
            }),
            "failSync" => Member::function(|_| Err(RemoteError::msg("an error"))),
            "failAsync" => Member::async_function(|_| async { Err(RemoteError::msg("an error")) }),
            "digits" => Member::stream(stream::iter(vec![Ok(json!(1)), Ok(json!(2)), Ok(json!(3))])),
            "broken" => Member::stream(stream::iter(vec![
                Ok(json!(1)),
                Err(RemoteError::msg("an error")),
            ])),
            "ticker" => Member::stream(stream::unfold(self, |this| async move {
                sleep(TICK).await;
                let n = this.ticks_produced.fetch_add(1, Ordering::SeqCst) + 1;
                Some((Ok(json!(n)), this))
            })),
            "range" => Member::stream_function(|args| {
                let start: i64 = arg(&args, 0)?;
                let end: i64 = arg(&args, 1)?;
                Ok(stream::iter((start..end).map(|n| Ok(json!(n)))))
            }),
            _ => return None,
        };
        Some(member)
    }
}

/// Descriptor for [`Calculator`] on a given channel
///
/// Declares `missingFunction`, which the target does not have.
pub fn calculator_descriptor(channel: &str) -> Descriptor {
    Descriptor::builder(channel)
        .value("count")
        .value("label")
        .value("hits")
        .function("add")
        .function("slowAdd")
        .function("increment")
        .function("failSync")
        .function("failAsync")
        .function("missingFunction")
        .value_stream("digits")
        .value_stream("broken")
        .value_stream("ticker")
        .function_stream("range")
        .build()
        .expect("calculator descriptor is valid")
}

/// A registered calculator and a stub talking to it
pub struct Bridge {
    pub registry: Arc<Registry>,
    pub registration: Registration,
    pub target: Arc<Calculator>,
    pub host: Arc<MemoryTransport>,
    pub client: Arc<MemoryTransport>,
    pub stub: Stub,
}

/// Register a fresh calculator on its own registry and build a stub for it
pub fn connect() -> anyhow::Result<Bridge> {
    init_tracing();

    let registry = Registry::new();
    let (host, client) = MemoryTransport::pair();
    let host = Arc::new(host);
    let client = Arc::new(client);
    let target = Arc::new(Calculator::default());
    let descriptor = calculator_descriptor("calc");

    let registration = registry.register(target.clone(), &descriptor, host.clone())?;
    let stub = Stub::with_default_streams(descriptor, client.clone())?;

    Ok(Bridge {
        registry,
        registration,
        target,
        host,
        client,
        stub,
    })
}
