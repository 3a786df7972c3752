//! Loopback smoke run
//!
//! Starts an echo server on an ephemeral port and drives one client through
//! bind, a plain call, a fragmented call, overlapping calls and shutdown,
//! printing one line per step. The full suites run under `cargo test`:
//!
//! ```text
//! cargo run -p integration-tests
//! cargo test -p integration-tests --test binding_tests
//! ```

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{TestServer, TestSuiteResults, ECHO_UUID, ECHO_VERSION};
use dcerpc::{DceRpcClient, RpcError};

type Step = dcerpc::Result<String>;

async fn bind(server: &TestServer) -> dcerpc::Result<DceRpcClient> {
    common::connect_client(server.addr, ECHO_UUID, ECHO_VERSION).await
}

async fn echo(client: &DceRpcClient) -> Step {
    let payload = common::pattern_payload(512);
    let reply = client.call(0, payload.clone()).await?;
    if common::compute_checksum(&reply) != common::compute_checksum(&payload) {
        return Err(RpcError::InvalidPduData("echo mismatch".into()));
    }
    Ok(format!("{} bytes", reply.len()))
}

async fn fragmented(client: &DceRpcClient) -> Step {
    let len = client.max_xmit_frag() as usize * 8;
    let payload = common::pattern_payload(len);
    let reply = client.call(0, payload.clone()).await?;
    if reply != payload {
        return Err(RpcError::InvalidPduData("fragmented echo mismatch".into()));
    }
    Ok(format!("{} bytes over {}-byte fragments", len, client.max_xmit_frag()))
}

async fn overlapping(client: &DceRpcClient) -> Step {
    let delays = [60u32, 30, 0];
    let calls = delays
        .iter()
        .map(|millis| client.call(1, Bytes::copy_from_slice(&millis.to_le_bytes())));
    let replies = futures::future::try_join_all(calls).await?;
    for (millis, reply) in delays.iter().zip(&replies) {
        if reply[..] != millis.to_le_bytes()[..] {
            return Err(RpcError::InvalidPduData("reply routed to wrong call".into()));
        }
    }
    Ok(format!("{} calls matched by call_id", replies.len()))
}

async fn shutdown(server: TestServer, client: &DceRpcClient) -> Step {
    server.shutdown().await?;
    match client.call(0, Bytes::new()).await {
        Err(_) => Ok("client observed close".to_string()),
        Ok(_) => Err(RpcError::InvalidPduData("call succeeded after shutdown".into())),
    }
}

fn report(results: &mut TestSuiteResults, name: &str, started: Instant, outcome: Step) {
    let (ok, summary) = match outcome {
        Ok(summary) => (true, summary),
        Err(e) => (false, e.to_string()),
    };
    results.record(name, ok, started.elapsed(), summary);
}

#[tokio::main]
async fn main() {
    common::init_logging();
    let mut results = TestSuiteResults::default();

    let server = common::start_echo_server().await;
    println!("echo server on {}", server.addr);

    let started = Instant::now();
    let client = match bind(&server).await {
        Ok(client) => {
            let context = client.default_context().unwrap_or_default();
            results.record("bind", true, started.elapsed(), format!("context {context}"));
            client
        }
        Err(e) => {
            results.record("bind", false, started.elapsed(), e.to_string());
            print_summary(&results);
            std::process::exit(1);
        }
    };

    let started = Instant::now();
    report(&mut results, "echo", started, echo(&client).await);
    let started = Instant::now();
    report(&mut results, "fragmented echo", started, fragmented(&client).await);
    let started = Instant::now();
    report(&mut results, "overlapping calls", started, overlapping(&client).await);
    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(5), shutdown(server, &client))
        .await
        .unwrap_or(Err(RpcError::Timeout));
    report(&mut results, "server shutdown", started, outcome);

    print_summary(&results);
    if results.failed() > 0 {
        std::process::exit(1);
    }
}

fn print_summary(results: &TestSuiteResults) {
    println!("{:<20} {:<6} {:<12} details", "step", "status", "duration");
    for (name, ok, duration, summary) in &results.entries {
        let status = if *ok { "ok" } else { "FAIL" };
        println!("{:<20} {:<6} {:<12?} {}", name, status, duration, summary);
    }
    println!("{} passed, {} failed", results.passed(), results.failed());
}
