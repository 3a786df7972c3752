//! Shared helpers for the integration suites

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use dcerpc::{
    DceRpcClient, DceRpcServer, DceRpcServerConfig, Interface, InterfaceBuilder, RpcError,
    SyntaxId, Uuid,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const ECHO_UUID: &str = "e1c0e1c0-1234-4abc-9def-0123456789ab";
pub const ECHO_VERSION: (u16, u16) = (1, 0);

static LOGGING: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn syntax(uuid: &str, version: (u16, u16)) -> SyntaxId {
    SyntaxId::new(Uuid::parse(uuid).unwrap(), version.0, version.1)
}

/// Simple order-sensitive checksum for payload comparison
pub fn compute_checksum(data: &[u8]) -> u64 {
    data.iter().enumerate().fold(0u64, |acc, (i, &b)| {
        acc.wrapping_mul(31).wrapping_add(b as u64 ^ (i as u64 & 0xff))
    })
}

/// `len` bytes of a repeating pattern
pub fn pattern_payload(len: usize) -> Bytes {
    let mut data = BytesMut::with_capacity(len);
    for i in 0..len {
        data.put_u8((i % 251) as u8);
    }
    data.freeze()
}

/// opnum 0 echoes, opnum 1 sleeps for the number of milliseconds in its
/// little-endian u32 argument and then echoes it
pub fn create_echo_interface() -> Interface {
    InterfaceBuilder::from_syntax(syntax(ECHO_UUID, ECHO_VERSION))
        .operation(0, |args| async move { Ok(args) })
        .operation(1, |args: Bytes| async move {
            if args.len() < 4 {
                return Err(RpcError::Fault(dcerpc::FaultStatus::BadStubData as u32));
            }
            let millis = u32::from_le_bytes([args[0], args[1], args[2], args[3]]);
            tokio::time::sleep(Duration::from_millis(millis as u64)).await;
            Ok(args)
        })
        .build()
}

/// A server listening on an ephemeral loopback port
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<DceRpcServer>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<dcerpc::Result<()>>>,
}

impl TestServer {
    /// Stop accepting, notify connected clients and wait for them to drain
    pub async fn shutdown(mut self) -> dcerpc::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start a server with `config` serving the given interfaces
pub async fn start_server(config: DceRpcServerConfig, interfaces: Vec<Interface>) -> TestServer {
    start_configured(DceRpcServer::with_config(config), interfaces).await
}

/// Start an already configured server (for example one with a security
/// provider) serving the given interfaces
pub async fn start_configured(server: DceRpcServer, interfaces: Vec<Interface>) -> TestServer {
    let server = Arc::new(server);
    for interface in interfaces {
        server.register_interface(interface).await;
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();

    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            server
                .serve_until(listener, async {
                    let _ = stopped.await;
                })
                .await
        })
    };

    TestServer {
        addr,
        server,
        stop: Some(stop),
        task: Some(task),
    }
}

pub async fn start_echo_server() -> TestServer {
    start_server(DceRpcServerConfig::default(), vec![create_echo_interface()]).await
}

pub async fn connect_client(
    addr: SocketAddr,
    uuid: &str,
    version: (u16, u16),
) -> dcerpc::Result<DceRpcClient> {
    DceRpcClient::connect(addr, syntax(uuid, version)).await
}

/// Success and latency counters shared by concurrent workers
#[derive(Debug, Default)]
pub struct ConcurrentStats {
    successes: AtomicU64,
    failures: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl ConcurrentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        let micros = latency.as_micros() as u64;
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn average_latency(&self) -> Duration {
        let count = self.successes();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed) / count)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_micros(self.max_latency_us.load(Ordering::Relaxed))
    }

    pub fn print_summary(&self, label: &str, elapsed: Duration) {
        let total = self.successes() + self.failures();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            self.successes() as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        println!(
            "{}: {} calls, {} ok, {} failed, avg {:?}, max {:?}, {:.0} calls/s",
            label,
            total,
            self.successes(),
            self.failures(),
            self.average_latency(),
            self.max_latency(),
            throughput
        );
    }
}

/// Per-category outcome collected by the harness binary
#[derive(Debug, Default)]
pub struct TestSuiteResults {
    pub entries: Vec<(String, bool, Duration, String)>,
}

impl TestSuiteResults {
    pub fn record(&mut self, name: &str, success: bool, duration: Duration, summary: String) {
        self.entries.push((name.to_string(), success, duration, summary));
    }

    pub fn passed(&self) -> usize {
        self.entries.iter().filter(|(_, ok, _, _)| *ok).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.passed()
    }
}
