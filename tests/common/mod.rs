//! In-process pairing of an [`HttpHandler`] with a [`Client`] for
//! end-to-end tests: a real hyper server on a loopback listener, torn
//! down when the [`TestServer`] drops.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use nexus_rpc::{Client, ClientOptions, Handler, HttpHandler};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

pub fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

pub struct TestServer {
    pub address: SocketAddr,
    /// Dropping the sender signals the accept loop to exit.
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    pub async fn start<H: Handler>(handler: HttpHandler<H>) -> Self {
        let tcp = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = tcp.local_addr().expect("local_addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(accept_loop(tcp, handler, shutdown_rx));

        Self {
            address,
            _shutdown: shutdown_tx,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }
}

async fn accept_loop<H: Handler>(
    tcp: TcpListener,
    handler: HttpHandler<H>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut conns = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            res = tcp.accept() => {
                match res {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        conns.spawn(serve_connection(stream, handler));
                    }
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                    }
                }
            }
        }
    }

    conns.abort_all();
}

async fn serve_connection<H: Handler>(tcp: tokio::net::TcpStream, handler: HttpHandler<H>) {
    let io = TokioIo::new(tcp);

    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, std::convert::Infallible>(handler.handle(req).await) }
    });

    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(io, service).await {
        tracing::debug!("connection ended: {e}");
    }
}

/// Serve `handler` with default options and pair it with a client.
pub async fn setup<H: Handler>(handler: H) -> (TestServer, Client) {
    setup_http(HttpHandler::new(handler)).await
}

/// Serve a fully configured [`HttpHandler`] and pair it with a client.
pub async fn setup_http<H: Handler>(handler: HttpHandler<H>) -> (TestServer, Client) {
    init_tracing();
    let server = TestServer::start(handler).await;
    let client = Client::new(ClientOptions::new(server.base_url())).expect("client");
    (server, client)
}

pub fn assert_duration_close(actual: Duration, expected: Duration, tolerance: Duration) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= tolerance,
        "expected {actual:?} to be within {tolerance:?} of {expected:?}"
    );
}
