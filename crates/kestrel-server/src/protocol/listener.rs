use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use kestrel_common::ListenerLimits;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::http_router::{HttpHandler, ResponseBody};

/// Wire protocol accepted on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    Http1,
    /// HTTP/2 with prior knowledge
    Http2,
    /// Either, detected per connection
    Auto,
}

fn connection_builder(mode: ConnMode, limits: &ListenerLimits) -> Builder<TokioExecutor> {
    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.header_read_timeout)
        .max_buf_size(limits.max_header_bytes.max(8192));
    builder
        .http2()
        .timer(TokioTimer::new())
        .max_header_list_size(u32::try_from(limits.max_header_bytes).unwrap_or(u32::MAX));
    match mode {
        ConnMode::Http1 => builder.http1_only(),
        ConnMode::Http2 => builder.http2_only(),
        ConnMode::Auto => builder,
    }
}

fn timeout_response() -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"Service Unavailable\n")).boxed());
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
}

/// Accepts connections until `stop` flips, then drains them.
///
/// In-flight connections get a graceful shutdown and `grace` to finish;
/// whatever is still running after that is abandoned.
pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    mode: ConnMode,
    limits: ListenerLimits,
    handler: Arc<dyn HttpHandler>,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
) {
    let builder = Arc::new(connection_builder(mode, &limits));
    let local = listener.local_addr().ok();
    let mut connections = JoinSet::new();

    if !*stop.borrow() {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let builder = builder.clone();
                        let handler = handler.clone();
                        let stop = stop.clone();
                        let tls = tls.clone();
                        connections.spawn(async move {
                            match tls {
                                Some(acceptor) => {
                                    let handshake =
                                        tokio::time::timeout(limits.header_read_timeout, acceptor.accept(stream)).await;
                                    match handshake {
                                        Ok(Ok(stream)) => {
                                            serve_stream(stream, &builder, handler, limits, stop, remote).await
                                        }
                                        Ok(Err(e)) => {
                                            tracing::debug!(target: "kestrel::internal", %remote, error = %e, "TLS handshake failed")
                                        }
                                        Err(_) => {
                                            tracing::debug!(target: "kestrel::internal", %remote, "TLS handshake timed out")
                                        }
                                    }
                                }
                                None => serve_stream(stream, &builder, handler, limits, stop, remote).await,
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(target: "kestrel::internal", error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = stop.changed() => break,
            }
        }
    }

    drop(listener);
    let in_flight = connections.len();
    if in_flight > 0 {
        tracing::debug!(addr = ?local, connections = in_flight, "Waiting for connections to finish");
    }
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(
            addr = ?local,
            connections = connections.len(),
            "Shutdown timeout reached, abandoning connections"
        );
        connections.abort_all();
    }
    tracing::debug!(addr = ?local, "Listener stopped");
}

async fn serve_stream<S>(
    stream: S,
    builder: &Builder<TokioExecutor>,
    handler: Arc<dyn HttpHandler>,
    limits: ListenerLimits,
    mut stop: watch::Receiver<bool>,
    remote: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let response_timeout = limits.response_header_timeout;
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move {
            match tokio::time::timeout(response_timeout, handler.handle(req)).await {
                Ok(response) => Ok::<_, Infallible>(response),
                Err(_) => {
                    tracing::warn!(target: "kestrel::internal", %remote, "Response header timeout");
                    Ok(timeout_response())
                }
            }
        }
    });

    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = stop.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        tracing::debug!(target: "kestrel::internal", %remote, error = %e, "Error serving connection");
    }
}
