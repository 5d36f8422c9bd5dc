//! Protocol server integration tests
//!
//! Binds real listeners on loopback ports and talks HTTP/1.1 to them over
//! raw TCP streams.

use kestrel_common::{ProtocolFlags, ServerConfig};
use kestrel_server::http_router::RequestRouter;
use kestrel_server::pipeline::{ConfigurationPipeline, ConfigurationTask};
use kestrel_server::protocol::{ProtocolServer, ProtocolState, StopHandle};
use kestrel_server::routing::StaticFiles;
use kestrel_server::runtime::ContextPool;
use kestrel_server::shutdown::ShutdownRegistry;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Serves `dir` with the default static routes.
fn static_router(dir: &Path) -> Arc<RequestRouter> {
    let pipeline = ConfigurationPipeline::new(ContextPool::default(), 16);
    pipeline
        .run(ConfigurationTask::default(), &StaticFiles::new(dir))
        .unwrap();
    Arc::new(RequestRouter::new(pipeline.capabilities(None)))
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

fn write_self_signed(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

#[tokio::test]
async fn test_plain_http_serves_static_files() {
    let site = tempfile::tempdir().unwrap();
    std::fs::write(site.path().join("index.html"), "<h1>hello</h1>").unwrap();
    let config = ServerConfig::new(site.path())
        .with_addr(loopback())
        .with_protocol(ProtocolFlags {
            just_http: true,
            ..Default::default()
        });
    let registry = ShutdownRegistry::new();

    let running = ProtocolServer::new(&config, static_router(site.path()))
        .start(&registry)
        .await
        .unwrap();
    assert_eq!(running.state(), ProtocolState::PlainHttp);
    let addr = running.local_addrs()[0];

    let response = http_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("<h1>hello</h1>"));

    let response = http_get(addr, "/missing.html").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    registry.run_all();
    let report = tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .unwrap();
    assert_eq!(report.attempted, vec![ProtocolState::PlainHttp]);
    assert_eq!(report.final_state, ProtocolState::Stopped);
}

#[tokio::test]
async fn test_secure_failure_falls_back_to_plain_http() {
    let site = tempfile::tempdir().unwrap();
    std::fs::write(site.path().join("index.html"), "fallback").unwrap();
    let config = ServerConfig::new(site.path())
        .with_addr(loopback())
        .with_tls_files(site.path().join("no-cert.pem"), site.path().join("no-key.pem"));
    let registry = ShutdownRegistry::new();

    let running = ProtocolServer::new(&config, static_router(site.path()))
        .start(&registry)
        .await
        .unwrap();

    assert_eq!(
        running.transitions(),
        &[ProtocolState::SecureUpgradedHttp, ProtocolState::PlainHttp]
    );
    assert!(running.secure_addrs().is_empty());

    let response = http_get(running.local_addrs()[0], "/").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("fallback"));

    registry.run_all();
    running.wait().await;
}

#[tokio::test]
async fn test_secure_listener_with_valid_certificate() {
    let site = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(site.path());
    let config = ServerConfig::new(site.path())
        .with_addr(loopback())
        .with_tls_files(cert, key);
    let registry = ShutdownRegistry::new();

    let running = ProtocolServer::new(&config, static_router(site.path()))
        .start(&registry)
        .await
        .unwrap();

    assert_eq!(running.transitions(), &[ProtocolState::SecureUpgradedHttp]);
    assert_eq!(running.secure_addrs().len(), 1);

    registry.run_all();
    running.wait().await;
}

#[tokio::test]
async fn test_production_serves_both_listeners() {
    let site = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(site.path());
    let config = ServerConfig::new(site.path())
        .with_production_addrs(loopback(), loopback())
        .with_tls_files(cert, key)
        .with_protocol(ProtocolFlags {
            production: true,
            ..Default::default()
        });
    let registry = ShutdownRegistry::new();

    let running = ProtocolServer::new(&config, static_router(site.path()))
        .start(&registry)
        .await
        .unwrap();

    assert_eq!(running.state(), ProtocolState::Production);
    assert_eq!(running.local_addrs().len(), 2);
    assert_eq!(running.secure_addrs().len(), 1);

    registry.run_all();
    running.wait().await;
}

#[tokio::test]
async fn test_production_without_certificate_keeps_plain_half() {
    let site = tempfile::tempdir().unwrap();
    std::fs::write(site.path().join("index.html"), "plain half").unwrap();
    let config = ServerConfig::new(site.path())
        .with_production_addrs(loopback(), loopback())
        .with_tls_files(site.path().join("no-cert.pem"), site.path().join("no-key.pem"))
        .with_protocol(ProtocolFlags {
            production: true,
            ..Default::default()
        });
    let registry = ShutdownRegistry::new();

    let running = ProtocolServer::new(&config, static_router(site.path()))
        .start(&registry)
        .await
        .unwrap();

    assert_eq!(running.transitions(), &[ProtocolState::Production]);
    assert_eq!(running.local_addrs().len(), 1);
    assert!(running.secure_addrs().is_empty());

    let response = http_get(running.local_addrs()[0], "/").await;
    assert!(response.contains("plain half"));

    registry.run_all();
    running.wait().await;
}

#[tokio::test]
async fn test_production_halves_stop_independently() {
    let site = tempfile::tempdir().unwrap();
    std::fs::write(site.path().join("index.html"), "still serving").unwrap();
    let (cert, key) = write_self_signed(site.path());
    let config = ServerConfig::new(site.path())
        .with_production_addrs(loopback(), loopback())
        .with_tls_files(cert, key)
        .with_protocol(ProtocolFlags {
            production: true,
            ..Default::default()
        });
    let registry = ShutdownRegistry::new();

    let running = ProtocolServer::new(&config, static_router(site.path()))
        .start(&registry)
        .await
        .unwrap();
    let secure = running.secure_addrs()[0];
    let plain = running
        .local_addrs()
        .into_iter()
        .find(|addr| *addr != secure)
        .unwrap();

    assert!(running.stop_listener(secure));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(secure).await.is_err());

    let response = http_get(plain, "/").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("still serving"));
    assert!(!running.stop_handle().is_triggered());

    registry.run_all();
    let report = tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .unwrap();
    assert_eq!(report.attempted, vec![ProtocolState::Production]);
}

#[tokio::test]
async fn test_plain_bind_failure_is_fatal() {
    let taken = std::net::TcpListener::bind(loopback()).unwrap();
    let config = ServerConfig::new(".")
        .with_addr(taken.local_addr().unwrap())
        .with_protocol(ProtocolFlags {
            just_http: true,
            ..Default::default()
        });
    let registry = ShutdownRegistry::new();
    let pipeline = ConfigurationPipeline::new(ContextPool::default(), 16);

    let result = ProtocolServer::new(&config, Arc::new(RequestRouter::new(pipeline.capabilities(None))))
        .start(&registry)
        .await;

    let err = result.err().unwrap();
    assert!(err.is_fatal());
    // Nothing registered for a server that never started
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_shared_stop_handle_ends_serving() {
    let site = tempfile::tempdir().unwrap();
    let config = ServerConfig::new(site.path())
        .with_addr(loopback())
        .with_protocol(ProtocolFlags {
            just_http: true,
            ..Default::default()
        });
    let registry = ShutdownRegistry::new();
    let stop = StopHandle::new();

    let running = ProtocolServer::new(&config, static_router(site.path()))
        .with_stop_handle(stop.clone())
        .start(&registry)
        .await
        .unwrap();

    let serving = tokio::spawn(running.serve_until(std::future::pending()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(stop.trigger());

    let report = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.attempted, vec![ProtocolState::PlainHttp]);

    // The registry's stop action is now a no-op
    let summary = registry.run_all();
    assert_eq!(summary.ran, vec!["stop listeners"]);
    assert!(!stop.trigger());
}

#[tokio::test]
async fn test_script_route_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("server.js");
    std::fs::write(
        &script,
        "server.handle('/hello', function(req) { return { status: 201, body: 'hi ' + req.query }; });",
    )
    .unwrap();
    let pipeline = ConfigurationPipeline::new(ContextPool::default(), 16);
    let installer = StaticFiles::new(dir.path());
    let task = ConfigurationTask::default().with_server_script(&script);
    let pipeline = tokio::task::spawn_blocking(move || {
        pipeline.run(task, &installer).unwrap();
        pipeline
    })
    .await
    .unwrap();

    let config = ServerConfig::new(dir.path())
        .with_addr(loopback())
        .with_protocol(ProtocolFlags {
            just_http: true,
            ..Default::default()
        });
    let registry = ShutdownRegistry::new();
    let router = Arc::new(RequestRouter::new(pipeline.capabilities(None)));
    let running = ProtocolServer::new(&config, router).start(&registry).await.unwrap();

    let response = http_get(running.local_addrs()[0], "/hello?name=kestrel").await;
    assert!(response.starts_with("HTTP/1.1 201"));
    assert!(response.contains("hi name=kestrel"));

    registry.run_all();
    running.wait().await;
    pipeline.pool().shutdown_all();
}
