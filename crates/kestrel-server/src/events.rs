//! Filesystem-change event server.
//!
//! Watches a directory tree and pushes the paths of changed files to
//! browsers as Server-Sent Events on `/sse`. Changes are collected for one
//! refresh interval before they are sent, so a burst of writes produces one
//! event per file.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use kestrel_common::{KestrelError, ListenerLimits, Result, WatchConfig};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};

use crate::http_router::{text_response, HttpHandler, ResponseBody};
use crate::protocol::listener::{run_accept_loop, ConnMode};
use crate::protocol::StopHandle;
use crate::shutdown::ShutdownRegistry;

/// Path the event stream is served on.
pub const SSE_PATH: &str = "/sse";

/// Running event server.
pub struct EventServer {
    addr: SocketAddr,
    events: broadcast::Sender<String>,
}

impl EventServer {
    /// Starts watching `watch.base_path` and serving events on `watch.event_addr`.
    ///
    /// Registers a "stop event server" action with `registry`.
    pub async fn start(watch: &WatchConfig, limits: ListenerLimits, registry: &ShutdownRegistry) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<PathBuf>(256);
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            let _ = raw_tx.try_send(path);
                        }
                    }
                }
                Err(err) => tracing::warn!(target: "kestrel::internal", %err, "Filesystem watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| KestrelError::InvalidConfig(format!("Could not create filesystem watcher: {}", e)))?;
        watcher
            .watch(&watch.base_path, RecursiveMode::Recursive)
            .map_err(|e| {
                KestrelError::InvalidConfig(format!("Could not watch {}: {}", watch.base_path.display(), e))
            })?;

        let listener = TcpListener::bind(watch.event_addr).await.map_err(|e| {
            KestrelError::Transport(format!("Failed to bind event server to {}: {}", watch.event_addr, e))
        })?;
        let addr = listener.local_addr()?;

        let (events, _) = broadcast::channel(64);
        let stop = StopHandle::new();

        tokio::spawn(debounce(
            raw_rx,
            events.clone(),
            watch.base_path.clone(),
            watch.pattern.clone(),
            watch.refresh,
            stop.subscribe(),
        ));

        let handler = Arc::new(SseHandler {
            events: events.clone(),
            stop: stop.subscribe(),
        });
        tokio::spawn(run_accept_loop(
            listener,
            None,
            ConnMode::Http1,
            limits,
            handler,
            stop.subscribe(),
            Duration::from_secs(1),
        ));

        tracing::info!(
            addr = %addr,
            path = %watch.base_path.display(),
            pattern = %watch.pattern,
            "Serving filesystem events on {}{}",
            addr,
            SSE_PATH
        );

        let watcher = Mutex::new(Some(watcher));
        registry.register("stop event server", move || {
            stop.trigger();
            drop(watcher.lock().unwrap_or_else(PoisonError::into_inner).take());
            Ok(())
        });

        Ok(Self { addr, events })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Receives the same events the SSE clients get.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }
}

async fn debounce(
    mut raw: mpsc::Receiver<PathBuf>,
    events: broadcast::Sender<String>,
    base: PathBuf,
    pattern: String,
    refresh: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let first = tokio::select! {
            path = raw.recv() => match path {
                Some(path) => path,
                None => break,
            },
            _ = stop.changed() => break,
        };

        let mut batch = BTreeSet::new();
        let mut add = |path: PathBuf| {
            if let Some(name) = event_name(&base, &path, &pattern) {
                batch.insert(name);
            }
        };
        add(first);

        let deadline = tokio::time::sleep(refresh);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                path = raw.recv() => match path {
                    Some(path) => add(path),
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        for name in batch {
            tracing::debug!(path = %name, "Filesystem change");
            // No subscribers is fine
            let _ = events.send(name);
        }
    }
}

/// Name sent for a changed path, or `None` if it does not match `pattern`.
fn event_name(base: &Path, path: &Path, pattern: &str) -> Option<String> {
    let file_name = path.file_name()?.to_string_lossy();
    if !glob_match(pattern, &file_name) {
        return None;
    }
    let relative = path.strip_prefix(base).unwrap_or(path);
    Some(relative.display().to_string())
}

/// Shell-style match supporting `*` and `?`.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

fn sse_frame(name: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", name))
}

struct SseHandler {
    events: broadcast::Sender<String>,
    stop: watch::Receiver<bool>,
}

impl HttpHandler for SseHandler {
    fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Pin<Box<dyn Future<Output = Response<ResponseBody>> + Send>> {
        Box::pin(async move {
            if req.uri().path() != SSE_PATH {
                return text_response(StatusCode::NOT_FOUND, "Not Found\n");
            }

            let (tx, rx) = mpsc::channel::<Bytes>(16);
            let mut events = self.events.subscribe();
            let mut stop = self.stop.clone();
            tokio::spawn(async move {
                if tx.send(Bytes::from_static(b": connected\n\n")).await.is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(name) => {
                                if tx.send(sse_frame(&name)).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::debug!(skipped, "SSE client lagging");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = stop.changed() => break,
                        _ = tx.closed() => break,
                    }
                }
            });

            let frames = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (Ok::<_, Infallible>(Frame::data(chunk)), rx))
            });
            let mut response = Response::new(StreamBody::new(frames).boxed());
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            response
        })
    }
}
