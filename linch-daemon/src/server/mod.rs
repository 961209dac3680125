// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Top-level server assembly.
//!
//! Startup order: build router, build middleware, construct the security
//! manager, acquire the endpoint, start accepting. The endpoint descriptor
//! file is written last; its presence is the readiness signal for clients.
//! Shutdown runs the same steps backwards: stop accepting, notify live
//! connections, drain up to a grace period, remove the endpoint and its
//! descriptor files.

pub(crate) mod connection;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use linch_ipc::platform::PeerCredentials;
#[cfg(unix)]
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::endpoint::{EndpointDescriptor, EndpointFiles};
use crate::middleware::{default_middlewares, IpcApplication};
use crate::router::Router;
use crate::routes;
use crate::security::{SecurityContext, SecurityManager};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Signals the server (and every connection task) to stop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

struct ServerState {
    active_connections: AtomicUsize,
    next_connection_id: AtomicU64,
}

pub struct Server {
    config: Config,
    security: Arc<SecurityManager>,
    /// Consumed when the server starts; routes register before that.
    router: Option<Router>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let security = Arc::new(SecurityManager::new(&config));
        let router = routes::register_all(security.clone())?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Server {
            config,
            security,
            router: Some(router),
            shutdown_tx: Arc::new(shutdown_tx),
            state: Arc::new(ServerState {
                active_connections: AtomicUsize::new(0),
                next_connection_id: AtomicU64::new(0),
            }),
        })
    }

    /// Mounts routes registered by external subsystems. Must be called
    /// before [`Server::run`]; the routing table is immutable afterwards.
    pub fn include_routes(&mut self, router: Router) -> anyhow::Result<()> {
        self.router
            .as_mut()
            .context("routes cannot be added to a running server")?
            .include(router)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn active_connections(&self) -> usize {
        self.state.active_connections.load(Ordering::Acquire)
    }

    fn build_app(&mut self) -> anyhow::Result<Arc<IpcApplication>> {
        let router = self.router.take().context("server was already started")?;
        Ok(Arc::new(IpcApplication::new(
            router,
            default_middlewares(&self.config),
        )))
    }

    /// Runs until a [`ShutdownHandle`] fires. Endpoint acquisition failures
    /// are fatal and bubble up as errors.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            self.run_unix().await
        }
        #[cfg(windows)]
        {
            self.run_windows().await
        }
    }

    #[cfg(unix)]
    async fn run_unix(&mut self) -> anyhow::Result<()> {
        use linch_ipc::platform::unix as platform;

        let app = self.build_app()?;
        let socket_path = self
            .config
            .socket_path
            .clone()
            .unwrap_or_else(platform::default_socket_path);
        let listener = platform::bind_socket(&socket_path)
            .with_context(|| format!("could not bind unix socket at {socket_path:?}"))?;
        info!("Unix domain socket server listening: {}", socket_path.display());

        let endpoint_files = EndpointFiles::new(&self.config.app_data_dir());
        endpoint_files.write(&EndpointDescriptor::unix_socket(&socket_path))?;

        self.accept_loop_unix(listener, app).await;

        self.drain_connections().await;
        platform::remove_socket(&socket_path);
        endpoint_files.remove();
        info!("IPC server stopped");
        Ok(())
    }

    #[cfg(unix)]
    async fn accept_loop_unix(
        &self,
        listener: tokio::net::UnixListener,
        app: Arc<IpcApplication>,
    ) {
        use std::os::fd::AsRawFd;

        use linch_ipc::platform::unix as platform;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut consecutive_errors: u32 = 0;
        loop {
            tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    // Reset anything still queued in the backlog instead of
                    // leaving it to time out.
                    stop_listening(listener.as_raw_fd());
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        consecutive_errors = 0;
                        let peer = platform::peer_credentials(&stream);
                        self.handle_accept(stream, peer, app.clone());
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!("accept failed ({consecutive_errors} consecutive): {e}");
                        let backoff = Duration::from_millis(
                            100u64 << consecutive_errors.min(4),
                        )
                        .min(Duration::from_secs(1));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }

    /// Hands an accepted stream to its own task, or refuses it when the
    /// connection cap is reached. The guard releases the accounting and the
    /// security registration on every exit path, panics included.
    #[cfg(unix)]
    fn handle_accept<S>(&self, stream: S, peer: PeerCredentials, app: Arc<IpcApplication>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let active = self.state.active_connections.load(Ordering::Acquire);
        if active >= self.config.max_connections {
            warn!(
                "connection refused: {} live connections at the configured cap",
                active
            );
            tokio::spawn(connection::refuse(stream, self.config.max_connections));
            return;
        }

        let connection_id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = Arc::new(SecurityContext::new(connection_id, peer));
        self.security.register_connection(ctx.clone());
        self.state.active_connections.fetch_add(1, Ordering::AcqRel);

        let handler = connection::ConnectionHandler {
            ctx,
            app,
            security: self.security.clone(),
            max_payload: self.config.max_payload_bytes,
            idle_timeout: self.config.connection_timeout(),
            request_timeout: self.config.request_timeout(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        let guard = ConnectionGuard {
            state: self.state.clone(),
            security: self.security.clone(),
            connection_id,
        };
        tokio::spawn(async move {
            let _guard = guard;
            handler.serve(stream).await;
        });
    }

    async fn drain_connections(&self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let live = self.state.active_connections.load(Ordering::Acquire);
            if live == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("shutdown grace period expired with {live} connections live");
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[cfg(windows)]
    async fn run_windows(&mut self) -> anyhow::Result<()> {
        use linch_ipc::platform::windows as platform;

        let app = self.build_app()?;
        let name = platform::full_pipe_name(
            &self
                .config
                .pipe_name
                .clone()
                .unwrap_or_else(platform::default_pipe_name),
        );

        let mut attrs = match platform::PipeSecurityAttributes::for_current_user() {
            Ok(attrs) => Some(attrs),
            Err(e) => {
                warn!("pipe security descriptor unavailable, using pipe defaults: {e}");
                None
            }
        };
        let first_instance = platform::create_pipe_instance(&name, true, attrs.as_mut())
            .with_context(|| format!("could not create named pipe {name}"))?;
        info!("Named pipe server listening: {}", name);

        let endpoint_files = EndpointFiles::new(&self.config.app_data_dir());
        endpoint_files.write(&EndpointDescriptor::named_pipe(&name))?;

        // A pipe instance serves one client at a time; a fixed pool of
        // instances emulates accept fan-out.
        let attrs = Arc::new(std::sync::Mutex::new(attrs));
        let mut workers = Vec::new();
        let mut first_instance = Some(first_instance);
        for index in 0..self.config.pipe_pool_size.max(1) {
            let worker = PipeWorker {
                name: name.clone(),
                index,
                app: app.clone(),
                security: self.security.clone(),
                state: self.state.clone(),
                attrs: attrs.clone(),
                max_connections: self.config.max_connections,
                max_payload: self.config.max_payload_bytes,
                idle_timeout: self.config.connection_timeout(),
                request_timeout: self.config.request_timeout(),
                shutdown_tx: self.shutdown_tx.clone(),
            };
            workers.push(tokio::spawn(worker.run(first_instance.take())));
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        for worker in workers {
            let _ = worker.await;
        }

        self.drain_connections().await;
        endpoint_files.remove();
        info!("IPC server stopped");
        Ok(())
    }
}

#[cfg(unix)]
fn stop_listening(fd: std::os::fd::RawFd) {
    use nix::sys::socket::{shutdown, Shutdown};
    let _ = shutdown(fd, Shutdown::Both);
}

/// Releases per-connection accounting when the connection task ends, no
/// matter how it ends.
struct ConnectionGuard {
    state: Arc<ServerState>,
    security: Arc<SecurityManager>,
    connection_id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
        self.security.close_connection(self.connection_id);
    }
}

#[cfg(windows)]
const MAX_INSTANCE_FAILURES: u32 = 5;

/// One pool slot: create an instance, wait for a client, serve it to
/// completion, recycle. Gives up after too many consecutive creation
/// failures; the pool continues with the remaining slots.
#[cfg(windows)]
struct PipeWorker {
    name: String,
    index: usize,
    app: Arc<IpcApplication>,
    security: Arc<SecurityManager>,
    state: Arc<ServerState>,
    attrs: Arc<std::sync::Mutex<Option<linch_ipc::platform::windows::PipeSecurityAttributes>>>,
    max_connections: usize,
    max_payload: usize,
    idle_timeout: Duration,
    request_timeout: Option<Duration>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

#[cfg(windows)]
impl PipeWorker {
    async fn run(self, mut initial: Option<tokio::net::windows::named_pipe::NamedPipeServer>) {
        use linch_ipc::platform::windows as platform;
        use linch_ipc::MutexExt;
        use tracing::error;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut failures: u32 = 0;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let pipe = match initial.take() {
                Some(pipe) => pipe,
                None => {
                    let created = {
                        let mut attrs = self.attrs.lock_or_panic();
                        platform::create_pipe_instance(&self.name, false, attrs.as_mut())
                    };
                    match created {
                        Ok(pipe) => {
                            failures = 0;
                            pipe
                        }
                        Err(e) => {
                            failures += 1;
                            if failures >= MAX_INSTANCE_FAILURES {
                                error!(
                                    "pipe instance {} giving up after {} consecutive failures: {}",
                                    self.index, failures, e
                                );
                                break;
                            }
                            warn!("pipe instance {} creation failed: {}", self.index, e);
                            let backoff = Duration::from_millis(100u64 << failures.min(4))
                                .min(Duration::from_secs(1));
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                    }
                }
            };

            tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
                connected = pipe.connect() => {
                    if let Err(e) = connected {
                        warn!("pipe instance {} connect failed: {}", self.index, e);
                        continue;
                    }
                }
            }

            let peer = platform::peer_credentials(&pipe);
            self.serve_one(pipe, peer).await;
        }
    }

    async fn serve_one(
        &self,
        pipe: tokio::net::windows::named_pipe::NamedPipeServer,
        peer: PeerCredentials,
    ) {
        let active = self.state.active_connections.load(Ordering::Acquire);
        if active >= self.max_connections {
            warn!(
                "connection refused: {} live connections at the configured cap",
                active
            );
            connection::refuse(pipe, self.max_connections).await;
            return;
        }

        let connection_id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = Arc::new(SecurityContext::new(connection_id, peer));
        self.security.register_connection(ctx.clone());
        self.state.active_connections.fetch_add(1, Ordering::AcqRel);
        let _guard = ConnectionGuard {
            state: self.state.clone(),
            security: self.security.clone(),
            connection_id,
        };

        let handler = connection::ConnectionHandler {
            ctx,
            app: self.app.clone(),
            security: self.security.clone(),
            max_payload: self.max_payload,
            idle_timeout: self.idle_timeout,
            request_timeout: self.request_timeout,
            shutdown: self.shutdown_tx.subscribe(),
        };
        handler.serve(pipe).await;
    }
}
