// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::runtime;

use linch_daemon::config::{Config, LogMethod};
use linch_daemon::router::Router;
use linch_daemon::server::{Server, ShutdownHandle};
use linch_ipc::protocol::{IpcRequest, IpcResponse};
use linch_ipc::transport::blocking::BlockingClient;

struct TestDaemon {
    socket_path: PathBuf,
    app_data: PathBuf,
    handle: ShutdownHandle,
    worker: Option<thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    fn start(configure: impl FnOnce(&mut Config), extra_routes: Option<Router>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let app_data = dir.path().join("app-data");

        let mut config = Config {
            socket_path: Some(socket_path.clone()),
            app_data_dir: Some(app_data.clone()),
            log_method: LogMethod::Disabled,
            ..Config::default()
        };
        configure(&mut config);

        let mut server = Server::new(config).unwrap();
        if let Some(routes) = extra_routes {
            server.include_routes(routes).unwrap();
        }
        let handle = server.shutdown_handle();

        let worker = thread::spawn(move || {
            let rt = runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move { server.run().await }).unwrap();
        });

        let daemon = TestDaemon {
            socket_path,
            app_data,
            handle,
            worker: Some(worker),
            _dir: dir,
        };
        daemon.wait_ready();
        daemon
    }

    /// The endpoint descriptor file is the readiness signal.
    fn wait_ready(&self) {
        let descriptor = self.app_data.join("daemon.socket");
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if descriptor.exists() && self.socket_path.exists() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("server did not become ready within 5s");
    }

    fn connect(&self) -> BlockingClient {
        let client = BlockingClient::connect(&self.socket_path).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
    }

    fn stop(mut self) {
        self.handle.shutdown();
        self.worker.take().unwrap().join().unwrap();
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn assert_error(resp: &IpcResponse, code: &str) {
    assert!(!resp.success, "expected an error response, got {resp:?}");
    assert_eq!(resp.error_code(), Some(code), "response: {resp:?}");
}

#[test]
fn handshake_then_health_probe() {
    let daemon = TestDaemon::start(|_| {}, None);
    let mut client = daemon.connect();

    // The test process is the daemon process, so its own PID makes it an
    // internal client.
    let resp = client.handshake().unwrap();
    assert!(resp.success);
    let data = resp.data.as_ref().unwrap();
    assert_eq!(data["authenticated"], json!(true));
    assert_eq!(data["client_type"], json!("internal"));
    assert_eq!(data["server_pid"], json!(std::process::id()));

    let resp = client.request("GET", "/health", None).unwrap();
    assert!(resp.success);
    let data = resp.data.as_ref().unwrap();
    assert_eq!(data["status"], json!("healthy"));
    assert_eq!(data["service"], json!("linch-mind-daemon"));
    assert_eq!(data["protocol_version"], json!("2.0"));
    assert!(data["timestamp"].is_string());

    // Nothing about that exchange may land in the ring as a failure.
    let status = client.request("GET", "/server/security", None).unwrap();
    let events = &status.data.as_ref().unwrap()["recent_events"];
    assert!(events.get("auth_failed").is_none(), "events: {events:?}");

    daemon.stop();
}

#[test]
fn external_client_pid_is_verified_by_uid() {
    let daemon = TestDaemon::start(|_| {}, None);
    let mut client = daemon.connect();

    // A PID other than the daemon's own, over a same-user socket.
    let resp = client.handshake_as(999_999).unwrap();
    assert!(resp.success);
    assert_eq!(
        resp.data.as_ref().unwrap()["client_type"],
        json!("external")
    );
}

#[test]
fn unauthenticated_request_is_rejected_without_closing() {
    let daemon = TestDaemon::start(|_| {}, None);
    let mut client = daemon.connect();

    let resp = client.request("GET", "/health", None).unwrap();
    assert_error(&resp, "IPC_AUTH_REQUIRED");

    // Same connection: handshake, then the request goes through.
    let resp = client.handshake().unwrap();
    assert!(resp.success);
    let resp = client.request("GET", "/health", None).unwrap();
    assert!(resp.success);
}

#[test]
fn oversize_frame_gets_one_error_then_close() {
    let daemon = TestDaemon::start(|c| c.max_payload_bytes = 1024, None);
    let mut client = daemon.connect();

    let mut frame = Vec::with_capacity(4 + 2048);
    frame.extend_from_slice(&2048u32.to_be_bytes());
    frame.extend_from_slice(&[b'x'; 2048]);
    client.send_raw(&frame).unwrap();

    let resp = client.recv().unwrap();
    assert_error(&resp, "IPC_INVALID_REQUEST");

    // Exactly one frame, then the server hangs up.
    assert!(client.recv().is_err());

    // A reconnect succeeds.
    let mut client = daemon.connect();
    assert!(client.handshake().unwrap().success);
}

#[test]
fn zero_length_frame_is_rejected_but_connection_survives() {
    let daemon = TestDaemon::start(|_| {}, None);
    let mut client = daemon.connect();

    client.send_raw(&0u32.to_be_bytes()).unwrap();
    let resp = client.recv().unwrap();
    assert_error(&resp, "IPC_INVALID_REQUEST");

    assert!(client.handshake().unwrap().success);
}

#[test]
fn malformed_json_is_rejected_but_connection_survives() {
    let daemon = TestDaemon::start(|_| {}, None);
    let mut client = daemon.connect();

    let payload = b"{definitely not json";
    let mut frame = Vec::new();
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    client.send_raw(&frame).unwrap();

    let resp = client.recv().unwrap();
    assert_error(&resp, "IPC_INVALID_REQUEST");
    assert!(resp.error.unwrap().details.unwrap()["parse_error"].is_string());

    assert!(client.handshake().unwrap().success);
}

#[test]
fn rate_limit_applies_per_pid_with_exempt_prefixes() {
    let mut routes = Router::new();
    routes
        .get("/config/overview", |r| async move {
            Ok(IpcResponse::success(json!({"sections": []}), r.request_id))
        })
        .unwrap();

    let daemon = TestDaemon::start(
        |c| {
            c.rate_limit.max_burst = 5;
            c.rate_limit.exempt_path_prefixes = vec!["/config/".to_string()];
        },
        Some(routes),
    );
    let mut client = daemon.connect();
    assert!(client.handshake().unwrap().success);

    // Exactly the burst is admitted on a non-exempt path.
    let mut admitted = 0;
    let mut limited = 0;
    for _ in 0..10 {
        let resp = client.request("GET", "/server/info", None).unwrap();
        if resp.success {
            admitted += 1;
        } else {
            assert_error(&resp, "RATE_LIMITED");
            limited += 1;
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(limited, 5);

    // The exempt prefix runs at three times the burst; all ten pass.
    for _ in 0..10 {
        let resp = client.request("GET", "/config/overview", None).unwrap();
        assert!(resp.success, "exempt request was limited: {resp:?}");
    }
}

#[test]
fn responses_preserve_per_connection_order_under_concurrency() {
    let daemon = TestDaemon::start(|_| {}, None);

    let mut client_a = daemon.connect();
    assert!(client_a.handshake().unwrap().success);

    let socket_path = daemon.socket_path.clone();
    let concurrent = thread::spawn(move || {
        let mut client_b = BlockingClient::connect(&socket_path).unwrap();
        client_b
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert!(client_b.handshake().unwrap().success);
        for id in ["x", "y"] {
            let mut request = IpcRequest::new("GET", "/health");
            request.request_id = Some(id.to_string());
            client_b.send(&request).unwrap();
        }
        for id in ["x", "y"] {
            let resp = client_b.recv().unwrap();
            assert_eq!(resp.metadata.request_id.as_deref(), Some(id));
        }
    });

    // All three requests written before any response is read.
    for id in ["a", "b", "c"] {
        let mut request = IpcRequest::new("GET", "/health");
        request.request_id = Some(id.to_string());
        client_a.send(&request).unwrap();
    }
    for id in ["a", "b", "c"] {
        let resp = client_a.recv().unwrap();
        assert_eq!(resp.metadata.request_id.as_deref(), Some(id));
    }

    concurrent.join().unwrap();
}

#[test]
fn unknown_route_reports_details_and_keeps_the_connection() {
    let daemon = TestDaemon::start(|_| {}, None);
    let mut client = daemon.connect();
    assert!(client.handshake().unwrap().success);

    let resp = client.request("GET", "/nope", None).unwrap();
    assert_error(&resp, "RESOURCE_NOT_FOUND");
    assert_eq!(
        resp.error.unwrap().details.unwrap(),
        json!({"method": "GET", "path": "/nope"})
    );

    assert!(client.request("GET", "/health", None).unwrap().success);
}

#[test]
fn server_info_is_served_on_the_wire() {
    let daemon = TestDaemon::start(|_| {}, None);
    let mut client = daemon.connect();
    assert!(client.handshake().unwrap().success);

    let resp = client.request("GET", "/server/info", None).unwrap();
    let data = resp.data.as_ref().unwrap();
    assert_eq!(data["pid"], json!(std::process::id()));
    assert_eq!(data["communication"], json!("Pure IPC"));
    assert_eq!(data["protocol_version"], json!("2.0"));
}

#[test]
fn clean_shutdown_removes_endpoint_files() {
    let daemon = TestDaemon::start(|_| {}, None);
    let descriptor = daemon.app_data.join("daemon.socket");
    let marker = daemon.app_data.join("daemon.port");
    let socket_path = daemon.socket_path.clone();

    assert!(descriptor.exists());
    assert!(marker.exists());
    let contents = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(contents, format!("0:{}", std::process::id()));

    daemon.stop();

    assert!(!descriptor.exists());
    assert!(!marker.exists());
    assert!(!socket_path.exists());
}

#[test]
fn idle_connections_are_closed() {
    let daemon = TestDaemon::start(|c| c.connection_timeout_seconds = 1, None);
    let mut client = daemon.connect();
    assert!(client.handshake().unwrap().success);

    thread::sleep(Duration::from_millis(1600));
    assert!(client.recv().is_err());
}
