//! Shared test helpers for adbc-core integration tests.
//!
//! This module provides an in-process mock ADB server that speaks enough of
//! the host, transport, shell, reverse and sync protocols for the client to
//! be exercised end to end over real TCP sockets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use adbc_core::client::AdbClient;

// ---------------------------------------------------------------------------
// Tracing and temp files
// ---------------------------------------------------------------------------

/// Route client logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("adbc_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// A path in the system temp dir that no other test run will use.
pub fn unique_temp_path(name: &str) -> PathBuf {
    let id = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!("adbc_test_{}_{name}", &id[..8]))
}

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

/// Everything the mock server knows. Shared by all of its connections.
#[derive(Default)]
pub struct BrokerState {
    accepts: AtomicUsize,
    /// Connections whose client has hung up after being served.
    settled: AtomicUsize,
    /// Bytes received after a connection's request was answered.
    strays: AtomicUsize,
    /// `(serial, state)` rows reported by `host:devices-l`.
    devices: Mutex<Vec<(String, String)>>,
    /// Canned output per device service request, e.g. `shell:getprop`.
    outputs: Mutex<HashMap<String, String>>,
    /// Frames sent on `host:track-devices`.
    track_frames: Vec<String>,
    /// Keep the tracking connection open after the frames until the client
    /// hangs up.
    track_hold: bool,
    /// `(serial, local, remote)` host forwards.
    forwards: Mutex<Vec<(String, String, String)>>,
    /// `(serial, local, remote)` reverse mappings.
    reverses: Mutex<Vec<(String, String, String)>>,
    /// Device filesystem: path to `(mode, contents)`.
    files: Mutex<HashMap<String, (u32, Vec<u8>)>>,
}

impl BrokerState {
    pub fn with_devices(devices: &[(&str, &str)]) -> Self {
        let state = Self::default();
        *state.devices.lock().unwrap() = devices
            .iter()
            .map(|(serial, st)| (serial.to_string(), st.to_string()))
            .collect();
        state
    }

    /// Answer `request` (e.g. `"root:"` or `"shell:getprop"`) with `output`.
    pub fn output(self, request: &str, output: &str) -> Self {
        self.outputs
            .lock()
            .unwrap()
            .insert(request.to_string(), output.to_string());
        self
    }

    pub fn track(mut self, frames: &[&str], hold: bool) -> Self {
        self.track_frames = frames.iter().map(|f| f.to_string()).collect();
        self.track_hold = hold;
        self
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (0o100644, data.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<(u32, Vec<u8>)> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn forwards(&self) -> Vec<(String, String, String)> {
        self.forwards.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// MockBroker
// ---------------------------------------------------------------------------

/// A mock ADB server listening on an ephemeral loopback port.
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockBroker {
    pub async fn start(state: BrokerState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(state);

        let shared = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                shared.accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn client(&self) -> AdbClient {
        AdbClient::from_addr(self.addr)
    }

    pub fn state(&self) -> &BrokerState {
        &self.state
    }

    /// Number of connections accepted so far.
    pub fn accepts(&self) -> usize {
        self.state.accepts.load(Ordering::SeqCst)
    }

    /// Bytes clients sent on a connection after its one request was served.
    pub fn stray_bytes(&self) -> usize {
        self.state.strays.load(Ordering::SeqCst)
    }

    /// Wait until every accepted connection has been served and closed.
    pub async fn wait_settled(&self) {
        while self.state.settled.load(Ordering::SeqCst) < self.accepts() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.ok()?;
    let len = usize::from_str_radix(std::str::from_utf8(&header).ok()?, 16).ok()?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.ok()?;
    String::from_utf8(payload).ok()
}

async fn okay(stream: &mut TcpStream) {
    let _ = stream.write_all(b"OKAY").await;
}

fn framed(text: &str) -> Vec<u8> {
    let mut out = format!("{:04x}", text.len()).into_bytes();
    out.extend_from_slice(text.as_bytes());
    out
}

async fn frame(stream: &mut TcpStream, text: &str) {
    let _ = stream.write_all(&framed(text)).await;
}

async fn fail(stream: &mut TcpStream, message: &str) {
    let _ = stream.write_all(b"FAIL").await;
    frame(stream, message).await;
}

async fn sync_fail(stream: &mut TcpStream, message: &str) {
    let _ = stream.write_all(b"FAIL").await;
    let _ = stream
        .write_all(&(message.len() as u32).to_le_bytes())
        .await;
    let _ = stream.write_all(message.as_bytes()).await;
}

async fn hold_until_hangup(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

async fn serve(mut stream: TcpStream, state: Arc<BrokerState>) {
    handle(&mut stream, &state).await;

    // Anything the client sends after its request was answered belongs to
    // some other request that reused this socket.
    let _ = stream.shutdown().await;
    let mut buf = [0u8; 64];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
        state.strays.fetch_add(n, Ordering::SeqCst);
    }
    state.settled.fetch_add(1, Ordering::SeqCst);
}

async fn handle(stream: &mut TcpStream, state: &BrokerState) {
    let Some(request) = read_request(stream).await else {
        return;
    };
    let Some(serial) = serve_host(stream, state, &request).await else {
        return;
    };
    let Some(request) = read_request(stream).await else {
        return;
    };
    serve_device(stream, state, &serial, &request).await;
}

/// Handle one host request. Returns the serial when the connection switched
/// to transport mode.
async fn serve_host(stream: &mut TcpStream, state: &BrokerState, request: &str) -> Option<String> {
    match request {
        "host:version" => {
            okay(stream).await;
            frame(stream, "0029").await;
        }
        "host:kill" => okay(stream).await,
        "host:devices-l" => {
            let text: String = state
                .devices
                .lock()
                .unwrap()
                .iter()
                .map(|(serial, st)| format!("{serial}              {st} product:mock model:Mock\n"))
                .collect();
            okay(stream).await;
            frame(stream, &text).await;
        }
        "host:track-devices" => {
            okay(stream).await;
            for text in &state.track_frames {
                frame(stream, text).await;
            }
            if state.track_hold {
                hold_until_hangup(stream).await;
            }
        }
        "host:list-forward" => {
            let text: String = state
                .forwards()
                .iter()
                .map(|(serial, local, remote)| format!("{serial} {local} {remote}\n"))
                .collect();
            okay(stream).await;
            frame(stream, &text).await;
        }
        "host:killforward-all" => {
            state.forwards.lock().unwrap().clear();
            okay(stream).await;
            okay(stream).await;
        }
        _ => {
            if let Some(target) = request.strip_prefix("host:transport:") {
                let known = state.devices.lock().unwrap().iter().any(|(s, _)| s == target);
                if known {
                    okay(stream).await;
                    return Some(target.to_string());
                }
                fail(stream, &format!("device '{target}' not found")).await;
            } else if let Some(target) = request.strip_prefix("host:connect:") {
                okay(stream).await;
                frame(stream, &format!("connected to {target}")).await;
            } else if let Some(target) = request.strip_prefix("host:disconnect:") {
                okay(stream).await;
                frame(stream, &format!("disconnected {target}")).await;
            } else if let Some(rest) = request.strip_prefix("host-serial:") {
                host_serial(stream, state, rest).await;
            } else {
                fail(stream, &format!("unknown host service '{request}'")).await;
            }
        }
    }
    None
}

async fn host_serial(stream: &mut TcpStream, state: &BrokerState, rest: &str) {
    if let Some((serial, spec)) = rest.split_once(":forward:") {
        let (norebind, spec) = match spec.strip_prefix("norebind:") {
            Some(spec) => (true, spec),
            None => (false, spec),
        };
        let Some((local, remote)) = spec.split_once(';') else {
            fail(stream, "malformed forward spec").await;
            return;
        };
        let bound = bind(&state.forwards, serial, local, remote, norebind, |_| true);
        if bound {
            okay(stream).await;
            okay(stream).await;
        } else {
            fail(stream, "cannot rebind existing socket").await;
        }
    } else if let Some((_, local)) = rest.split_once(":killforward:") {
        let removed = {
            let mut forwards = state.forwards.lock().unwrap();
            let before = forwards.len();
            forwards.retain(|(_, l, _)| l != local);
            forwards.len() != before
        };
        if removed {
            okay(stream).await;
            okay(stream).await;
        } else {
            fail(stream, &format!("listener '{local}' not found")).await;
        }
    } else if let Some(serial) = rest.strip_suffix(":killforward-all") {
        state.forwards.lock().unwrap().retain(|(s, _, _)| s != serial);
        okay(stream).await;
        okay(stream).await;
    } else {
        fail(stream, "unknown host-serial service").await;
    }
}

/// Record a `local -> remote` rule, replacing an existing one on `local`
/// unless `norebind` is set. Returns `false` when the rebind was refused.
fn bind(
    rules: &Mutex<Vec<(String, String, String)>>,
    serial: &str,
    local: &str,
    remote: &str,
    norebind: bool,
    same_scope: impl Fn(&str) -> bool,
) -> bool {
    let mut rules = rules.lock().unwrap();
    let existing = rules
        .iter()
        .position(|(s, l, _)| same_scope(s) && l == local);
    match existing {
        Some(_) if norebind => return false,
        Some(index) => {
            rules.remove(index);
        }
        None => {}
    }
    rules.push((serial.to_string(), local.to_string(), remote.to_string()));
    true
}

async fn serve_device(stream: &mut TcpStream, state: &BrokerState, serial: &str, request: &str) {
    if request == "sync:" {
        okay(stream).await;
        serve_sync(stream, state).await;
        return;
    }
    if let Some(rest) = request.strip_prefix("reverse:") {
        okay(stream).await;
        serve_reverse(stream, state, serial, rest).await;
        return;
    }

    let daemon_service = ["shell:", "root:", "unroot:", "remount:", "tcpip:", "reboot:"]
        .iter()
        .any(|prefix| request.starts_with(prefix));
    if !daemon_service {
        fail(stream, &format!("unknown device service '{request}'")).await;
        return;
    }

    let canned = state.outputs.lock().unwrap().get(request).cloned();
    let output = match canned {
        Some(output) => output,
        None => match request.strip_prefix("shell:echo ") {
            Some(text) => format!("{text}\n"),
            None => String::new(),
        },
    };
    okay(stream).await;
    let _ = stream.write_all(output.as_bytes()).await;
}

async fn serve_reverse(stream: &mut TcpStream, state: &BrokerState, serial: &str, rest: &str) {
    if rest == "list-forward" {
        let text: String = state
            .reverses
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| s == serial)
            .map(|(_, local, remote)| format!("UsbFfs {local} {remote}\n"))
            .collect();
        okay(stream).await;
        frame(stream, &text).await;
    } else if let Some(spec) = rest.strip_prefix("forward:") {
        let (norebind, spec) = match spec.strip_prefix("norebind:") {
            Some(spec) => (true, spec),
            None => (false, spec),
        };
        let Some((local, remote)) = spec.split_once(';') else {
            fail(stream, "malformed reverse spec").await;
            return;
        };
        let bound = bind(&state.reverses, serial, local, remote, norebind, |s| s == serial);
        if bound {
            okay(stream).await;
        } else {
            fail(stream, "cannot rebind existing socket").await;
        }
    } else if let Some(local) = rest.strip_prefix("killforward:") {
        state
            .reverses
            .lock()
            .unwrap()
            .retain(|(s, l, _)| !(s == serial && l == local));
        okay(stream).await;
    } else if rest == "killforward-all" {
        state.reverses.lock().unwrap().retain(|(s, _, _)| s != serial);
        okay(stream).await;
    } else {
        fail(stream, "unknown reverse service").await;
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

async fn read_sync_message(stream: &mut TcpStream) -> Option<([u8; 4], u32, Vec<u8>)> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.ok()?;
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&header[..4]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if &tag == b"DONE" {
        return Some((tag, len, Vec::new()));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.ok()?;
    Some((tag, len, payload))
}

async fn serve_sync(stream: &mut TcpStream, state: &BrokerState) {
    while let Some((tag, _, payload)) = read_sync_message(stream).await {
        let path = String::from_utf8_lossy(&payload).into_owned();
        match &tag {
            b"SEND" => {
                let (path, mode) = match path.rsplit_once(',') {
                    Some((path, mode)) => (path.to_string(), mode.parse().unwrap_or(0)),
                    None => (path, 0),
                };
                let mut contents = Vec::new();
                loop {
                    match read_sync_message(stream).await {
                        Some((t, _, data)) if &t == b"DATA" => contents.extend_from_slice(&data),
                        Some((t, _, _)) if &t == b"DONE" => break,
                        _ => return,
                    }
                }
                if path.starts_with("/system/") {
                    sync_fail(stream, "Read-only file system").await;
                    continue;
                }
                state.files.lock().unwrap().insert(path, (mode, contents));
                let _ = stream.write_all(b"OKAY\0\0\0\0").await;
            }
            b"RECV" => match state.file(&path) {
                Some((_, contents)) => {
                    for chunk in contents.chunks(64 * 1024) {
                        let _ = stream.write_all(b"DATA").await;
                        let _ = stream
                            .write_all(&(chunk.len() as u32).to_le_bytes())
                            .await;
                        let _ = stream.write_all(chunk).await;
                    }
                    let _ = stream.write_all(b"DONE\0\0\0\0").await;
                }
                None => sync_fail(stream, "No such file or directory").await,
            },
            b"STAT" => {
                let (mode, size) = match state.file(&path) {
                    Some((mode, contents)) => (mode, contents.len() as u32),
                    None => (0, 0),
                };
                let _ = stream.write_all(b"STAT").await;
                let _ = stream.write_all(&mode.to_le_bytes()).await;
                let _ = stream.write_all(&size.to_le_bytes()).await;
                let _ = stream.write_all(&1_700_000_000u32.to_le_bytes()).await;
            }
            _ => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Programmable single-connection server
// ---------------------------------------------------------------------------

/// Behavior of a [`programmable_server`] for one incoming request.
pub enum MockBehavior {
    /// Read one request and reply with the given raw bytes, then close.
    Respond(Vec<u8>),
    /// Read one request and close without replying.
    Drop,
    /// Read one request and never reply.
    Hang,
}

/// Accept exactly one connection and act out `behavior` on it.
pub async fn programmable_server(behavior: MockBehavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        if read_request(&mut stream).await.is_none() {
            return;
        }
        match behavior {
            MockBehavior::Respond(bytes) => {
                let _ = stream.write_all(&bytes).await;
                let _ = stream.flush().await;
            }
            MockBehavior::Drop => {}
            MockBehavior::Hang => std::future::pending::<()>().await,
        }
    });

    addr
}
