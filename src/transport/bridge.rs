//! Line-oriented bridge to an ANT helper process.
//!
//! Some platforms cannot open the stick directly; a helper process owns the
//! USB device and exchanges text lines over its stdio instead:
//!
//! - `message/<hex>`: a frame, sent without sync and length bytes, received
//!   as a complete frame
//! - `request/<id>/<command>[/<arg>...]` answered by `response/<id>/<arg>...`
//! - `ping/<unix ms>`: keepalive while open
//! - `error/<text>` and `debug/<text>`: helper diagnostics

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::transport::{INBOUND_CAPACITY, Inbound, Transport};

/// Default helper binary name.
pub const DEFAULT_BINARY: &str = "antserver";

/// Default keepalive interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(100);

/// Default time to wait for a response line.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the helper-process bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path of the helper binary.
    pub binary_path: PathBuf,
    /// Index of the stick the helper should open.
    pub device_no: usize,
    /// Keepalive interval while open.
    pub ping_interval: Duration,
    /// Time to wait for a response to a request.
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from(DEFAULT_BINARY),
            device_no: 0,
            ping_interval: DEFAULT_PING_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    /// Creates a configuration for the given helper binary.
    #[must_use]
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            ..Self::default()
        }
    }

    /// Sets the stick index.
    #[must_use]
    pub const fn device_no(mut self, device_no: usize) -> Self {
        self.device_no = device_no;
        self
    }

    /// Sets the keepalive interval.
    #[must_use]
    pub const fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A parsed line from the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BridgeLine {
    Message(Bytes),
    Response { id: u64, args: Vec<String> },
    Error(String),
    Debug(String),
}

fn parse_line(line: &str) -> Result<BridgeLine> {
    let (kind, rest) = line.split_once('/').unwrap_or((line, ""));
    match kind {
        "message" => hex::decode(rest)
            .map(|data| BridgeLine::Message(Bytes::from(data)))
            .map_err(|e| Error::Bridge {
                message: format!("invalid message hex: {e}"),
            }),
        "response" => {
            let mut parts = rest.split('/');
            let id = parts
                .next()
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| Error::Bridge {
                    message: format!("invalid response: {line}"),
                })?;
            Ok(BridgeLine::Response {
                id,
                args: parts.map(str::to_owned).collect(),
            })
        }
        "error" => Ok(BridgeLine::Error(rest.to_owned())),
        "debug" => Ok(BridgeLine::Debug(rest.to_owned())),
        _ => Err(Error::Bridge {
            message: format!("unknown line: {line}"),
        }),
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// State shared with the read task.
#[derive(Default)]
struct Shared {
    inbound: Mutex<Option<mpsc::Sender<Inbound>>>,
    requests: Mutex<HashMap<u64, oneshot::Sender<Vec<String>>>>,
}

impl Shared {
    async fn handle_line(&self, line: &str) {
        match parse_line(line) {
            Ok(BridgeLine::Message(frame)) => {
                tracing::trace!("bridge rx: {}", hex::encode(&frame));
                let sender = self.inbound.lock().await.clone();
                match sender {
                    Some(sender) => {
                        if sender.send(Inbound::Frame(frame)).await.is_err() {
                            tracing::debug!("inbound receiver dropped");
                        }
                    }
                    None => tracing::debug!("bridge not open, dropping message"),
                }
            }
            Ok(BridgeLine::Response { id, args }) => {
                match self.requests.lock().await.remove(&id) {
                    Some(reply) => {
                        let _ = reply.send(args);
                    }
                    None => tracing::warn!("response to unknown request {}", id),
                }
            }
            Ok(BridgeLine::Error(message)) => tracing::warn!("bridge error: {}", message),
            Ok(BridgeLine::Debug(message)) => tracing::debug!("bridge: {}", message),
            Err(e) => tracing::warn!("{}", e),
        }
    }
}

async fn write_line<W>(writer: &Mutex<W>, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Transport speaking the helper's line protocol over any reader/writer pair.
pub struct BridgeTransport<R, W> {
    config: BridgeConfig,
    reader: Mutex<Option<R>>,
    writer: Arc<Mutex<W>>,
    shared: Arc<Shared>,
    next_request: u64,
    open: bool,
    read_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
}

impl BridgeTransport<ChildStdout, ChildStdin> {
    /// Launches the helper binary and bridges to its stdio.
    ///
    /// The helper is killed when the transport is dropped.
    pub fn spawn(config: BridgeConfig) -> Result<Self> {
        tracing::info!("starting bridge helper: {}", config.binary_path.display());
        let mut child = Command::new(&config.binary_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| Error::Bridge {
            message: "helper stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Bridge {
            message: "helper stdout unavailable".into(),
        })?;

        let mut transport = Self::new(stdout, stdin, config);
        transport.child = Mutex::new(Some(child));
        Ok(transport)
    }
}

impl<R, W> BridgeTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a bridge over an existing reader/writer pair.
    #[must_use]
    pub fn new(reader: R, writer: W, config: BridgeConfig) -> Self {
        Self {
            config,
            reader: Mutex::new(Some(reader)),
            writer: Arc::new(Mutex::new(writer)),
            shared: Arc::new(Shared::default()),
            next_request: 1,
            open: false,
            read_task: None,
            ping_task: None,
            child: Mutex::new(None),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn start_reader(&mut self) {
        let Some(reader) = self.reader.get_mut().take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        self.read_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.is_empty() => {}
                    Ok(Some(line)) => shared.handle_line(&line).await,
                    Ok(None) => {
                        tracing::debug!("bridge helper closed its output");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("bridge read error: {}", e);
                        break;
                    }
                }
            }
            // fail pending requests and end the inbound stream
            shared.requests.lock().await.clear();
            shared.inbound.lock().await.take();
        }));
    }

    async fn request(&mut self, command: &str, args: &[String]) -> Result<Vec<String>> {
        let id = self.next_request;
        self.next_request += 1;

        let (tx, rx) = oneshot::channel();
        self.shared.requests.lock().await.insert(id, tx);

        let mut line = format!("request/{id}/{command}");
        for arg in args {
            line.push('/');
            line.push_str(arg);
        }
        tracing::debug!("bridge tx: {}", line);
        if let Err(e) = write_line(&self.writer, &line).await {
            self.shared.requests.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(args)) => Ok(args),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                self.shared.requests.lock().await.remove(&id);
                Err(Error::timeout(self.config.request_timeout))
            }
        }
    }

    fn start_ping(&mut self) {
        let writer = Arc::clone(&self.writer);
        let interval = self.config.ping_interval;
        self.ping_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = write_line(&writer, &format!("ping/{}", unix_millis())).await {
                    tracing::debug!("bridge ping failed: {}", e);
                    return;
                }
            }
        }));
    }

    fn stop_ping(&mut self) {
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
    }
}

impl<R, W> Transport for BridgeTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn open(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<Inbound>>> {
        Box::pin(async move {
            if self.open {
                return Err(Error::InvalidState("bridge already open"));
            }
            self.start_reader();

            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            *self.shared.inbound.lock().await = Some(tx);

            let device_no = self.config.device_no.to_string();
            let opened = match self.request("open", &[device_no]).await {
                Ok(args) => args.last().is_some_and(|arg| arg == "true"),
                Err(e) => {
                    self.shared.inbound.lock().await.take();
                    return Err(e);
                }
            };
            if !opened {
                self.shared.inbound.lock().await.take();
                return Err(Error::Bridge {
                    message: format!("helper could not open device {}", self.config.device_no),
                });
            }

            self.open = true;
            self.start_ping();
            tracing::info!("bridge opened device {}", self.config.device_no);
            Ok(rx)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.open {
                return Ok(());
            }
            self.open = false;
            self.stop_ping();

            let result = self.request("close", &[]).await.map(|_| ());
            if let Err(e) = &result {
                tracing::warn!("bridge close failed: {}", e);
            }
            self.shared.inbound.lock().await.take();
            tracing::info!("bridge closed");
            result
        })
    }

    fn write(&mut self, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.open {
                return Err(Error::NotOpen);
            }
            let body = frame.get(2..).unwrap_or_default();
            write_line(&self.writer, &format!("message/{}", hex::encode(body))).await
        })
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl<R, W> Drop for BridgeTransport<R, W> {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
        if self.child.get_mut().is_some() {
            tracing::debug!("stopping bridge helper");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};

    use super::*;
    use crate::protocol::command;

    type TestBridge = BridgeTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    struct Helper {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Helper {
        async fn next_command(&mut self) -> String {
            loop {
                let line = self.lines.next_line().await.unwrap().unwrap();
                if !line.starts_with("ping/") {
                    return line;
                }
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }
    }

    fn pair(config: BridgeConfig) -> (TestBridge, Helper) {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        (
            BridgeTransport::new(client_r, client_w, config),
            Helper {
                lines: BufReader::new(server_r).lines(),
                writer: server_w,
            },
        )
    }

    async fn open(
        mut bridge: TestBridge,
        helper: &mut Helper,
        reply: &str,
    ) -> (TestBridge, Result<mpsc::Receiver<Inbound>>) {
        let task = tokio::spawn(async move {
            let result = bridge.open().await;
            (bridge, result)
        });
        assert_eq!(helper.next_command().await, "request/1/open/0");
        helper.send(reply).await;
        task.await.unwrap()
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("message/a40340004200").unwrap(),
            BridgeLine::Message(Bytes::from_static(&[0xA4, 0x03, 0x40, 0x00, 0x42, 0x00]))
        );
        assert_eq!(
            parse_line("response/7/open/true").unwrap(),
            BridgeLine::Response {
                id: 7,
                args: vec!["open".into(), "true".into()]
            }
        );
        assert_eq!(parse_line("debug/hello").unwrap(), BridgeLine::Debug("hello".into()));
        assert!(parse_line("message/zz").is_err());
        assert!(parse_line("response/x/open").is_err());
        assert!(parse_line("bogus").is_err());
    }

    #[tokio::test]
    async fn test_open_write_receive() {
        let (bridge, mut helper) = pair(BridgeConfig::default().ping_interval(Duration::from_secs(3600)));
        let (mut bridge, rx) = open(bridge, &mut helper, "response/1/open/true").await;
        let mut rx = rx.unwrap();
        assert!(bridge.is_open());

        bridge
            .write(command::assign_channel(0, crate::protocol::ChannelType::Receive))
            .await
            .unwrap();
        assert_eq!(helper.next_command().await, "message/42000000e5");

        helper.send("debug/ignored").await;
        helper.send("message/a40340004200").await;
        let inbound = rx.recv().await.unwrap();
        assert_eq!(
            inbound,
            Inbound::Frame(Bytes::from_static(&[0xA4, 0x03, 0x40, 0x00, 0x42, 0x00]))
        );

        let close = tokio::spawn(async move {
            let result = bridge.close().await;
            (bridge, result)
        });
        assert_eq!(helper.next_command().await, "request/2/close");
        helper.send("response/2/close/true").await;
        let (bridge, result) = close.await.unwrap();
        result.unwrap();
        assert!(!bridge.is_open());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_open_rejected() {
        let (bridge, mut helper) = pair(BridgeConfig::default());
        let (mut bridge, result) = open(bridge, &mut helper, "response/1/open/false").await;
        assert!(matches!(result, Err(Error::Bridge { .. })));
        assert!(!bridge.is_open());
        let err = bridge.write(Bytes::from_static(&[0xA4, 0x01, 0x4A, 0x00, 0xEF])).await;
        assert!(matches!(err, Err(Error::NotOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout() {
        let (mut bridge, mut helper) =
            pair(BridgeConfig::default().request_timeout(Duration::from_millis(200)));
        let task = tokio::spawn(async move { bridge.open().await.map(|_| ()) });
        assert_eq!(helper.next_command().await, "request/1/open/0");
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Timeout { timeout_ms: 200 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_while_open() {
        let (bridge, mut helper) = pair(BridgeConfig::default());
        let (_bridge, rx) = open(bridge, &mut helper, "response/1/open/true").await;
        rx.unwrap();

        let line = helper.lines.next_line().await.unwrap().unwrap();
        let stamp = line.strip_prefix("ping/").unwrap();
        assert!(stamp.parse::<u128>().is_ok());
    }
}
