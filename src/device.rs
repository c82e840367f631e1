//! The [`AntDevice`] dispatcher.
//!
//! An `AntDevice` owns one transport, runs the startup handshake, hands out
//! channel slots and routes every received frame to the channel it
//! addresses. All outbound frames of the device go through a single writer
//! task, so only one write is in flight on the physical link at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelOptions};
use crate::error::{Error, Result};
use crate::protocol::command;
use crate::protocol::frame::{FrameDecoder, validate_received};
use crate::protocol::message::{INDEX_CHANNEL, INDEX_DATA, INDEX_MSG_ID, MessageId, code};
use crate::transport::{
    BridgeConfig, BridgeTransport, Inbound, SerialConfig, SerialTransport, Transport,
};

/// Default time allowed for the whole startup handshake.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause after the device reported its reset.
pub const DEFAULT_RESET_SETTLE: Duration = Duration::from_secs(1);

/// Configuration of an [`AntDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Time allowed for the startup handshake.
    pub startup_timeout: Duration,
    /// Pause between the reset and the capability request.
    pub reset_settle: Duration,
    /// Index of the stick this device was opened for.
    pub device_no: usize,
    /// Options for every channel handed out by the device.
    pub channel: ChannelOptions,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            reset_settle: DEFAULT_RESET_SETTLE,
            device_no: 0,
            channel: ChannelOptions::default(),
        }
    }
}

impl DeviceConfig {
    /// Sets the startup timeout.
    #[must_use]
    pub const fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Sets the settle delay after reset.
    #[must_use]
    pub const fn reset_settle(mut self, delay: Duration) -> Self {
        self.reset_settle = delay;
        self
    }

    /// Sets the stick index.
    #[must_use]
    pub const fn device_no(mut self, device_no: usize) -> Self {
        self.device_no = device_no;
        self
    }

    /// Sets the channel options.
    #[must_use]
    pub const fn channel(mut self, options: ChannelOptions) -> Self {
        self.channel = options;
        self
    }
}

/// Reply awaited during the startup handshake.
///
/// No channel is open yet, so these replies are matched by the device rather
/// than routed to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingReply {
    /// A message with this id.
    MessageId(u8),
    /// A channel event responding to the command with this message id.
    ChannelEvent(u8),
}

impl PendingReply {
    /// Returns true if `frame` is the awaited reply.
    #[must_use]
    pub fn matches(self, frame: &[u8]) -> bool {
        match self {
            Self::MessageId(id) => frame.get(INDEX_MSG_ID) == Some(&id),
            Self::ChannelEvent(id) => {
                frame.get(INDEX_MSG_ID) == Some(&u8::from(MessageId::ChannelEvent))
                    && frame.get(INDEX_DATA) == Some(&id)
            }
        }
    }
}

/// Capabilities reported by the device during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Number of channels.
    pub max_channels: u8,
    /// Whether the device supports continuous scan mode.
    pub can_scan: bool,
}

impl Capabilities {
    /// Parses a capabilities message.
    #[must_use]
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let max_channels = *frame.get(3)?;
        let options = *frame.get(7)?;
        Some(Self {
            max_channels,
            can_scan: options & 0x06 == 0x06,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routing state shared with the frame-processing task.
#[derive(Default)]
struct Router {
    slots: Mutex<Vec<Option<Channel>>>,
    pending: Mutex<Option<(PendingReply, oneshot::Sender<Bytes>)>>,
}

impl Router {
    fn on_frame(&self, frame: &[u8]) {
        tracing::trace!("rx: {}", hex::encode(frame));
        if let Err(e) = validate_received(frame) {
            tracing::warn!("dropping frame {}: {}", hex::encode(frame), e);
            return;
        }

        {
            let mut pending = lock(&self.pending);
            if pending.as_ref().is_some_and(|(reply, _)| reply.matches(frame))
                && let Some((_, tx)) = pending.take()
            {
                let _ = tx.send(Bytes::copy_from_slice(frame));
                return;
            }
        }

        let number = usize::from(frame[INDEX_CHANNEL]);
        let channel = lock(&self.slots).get(number).cloned().flatten();
        match channel {
            Some(channel) => channel.handle_frame(frame),
            None => tracing::debug!("no channel {} for frame {}", number, hex::encode(frame)),
        }
    }
}

async fn write_loop<T: Transport>(
    transport: Arc<tokio::sync::Mutex<T>>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = frames.recv().await {
        tracing::trace!("tx: {}", hex::encode(&frame));
        let result = transport.lock().await.write(frame).await;
        if let Err(e) = result {
            tracing::error!("write failed: {}", e);
        }
    }
}

async fn process_loop(mut inbound: mpsc::Receiver<Inbound>, router: Arc<Router>) {
    let mut decoder = FrameDecoder::new();
    while let Some(item) = inbound.recv().await {
        match item {
            Inbound::Bytes(chunk) => {
                for frame in decoder.feed(&chunk) {
                    router.on_frame(&frame);
                }
            }
            Inbound::Frame(frame) => router.on_frame(&frame),
        }
    }
    tracing::debug!("inbound stream ended");
}

/// An ANT USB stick and its channels.
pub struct AntDevice<T> {
    transport: Arc<tokio::sync::Mutex<T>>,
    config: DeviceConfig,
    router: Arc<Router>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    capabilities: Option<Capabilities>,
    write_task: Option<JoinHandle<()>>,
    process_task: Option<JoinHandle<()>>,
}

impl AntDevice<SerialTransport> {
    /// Creates a device on a serial port or a discovered stick.
    #[must_use]
    pub fn serial(config: SerialConfig) -> Self {
        let device_config = DeviceConfig::default().device_no(config.device_no);
        Self::new(SerialTransport::new(config), device_config)
    }
}

impl AntDevice<BridgeTransport<ChildStdout, ChildStdin>> {
    /// Creates a device behind a helper process.
    pub fn bridge(config: BridgeConfig) -> Result<Self> {
        let device_config = DeviceConfig::default().device_no(config.device_no);
        Ok(Self::new(BridgeTransport::spawn(config)?, device_config))
    }
}

impl<T: Transport> AntDevice<T> {
    /// Creates a device on the given transport.
    #[must_use]
    pub fn new(transport: T, config: DeviceConfig) -> Self {
        Self {
            transport: Arc::new(tokio::sync::Mutex::new(transport)),
            config,
            router: Arc::new(Router::default()),
            writer: None,
            capabilities: None,
            write_task: None,
            process_task: None,
        }
    }

    /// Opens the transport and runs the startup handshake.
    ///
    /// # Errors
    ///
    /// - [`Error::NoDevice`] if no compatible stick was found
    /// - [`Error::Startup`] if the stick did not complete the handshake
    /// - any other transport error
    pub async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let inbound = self.transport.lock().await.open().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.write_task = Some(tokio::spawn(write_loop(Arc::clone(&self.transport), rx)));
        self.process_task = Some(tokio::spawn(process_loop(inbound, Arc::clone(&self.router))));

        let result = tokio::time::timeout(self.config.startup_timeout, self.startup(&tx)).await;
        let reason = match result {
            Ok(Ok(capabilities)) => {
                tracing::info!(
                    "device {} ready: {} channels, scan {}",
                    self.config.device_no,
                    capabilities.max_channels,
                    capabilities.can_scan
                );
                *lock(&self.router.slots) = vec![None; usize::from(capabilities.max_channels)];
                self.capabilities = Some(capabilities);
                self.writer = Some(tx);
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no reply within {:?}", self.config.startup_timeout),
        };

        tracing::warn!("device {} startup failed: {}", self.config.device_no, reason);
        lock(&self.router.pending).take();
        self.stop_tasks();
        if let Err(e) = self.transport.lock().await.close().await {
            tracing::debug!("closing transport after failed startup: {}", e);
        }
        Err(Error::Startup { reason })
    }

    async fn startup(&self, writer: &mpsc::UnboundedSender<Bytes>) -> Result<Capabilities> {
        self.transact(
            writer,
            command::reset_system(),
            PendingReply::MessageId(MessageId::Startup.into()),
        )
        .await?;
        tokio::time::sleep(self.config.reset_settle).await;

        let reply = self
            .transact(
                writer,
                command::request_message(0, MessageId::Capabilities),
                PendingReply::MessageId(MessageId::Capabilities.into()),
            )
            .await?;
        let capabilities = Capabilities::parse(&reply).ok_or_else(|| Error::Startup {
            reason: format!("short capabilities message {}", hex::encode(&reply)),
        })?;

        let reply = self
            .transact(
                writer,
                command::set_network_key(),
                PendingReply::ChannelEvent(MessageId::NetworkKey.into()),
            )
            .await?;
        if let Some(&c) = reply.get(INDEX_DATA + 1)
            && c != code::RESPONSE_NO_ERROR
        {
            return Err(Error::CommandFailed {
                msg_id: MessageId::NetworkKey.into(),
                code: c,
            });
        }
        Ok(capabilities)
    }

    async fn transact(
        &self,
        writer: &mpsc::UnboundedSender<Bytes>,
        frame: Bytes,
        expect: PendingReply,
    ) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.router.pending) = Some((expect, tx));
        tracing::debug!("startup: sending {}, awaiting {:?}", hex::encode(&frame), expect);
        writer.send(frame).map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    fn stop_tasks(&mut self) {
        self.writer = None;
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
        if let Some(task) = self.process_task.take() {
            task.abort();
        }
    }

    /// Stops every channel and closes the transport.
    pub async fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        let channels: Vec<Channel> = lock(&self.router.slots).iter().flatten().cloned().collect();
        for channel in &channels {
            channel.stop_scanner().await;
            channel.stop_all_sensors().await;
            channel.flush();
        }
        lock(&self.router.slots).clear();
        self.capabilities = None;

        let result = self.transport.lock().await.close().await;
        self.stop_tasks();
        tracing::info!("device {} closed", self.config.device_no);
        result
    }

    /// Returns true after a successful [`open`](Self::open).
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Returns the number of channels, 0 while closed.
    #[must_use]
    pub fn max_channels(&self) -> u8 {
        self.capabilities.map_or(0, |c| c.max_channels)
    }

    /// Returns true if the device supports continuous scan mode.
    #[must_use]
    pub fn can_scan(&self) -> bool {
        self.capabilities.is_some_and(|c| c.can_scan)
    }

    /// Returns the stick index.
    #[must_use]
    pub const fn device_no(&self) -> usize {
        self.config.device_no
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Allocates the lowest free channel slot.
    ///
    /// Returns `None` while closed or when every slot is taken.
    #[must_use]
    pub fn get_channel(&self) -> Option<Channel> {
        let writer = self.writer.as_ref()?;
        let mut slots = lock(&self.router.slots);
        let index = slots.iter().position(Option::is_none)?;
        let number = u8::try_from(index).ok()?;
        let channel = Channel::new(number, writer.clone(), self.config.channel);
        slots[index] = Some(channel.clone());
        tracing::debug!("allocated channel {}", number);
        Some(channel)
    }

    /// Releases a channel slot.
    ///
    /// Pending commands of the channel fail with [`Error::Flushed`]. Stopping
    /// a scanner or sensor never frees its slot, and this does not close the
    /// radio channel; see [`release_channel`](Self::release_channel).
    pub fn free_channel(&self, channel: &Channel) {
        let mut slots = lock(&self.router.slots);
        if let Some(slot) = slots.get_mut(usize::from(channel.number()))
            && slot.as_ref().is_some_and(|c| c.same_channel(channel))
        {
            *slot = None;
            channel.flush();
            tracing::debug!("freed channel {}", channel.number());
        }
    }

    /// Stops whatever runs on the channel, then frees its slot.
    pub async fn release_channel(&self, channel: &Channel) {
        channel.stop_scanner().await;
        channel.stop_all_sensors().await;
        self.free_channel(channel);
    }
}

impl<T> Drop for AntDevice<T> {
    fn drop(&mut self) {
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
        if let Some(task) = self.process_task.take() {
            task.abort();
        }
    }
}
