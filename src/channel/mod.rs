//! Logical radio channels.
//!
//! A [`Channel`] is one numbered slot on the device. It is either idle,
//! scanning for every device in range, or bound to one sensor. Commands go
//! through the channel's [`CommandQueue`]; responses and RF events arrive
//! from the device dispatcher via [`Channel::handle_frame`].

pub mod queue;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{Error, FrameError, Result};
use crate::event::{Event, EventDispatcher, Subscription};
use crate::protocol::command;
use crate::protocol::message::{
    ChannelType, DEFAULT_FREQUENCY, EVENT_RF, INDEX_CHANNEL, INDEX_DATA, INDEX_MSG_ID,
    LIB_CONFIG_EXTENDED, MessageId, code,
};
use crate::sensors::{ChannelConfig, DeviceData, Sensor, SensorState};

pub use queue::{CommandQueue, Outgoing};

/// Default time allowed for a start sequence.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for the channel-closed event.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tuning of a channel's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Time allowed for the whole scanner or sensor start sequence.
    pub start_timeout: Duration,
    /// Time to wait for the channel-closed event before giving up.
    pub close_timeout: Duration,
    /// Restart the sensor after more than this many collisions.
    ///
    /// `None` only counts collisions.
    pub collision_restart_threshold: Option<u32>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            start_timeout: DEFAULT_START_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            collision_restart_threshold: None,
        }
    }
}

impl ChannelOptions {
    /// Sets the start timeout.
    #[must_use]
    pub const fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Sets the close timeout.
    #[must_use]
    pub const fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Enables restarting the sensor after `collisions` collisions.
    #[must_use]
    pub const fn collision_restart_threshold(mut self, collisions: Option<u32>) -> Self {
        self.collision_restart_threshold = collisions;
        self
    }
}

/// What a channel is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Not configured.
    #[default]
    Idle,
    /// Continuous scan for all devices in range.
    Scanning,
    /// Searching for or paired with one sensor.
    Sensor,
}

struct ChannelState {
    role: Role,
    queue: CommandQueue,
    sensor: Option<Box<dyn Sensor>>,
    scan_decoders: Vec<Box<dyn Sensor>>,
    closing: Option<oneshot::Sender<()>>,
    // set from the first start command until the close handshake ran
    assigned: bool,
    collisions: u32,
    restart_pending: bool,
}

struct ChannelInner {
    number: u8,
    writer: mpsc::UnboundedSender<Bytes>,
    options: ChannelOptions,
    events: EventDispatcher,
    state: Mutex<ChannelState>,
}

/// Handle to a logical channel.
///
/// Clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.inner.number)
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(number: u8, writer: mpsc::UnboundedSender<Bytes>, options: ChannelOptions) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                number,
                writer,
                options,
                events: EventDispatcher::default(),
                state: Mutex::new(ChannelState {
                    role: Role::Idle,
                    queue: CommandQueue::new(),
                    sensor: None,
                    scan_decoders: Vec::new(),
                    closing: None,
                    assigned: false,
                    collisions: 0,
                    restart_pending: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the channel number.
    #[must_use]
    pub fn number(&self) -> u8 {
        self.inner.number
    }

    /// Returns the current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.lock().role
    }

    /// Returns the number of collisions counted while a command was in flight.
    #[must_use]
    pub fn collisions(&self) -> u32 {
        self.lock().collisions
    }

    /// Returns the options the channel was created with.
    #[must_use]
    pub fn options(&self) -> ChannelOptions {
        self.inner.options
    }

    /// Subscribes to the channel's events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    /// Returns the channel's event dispatcher.
    #[must_use]
    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    /// Returns true if both handles refer to the same channel.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the attached sensor's state for a device.
    #[must_use]
    pub fn snapshot(&self, device_id: u16) -> Option<SensorState> {
        self.lock().sensor.as_ref()?.snapshot(device_id)
    }

    /// Sends a command and waits for its resolution.
    ///
    /// The command is written at once if nothing is in flight; otherwise it
    /// waits in the queue and replaces a waiting command with the same
    /// message id. Without a timeout the command waits until a response
    /// arrives or the queue is flushed.
    pub async fn send_message(&self, frame: Bytes, timeout: Option<Duration>) -> Result<()> {
        if frame.len() <= INDEX_CHANNEL {
            return Err(FrameError::TooShort(frame.len()).into());
        }
        let number = self.number();
        if frame[INDEX_CHANNEL] != number {
            return Err(Error::InvalidChannel {
                expected: number,
                got: frame[INDEX_CHANNEL],
            });
        }
        if self.inner.writer.is_closed() {
            return Err(Error::NotOpen);
        }

        let msg_id = frame[INDEX_MSG_ID];
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if let Some(outgoing) = state.queue.submit(msg_id, frame, timeout, tx) {
                self.transmit(&mut state, outgoing);
            } else {
                tracing::debug!("channel {}: queued command 0x{:02x}", number, msg_id);
            }
        }
        rx.await.unwrap_or(Err(Error::ChannelClosed))
    }

    /// Fails every queued and in-flight command with [`Error::Flushed`].
    pub fn flush(&self) {
        let mut state = self.lock();
        if !state.queue.is_empty() {
            tracing::debug!("channel {}: flushing {} commands", self.number(), state.queue.len());
        }
        state.queue.flush();
    }

    fn write(&self, frame: Bytes) {
        tracing::trace!("channel {} tx: {}", self.number(), hex::encode(&frame));
        if self.inner.writer.send(frame).is_err() {
            tracing::warn!("channel {}: device writer is closed", self.number());
        }
    }

    fn transmit(&self, state: &mut ChannelState, outgoing: Outgoing) {
        self.write(outgoing.frame);
        let Some(timeout) = outgoing.timeout else {
            return;
        };
        let seq = outgoing.seq;
        let channel = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = Weak::upgrade(&channel) {
                Self { inner }.on_timeout(seq);
            }
        });
        state.queue.set_timer(seq, timer.abort_handle());
    }

    fn on_timeout(&self, seq: u64) {
        let mut state = self.lock();
        if let Some(next) = state.queue.expire(seq) {
            self.transmit(&mut state, next);
        }
    }

    /// Handles a frame routed to this channel by the device.
    pub(crate) fn handle_frame(&self, frame: &[u8]) {
        if frame.get(INDEX_MSG_ID) == Some(&u8::from(MessageId::ChannelEvent)) {
            match (frame.get(INDEX_DATA), frame.get(INDEX_DATA + 1)) {
                (Some(&msg_id), Some(&code)) => self.on_channel_event(msg_id, code),
                _ => tracing::warn!("channel {}: short channel event {}", self.number(), hex::encode(frame)),
            }
        } else {
            self.on_data(frame);
        }
    }

    fn on_channel_event(&self, msg_id: u8, code: u8) {
        let number = self.number();
        self.inner.events.dispatch(Event::Status {
            channel: number,
            msg_id,
            code,
        });

        let mut state = self.lock();
        if let Some(sensor) = state.sensor.as_mut() {
            sensor.on_event(number, msg_id, code);
        }

        let mut next = None;
        if msg_id == EVENT_RF {
            match code {
                code::EVENT_TRANSFER_TX_COMPLETED => next = state.queue.resolve_head(Ok(())),
                c if code::is_transfer_failure(c) => {
                    if c == code::EVENT_CHANNEL_CLOSED
                        && let Some(closing) = state.closing.take()
                    {
                        let _ = closing.send(());
                    }
                    if let Some(head) = state.queue.head_msg_id() {
                        tracing::debug!("channel {}: command 0x{:02x} failed with 0x{:02x}", number, head, c);
                        next = state.queue.resolve_head(Err(Error::CommandFailed {
                            msg_id: head,
                            code: c,
                        }));
                    }
                }
                code::EVENT_RX_SEARCH_TIMEOUT => {
                    if state.role == Role::Scanning {
                        tracing::debug!("channel {}: scan search timeout, stopping scanner", number);
                        let channel = self.clone();
                        tokio::spawn(async move { channel.stop_scanner().await });
                    } else {
                        tracing::debug!("channel {}: search timeout", number);
                    }
                }
                code::EVENT_RX_FAIL => tracing::debug!("channel {}: rx fail", number),
                code::EVENT_CHANNEL_COLLISION => {
                    if state.queue.in_flight() {
                        state.collisions += 1;
                        tracing::warn!("channel {}: collision ({} total)", number, state.collisions);
                        self.check_collisions(&mut state);
                    }
                }
                _ => {}
            }
        } else if state.queue.head_msg_id() == Some(msg_id) {
            let result = if code == code::RESPONSE_NO_ERROR {
                Ok(())
            } else {
                tracing::warn!("channel {}: command 0x{:02x} rejected with 0x{:02x}", number, msg_id, code);
                Err(Error::CommandFailed { msg_id, code })
            };
            next = state.queue.resolve_head(result);
        }

        if let Some(next) = next {
            self.transmit(&mut state, next);
        }
    }

    fn check_collisions(&self, state: &mut ChannelState) {
        let Some(threshold) = self.inner.options.collision_restart_threshold else {
            return;
        };
        if state.collisions <= threshold || state.role != Role::Sensor || state.restart_pending {
            return;
        }
        tracing::warn!("channel {}: too many collisions, restarting sensor", self.number());
        state.restart_pending = true;
        state.queue.flush();
        let channel = self.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.restart_sensor().await {
                tracing::warn!("channel {}: restart failed: {}", channel.number(), e);
            }
            channel.lock().restart_pending = false;
        });
    }

    fn on_data(&self, frame: &[u8]) {
        let number = self.number();
        let now = Instant::now();
        let mut updates: Vec<DeviceData> = Vec::new();
        let scanning = {
            let mut state = self.lock();
            let scanning = state.role == Role::Scanning;
            if let Some(sensor) = state.sensor.as_mut() {
                updates.extend(sensor.on_message(number, frame, now));
            }
            if scanning {
                for decoder in &mut state.scan_decoders {
                    updates.extend(decoder.on_message(number, frame, now));
                }
            }
            scanning
        };

        for update in updates {
            if scanning {
                self.inner.events.dispatch(Event::Detected {
                    channel: number,
                    profile: update.profile,
                    device_id: update.device_id,
                });
            }
            self.inner.events.dispatch(Event::Data {
                channel: number,
                profile: update.profile,
                device_id: update.device_id,
                state: update.state,
            });
        }
    }

    /// Sends each frame in order, bounded by the start timeout as a whole.
    async fn run_sequence(&self, label: &str, frames: Vec<Bytes>) -> Result<()> {
        let start_timeout = self.inner.options.start_timeout;
        let deadline = Instant::now() + start_timeout;
        self.lock().assigned = true;
        for frame in frames {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(start_timeout));
            }
            let msg_id = frame[INDEX_MSG_ID];
            if let Err(e) = self.send_message(frame, Some(remaining)).await {
                tracing::warn!(
                    "channel {}: {} start failed at command 0x{:02x}: {}",
                    self.number(),
                    label,
                    msg_id,
                    e
                );
                return Err(match e {
                    Error::Timeout { .. } => Error::timeout(start_timeout),
                    other => other,
                });
            }
        }
        Ok(())
    }

    /// Starts a continuous scan for all devices in range.
    ///
    /// Only channel 0 can scan. A running sensor is stopped first. A failed
    /// start leaves the partial configuration in place; [`stop_scanner`]
    /// or [`close`] still tears it down.
    ///
    /// [`stop_scanner`]: Self::stop_scanner
    /// [`close`]: Self::close
    pub async fn start_scanner(&self) -> Result<()> {
        let number = self.number();
        if number != 0 {
            return Err(Error::InvalidState("only channel 0 can scan"));
        }
        match self.role() {
            Role::Scanning => return Ok(()),
            Role::Sensor => self.stop_all_sensors().await,
            Role::Idle => {}
        }

        let frames = vec![
            command::assign_channel(number, ChannelType::Receive),
            command::set_device(number, 0, 0, 0),
            command::set_frequency(number, DEFAULT_FREQUENCY),
            command::enable_rx_ext(),
            command::lib_config(number, LIB_CONFIG_EXTENDED),
            command::open_rx_scan(),
        ];
        self.run_sequence("scanner", frames).await?;

        self.lock().role = Role::Scanning;
        tracing::info!("channel {}: scanning", number);
        Ok(())
    }

    /// Stops the scanner and returns the channel to idle.
    ///
    /// Does nothing unless the channel is scanning or was left configured
    /// by a failed start.
    pub async fn stop_scanner(&self) {
        if !matches!(self.stop_target(), Some(Role::Scanning | Role::Idle)) {
            return;
        }
        self.close().await;
        tracing::info!("channel {}: scanner stopped", self.number());
    }

    /// Registers an additional decoder consulted while scanning.
    pub fn add_scan_decoder(&self, decoder: impl Sensor + 'static) {
        self.lock().scan_decoders.push(Box::new(decoder));
    }

    /// Opens the channel for `sensor` and attaches it.
    ///
    /// A running scanner is stopped first. On failure the sensor is not
    /// attached and the partial configuration stays until the channel is
    /// stopped or closed.
    pub async fn start_sensor(&self, sensor: impl Sensor + 'static) -> Result<()> {
        match self.role() {
            Role::Sensor => return Err(Error::InvalidState("sensor already started")),
            Role::Scanning => self.stop_scanner().await,
            Role::Idle => {}
        }

        let config = sensor.channel_config();
        let device_id = sensor.device_id();
        let device_type = sensor.profile().device_type();
        self.open_sensor(config, device_id, device_type).await?;

        let mut state = self.lock();
        tracing::info!("channel {}: {} sensor {} started", self.number(), sensor.profile(), device_id);
        state.sensor = Some(Box::new(sensor));
        state.role = Role::Sensor;
        Ok(())
    }

    async fn open_sensor(&self, config: ChannelConfig, device_id: u16, device_type: u8) -> Result<()> {
        let number = self.number();
        let frames = vec![
            command::assign_channel(number, config.channel_type),
            command::set_device(number, device_id, device_type, config.transmission_type),
            command::set_search_timeout(number, config.search_timeout),
            command::set_frequency(number, config.frequency),
            command::set_period(number, config.period),
            command::lib_config(number, LIB_CONFIG_EXTENDED),
            command::open_channel(number),
        ];
        self.run_sequence("sensor", frames).await
    }

    /// Stops the sensor, closes the channel and returns the detached sensor.
    ///
    /// The channel slot stays allocated; use
    /// [`AntDevice::release_channel`](crate::AntDevice::release_channel) to
    /// stop and free it in one step.
    pub async fn stop_sensor(&self) -> Option<Box<dyn Sensor>> {
        let sensor = self.detach();
        if matches!(self.stop_target(), Some(Role::Sensor | Role::Idle)) {
            self.close().await;
            tracing::info!("channel {}: sensor stopped", self.number());
        }
        sensor
    }

    /// Stops every sensor on the channel.
    pub async fn stop_all_sensors(&self) {
        drop(self.stop_sensor().await);
    }

    /// Re-runs the open sequence for the attached sensor.
    ///
    /// Pending commands are flushed first so late acknowledgements of the old
    /// session cannot resolve commands of the new one.
    pub async fn restart_sensor(&self) -> Result<()> {
        let (config, device_id, device_type) = {
            let state = self.lock();
            let sensor = state
                .sensor
                .as_ref()
                .ok_or(Error::InvalidState("no sensor attached"))?;
            (sensor.channel_config(), sensor.device_id(), sensor.profile().device_type())
        };

        tracing::info!("channel {}: restarting sensor {}", self.number(), device_id);
        self.flush();
        // the role stays Sensor so a failed reopen can still be stopped
        self.close_handshake().await;
        self.open_sensor(config, device_id, device_type).await?;

        self.lock().collisions = 0;
        Ok(())
    }

    /// Binds a sensor to the channel, replacing any previous one.
    pub fn attach(&self, sensor: impl Sensor + 'static) {
        self.lock().sensor = Some(Box::new(sensor));
    }

    /// Unbinds the attached sensor.
    pub fn detach(&self) -> Option<Box<dyn Sensor>> {
        self.lock().sensor.take()
    }

    /// Returns the role a stop has to tear down, if any.
    ///
    /// A channel left configured by a failed start reports `Idle`.
    fn stop_target(&self) -> Option<Role> {
        let state = self.lock();
        match state.role {
            Role::Idle if !state.assigned => None,
            role => Some(role),
        }
    }

    /// Closes and unassigns the channel and returns it to idle.
    ///
    /// Resolves once the channel-closed event arrived and the channel was
    /// unassigned, or after the close timeout without it. The attached
    /// sensor, if any, stays attached.
    pub async fn close(&self) {
        self.close_handshake().await;
        self.lock().role = Role::Idle;
    }

    async fn close_handshake(&self) {
        let number = self.number();
        let close_timeout = self.inner.options.close_timeout;
        let (tx, rx) = oneshot::channel();
        self.lock().closing = Some(tx);
        self.write(command::close_channel(number));

        match tokio::time::timeout(close_timeout, rx).await {
            Ok(Ok(())) => {
                let unassign = command::unassign_channel(number);
                if let Err(e) = self.send_message(unassign, Some(close_timeout)).await {
                    tracing::warn!("channel {}: unassign failed: {}", number, e);
                }
            }
            _ => tracing::warn!("channel {}: no close confirmation within {:?}", number, close_timeout),
        }

        let mut state = self.lock();
        state.closing = None;
        state.assigned = false;
    }
}
