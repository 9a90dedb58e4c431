use crate::{
    ble::{BleTransport, Notification, Transport},
    calibration::{CalibrationProgress, CalibrationSession},
    connection::{Channel, ConnectionMachine, LinkGuard, LinkStatus},
    error::{AuthError, DecodeError, ErrorKind, MountError, Result},
    events::{EventBus, MountEvent},
    preset::PresetStore,
    protocol::{
        self, Attribute, Field, PinCode, PinRole, PresetRecord, CALIBRATION_START, PRESET_SLOTS,
        UNKNOWN_ATTRIBUTES,
    },
    session::SessionManager,
    types::{
        AuthLevel, AutoMove, CalibrationState, ConnectionSnapshot, ConnectionState, DeviceState,
        MountConfig, MultiPinFeatures, Permission, PinMode, Preset, SessionState, Versions,
    },
    variant::{self, InitialReads, ProtocolVariant},
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex, MutexGuard, RwLock},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Client for one Vogels MotionMount
///
/// `MotionMount` owns the connection to a single mount, mirrors its state and
/// exposes its commands. A background task drives the connection:
///
/// - **Establishment**: connect, subscribe to every notifying attribute,
///   detect the protocol variant, read every attribute, authenticate with the
///   configured PIN.
/// - **Ready**: apply notifications as they arrive and re-read everything on
///   the refresh interval.
/// - **Recovery**: any transport failure or timeout tears the link down and
///   schedules another attempt after the reconnect interval, indefinitely,
///   until [`disconnect`](Self::disconnect) is called.
///
/// Commands are serialized: a multi-step command (preset writes,
/// authentication, verified settings) never interleaves with another.
///
/// # Examples
///
/// ```no_run
/// use motionmount::{MotionMount, MountConfig, Permission};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = MountConfig::new("AA:BB:CC:DD:EE:FF")
///         .with_pin(1234, Permission::ControlOnly);
///     let mount = MotionMount::ble(config).await?;
///     mount.connect().await?;
///
///     // Swing the TV out and turn it towards the couch
///     mount.set_distance(80).await?;
///     mount.set_rotation(-40).await?;
///
///     for preset in mount.presets().await {
///         println!("{}: {}", preset.slot_index, preset.name);
///     }
///
///     mount.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct MotionMount {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: MountConfig,
    transport: Arc<dyn Transport>,
    machine: RwLock<ConnectionMachine>,
    channel: RwLock<Option<Channel>>,
    state: RwLock<DeviceState>,
    presets: RwLock<PresetStore>,
    session: RwLock<SessionManager>,
    calibration: RwLock<CalibrationSession>,
    ops: Mutex<()>,
    events: EventBus,
}

/// Every readable attribute, decoded
struct Snapshot {
    distance: u8,
    rotation: i8,
    auto_move: AutoMove,
    freeze_preset: Option<u8>,
    tv_width: u8,
    name: String,
    versions: Versions,
    features: MultiPinFeatures,
    pin_mode: PinMode,
    opaque: BTreeMap<u8, Vec<u8>>,
    records: Vec<PresetRecord>,
    overflow: Vec<Vec<u8>>,
}

/// Exclusive access to the ready link for one command
struct Command<'a> {
    _ops: MutexGuard<'a, ()>,
    channel: Channel,
    variant: ProtocolVariant,
}

impl MotionMount {
    /// Create a client using `transport`
    ///
    /// Nothing is connected until [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new(config: MountConfig, transport: Arc<dyn Transport>) -> Self {
        let machine = ConnectionMachine::new(config.reconnect_interval());
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                machine: RwLock::new(machine),
                channel: RwLock::new(None),
                state: RwLock::new(DeviceState::default()),
                presets: RwLock::new(PresetStore::new()),
                session: RwLock::new(SessionManager::new()),
                calibration: RwLock::new(CalibrationSession::new()),
                ops: Mutex::new(()),
                events: EventBus::new(),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Create a client on the system Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn ble(config: MountConfig) -> Result<Self> {
        let transport = BleTransport::new().await?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// Start the connection and wait for the first attempt
    ///
    /// If the first attempt fails its error is returned, and the client keeps
    /// retrying in the background on the reconnect interval.
    ///
    /// # Errors
    ///
    /// Returns the first attempt's failure, or [`MountError::NotReady`] if a
    /// previous `connect` is still retrying.
    pub async fn connect(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            let state = self.shared.machine.read().await.state();
            if state == ConnectionState::Ready {
                return Ok(());
            }
            return Err(MountError::NotReady {
                reason: format!("connection attempt in progress ({state})"),
            });
        }

        self.shared.machine.write().await.begin_connect()?;
        self.shared.publish_connection().await;

        let (first_attempt, outcome) = oneshot::channel();
        *supervisor = Some(tokio::spawn(supervise(
            Arc::clone(&self.shared),
            first_attempt,
        )));
        drop(supervisor);

        outcome.await.unwrap_or(Err(MountError::Cancelled))
    }

    /// Disconnect and stop reconnecting
    ///
    /// Safe to call in any state. In-flight commands fail with
    /// [`MountError::Cancelled`], authentication and calibration state is
    /// dropped, and no further attempts are made until the next
    /// [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Currently infallible; the transport is closed on a best-effort basis.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.machine.write().await.stop();
        if let Some(channel) = self.shared.channel.read().await.as_ref() {
            channel.guard().close();
        }

        let task = self.supervisor.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        self.shared.teardown().await;
        self.shared.publish_connection().await;
        info!("Disconnected from MotionMount");
        Ok(())
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MountEvent> {
        self.shared.events.subscribe()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.shared.config
    }

    /// Connection state, protocol variant and last error
    pub async fn connection(&self) -> ConnectionSnapshot {
        self.shared.machine.read().await.snapshot()
    }

    /// Check if commands are accepted
    pub async fn is_ready(&self) -> bool {
        self.connection().await.state == ConnectionState::Ready
    }

    /// Mirror of the device
    pub async fn state(&self) -> DeviceState {
        self.shared.state.read().await.clone()
    }

    /// Existing presets in slot order
    pub async fn presets(&self) -> Vec<Preset> {
        self.shared.presets.read().await.selections_snapshot()
    }

    /// Slot at `index`, existing or not
    pub async fn preset(&self, index: u8) -> Option<Preset> {
        self.shared.presets.read().await.get(index).cloned()
    }

    /// Authentication state
    pub async fn session(&self) -> SessionState {
        self.shared.session.read().await.state()
    }

    /// Progress of a running calibration
    pub async fn calibration(&self) -> Option<CalibrationState> {
        self.shared.calibration.read().await.state()
    }

    /// Move to a distance from the wall (0..=100 percent)
    ///
    /// The mirrored distance follows the device's notifications; the
    /// requested value is recorded in [`DeviceState::requested_distance`].
    ///
    /// # Errors
    ///
    /// Returns [`MountError::CalibrationInProgress`] during calibration,
    /// [`MountError::PermissionDenied`] without control permission, an encode
    /// error outside 0..=100, or a transport error.
    pub async fn set_distance(&self, distance: u8) -> Result<()> {
        let command = self.movement(Attribute::Distance).await?;
        command
            .channel
            .write_field(Attribute::Distance, &Field::Distance(distance), command.variant)
            .await?;
        self.shared.state.write().await.requested_distance = Some(distance);
        Ok(())
    }

    /// Rotate (-100..=100 percent)
    ///
    /// # Errors
    ///
    /// See [`set_distance`](Self::set_distance).
    pub async fn set_rotation(&self, rotation: i8) -> Result<()> {
        let command = self.movement(Attribute::Rotation).await?;
        command
            .channel
            .write_field(Attribute::Rotation, &Field::Rotation(rotation), command.variant)
            .await?;
        self.shared.state.write().await.requested_rotation = Some(rotation);
        Ok(())
    }

    /// Move to a stored preset
    ///
    /// # Errors
    ///
    /// Returns [`MountError::PresetNotFound`] for an empty slot, plus the
    /// errors of [`set_distance`](Self::set_distance).
    pub async fn select_preset(&self, index: u8) -> Result<()> {
        let command = self.movement(Attribute::SelectPreset).await?;
        let exists = self
            .shared
            .presets
            .read()
            .await
            .get(index)
            .is_some_and(|p| p.exists);
        if !exists {
            return Err(MountError::PresetNotFound(index));
        }
        command
            .channel
            .write_field(Attribute::SelectPreset, &Field::SelectPreset(index), command.variant)
            .await
    }

    /// Store a preset in the first free slot and return its index
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NoFreeSlot`] when all seven slots are in use,
    /// [`MountError::PartialWrite`] if the record was written but the
    /// overflow name was not, or a validation, permission or transport error.
    pub async fn add_preset(&self, name: &str, distance: u8, rotation: i8) -> Result<u8> {
        let command = self.preset_command().await?;
        let mut staged = self.shared.presets.read().await.clone();
        let index = staged.add(name, distance, rotation, command.variant)?;
        self.write_preset(&command, staged, index).await?;
        info!("Added preset {} in slot {}", name, index);
        Ok(index)
    }

    /// Store a preset in a specific empty slot
    ///
    /// # Errors
    ///
    /// Returns [`MountError::SlotOccupied`] plus the errors of
    /// [`add_preset`](Self::add_preset).
    pub async fn add_preset_at(
        &self,
        index: u8,
        name: &str,
        distance: u8,
        rotation: i8,
    ) -> Result<()> {
        let command = self.preset_command().await?;
        let mut staged = self.shared.presets.read().await.clone();
        staged.add_at(index, name, distance, rotation, command.variant)?;
        self.write_preset(&command, staged, index).await
    }

    /// Rename a preset
    ///
    /// # Errors
    ///
    /// Returns [`MountError::PresetNotFound`] plus the errors of
    /// [`add_preset`](Self::add_preset).
    pub async fn set_preset_name(&self, index: u8, name: &str) -> Result<()> {
        let command = self.preset_command().await?;
        let mut staged = self.shared.presets.read().await.clone();
        staged.set_name(index, name, command.variant)?;
        self.write_preset(&command, staged, index).await
    }

    /// Change the distance stored in a preset
    ///
    /// # Errors
    ///
    /// See [`set_preset_name`](Self::set_preset_name).
    pub async fn set_preset_distance(&self, index: u8, distance: u8) -> Result<()> {
        let command = self.preset_command().await?;
        let mut staged = self.shared.presets.read().await.clone();
        staged.set_distance(index, distance)?;
        self.write_preset(&command, staged, index).await
    }

    /// Change the rotation stored in a preset
    ///
    /// # Errors
    ///
    /// See [`set_preset_name`](Self::set_preset_name).
    pub async fn set_preset_rotation(&self, index: u8, rotation: i8) -> Result<()> {
        let command = self.preset_command().await?;
        let mut staged = self.shared.presets.read().await.clone();
        staged.set_rotation(index, rotation)?;
        self.write_preset(&command, staged, index).await
    }

    /// Delete a preset; the slot becomes free
    ///
    /// # Errors
    ///
    /// See [`set_preset_name`](Self::set_preset_name).
    pub async fn delete_preset(&self, index: u8) -> Result<()> {
        let command = self.preset_command().await?;
        let mut staged = self.shared.presets.read().await.clone();
        staged.delete(index)?;
        self.write_preset(&command, staged, index).await?;
        info!("Deleted preset in slot {}", index);
        Ok(())
    }

    /// Set the auto-move mode
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotSaved`] if the device reads back a different
    /// value, or a permission, encode or transport error.
    pub async fn set_auto_move(&self, mode: AutoMove) -> Result<()> {
        let command = self.command().await?;
        self.write_verified(&command, Attribute::AutoMove, Field::AutoMove(mode))
            .await
    }

    /// Set the preset the mount returns to when the TV turns off
    ///
    /// # Errors
    ///
    /// See [`set_auto_move`](Self::set_auto_move).
    pub async fn set_freeze_preset(&self, index: u8) -> Result<()> {
        let command = self.command().await?;
        self.write_verified(&command, Attribute::Freeze, Field::FreezePreset(index))
            .await
    }

    /// Set the TV width (1..=243 cm)
    ///
    /// # Errors
    ///
    /// See [`set_auto_move`](Self::set_auto_move).
    pub async fn set_tv_width(&self, width_cm: u8) -> Result<()> {
        let command = self.command().await?;
        self.write_verified(&command, Attribute::TvWidth, Field::TvWidth(width_cm))
            .await
    }

    /// Rename the device (1..=20 bytes)
    ///
    /// # Errors
    ///
    /// See [`set_auto_move`](Self::set_auto_move).
    pub async fn set_name(&self, name: &str) -> Result<()> {
        let command = self.command().await?;
        self.write_verified(&command, Attribute::Name, Field::Name(name.to_string()))
            .await
    }

    /// Choose which settings authorised users may change
    ///
    /// # Errors
    ///
    /// See [`set_auto_move`](Self::set_auto_move).
    pub async fn set_multi_pin_features(&self, features: MultiPinFeatures) -> Result<()> {
        let command = self.command().await?;
        self.write_verified(
            &command,
            Attribute::MultiPinFeatures,
            Field::MultiPinFeatures(features),
        )
        .await
    }

    /// Set the authorised user PIN; `0` removes it
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotSaved`] if the pin information does not change
    /// accordingly, or a permission, encode or transport error.
    pub async fn set_user_pin(&self, pin: u16) -> Result<()> {
        let expected: fn(PinMode) -> bool = if pin == 0 {
            |mode| mode == PinMode::None
        } else {
            |mode| mode != PinMode::None
        };
        self.change_pin(pin, PinRole::User, expected).await
    }

    /// Set the supervisor PIN; `0` removes it
    ///
    /// # Errors
    ///
    /// See [`set_user_pin`](Self::set_user_pin).
    pub async fn set_supervisor_pin(&self, pin: u16) -> Result<()> {
        let expected: fn(PinMode) -> bool = if pin == 0 {
            |mode| mode == PinMode::UserOnly
        } else {
            |mode| mode == PinMode::UserAndSupervisor
        };
        self.change_pin(pin, PinRole::Supervisor, expected).await
    }

    /// Authenticate the current connection with a PIN for `role`
    ///
    /// The PIN is not remembered; it only unlocks this connection.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Rejected`] if the device does not grant the role.
    pub async fn authenticate(&self, pin: u16, role: PinRole) -> Result<()> {
        let command = self.command().await?;
        let result = self
            .shared
            .authenticate(&command.channel, pin, Some(role), command.variant)
            .await;
        self.shared.publish_session().await;
        result.map(|_| ())
    }

    /// Authenticate with the strongest role the PIN grants
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Rejected`] if no role is granted.
    pub async fn authenticate_best(&self, pin: u16) -> Result<()> {
        let command = self.command().await?;
        let result = self
            .shared
            .authenticate(&command.channel, pin, None, command.variant)
            .await;
        self.shared.publish_session().await;
        result.map(|_| ())
    }

    /// Start calibrating
    ///
    /// Progress is reported through [`MountEvent::CalibrationProgress`] and
    /// [`MountEvent::CalibrationFinished`]. Movement commands fail with
    /// [`MountError::CalibrationInProgress`] until it finishes.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::CalibrationInProgress`] if already calibrating,
    /// or a permission or transport error.
    pub async fn start_calibration(&self) -> Result<()> {
        let command = self.command().await?;
        self.shared
            .session
            .read()
            .await
            .authorize_write(Attribute::Calibrate)?;
        self.shared.calibration.write().await.start()?;

        let written = command
            .channel
            .write_field(
                Attribute::Calibrate,
                &Field::Calibration(CALIBRATION_START),
                command.variant,
            )
            .await;
        if let Err(e) = written {
            self.shared.calibration.write().await.clear();
            return Err(e);
        }
        info!("Calibration started");
        Ok(())
    }

    /// Re-read every readable attribute
    ///
    /// # Errors
    ///
    /// Returns a transport or decode error; on a decode error the mirror keeps
    /// its previous values.
    pub async fn refresh(&self) -> Result<()> {
        let command = self.command().await?;
        self.shared
            .sync(&command.channel, command.variant, false)
            .await
    }

    async fn command(&self) -> Result<Command<'_>> {
        let ops = self.shared.ops.lock().await;
        let snapshot = self.shared.machine.read().await.snapshot();
        if snapshot.state != ConnectionState::Ready {
            return Err(MountError::NotReady {
                reason: format!("connection is {}", snapshot.state),
            });
        }
        let channel = self.shared.channel.read().await.clone();
        match (channel, snapshot.protocol_variant) {
            (Some(channel), Some(variant)) => Ok(Command {
                _ops: ops,
                channel,
                variant,
            }),
            _ => Err(MountError::NotReady {
                reason: "no active link".to_string(),
            }),
        }
    }

    async fn movement(&self, attribute: Attribute) -> Result<Command<'_>> {
        let command = self.command().await?;
        if self.shared.calibration.read().await.is_running() {
            return Err(MountError::CalibrationInProgress);
        }
        self.shared.session.read().await.authorize_write(attribute)?;
        Ok(command)
    }

    async fn preset_command(&self) -> Result<Command<'_>> {
        let command = self.command().await?;
        let session = self.shared.session.read().await;
        session.authorize_write(Attribute::Preset(0))?;
        if command.variant.overflow_name_len().is_some() {
            session.authorize_write(Attribute::PresetName(0))?;
        }
        drop(session);
        Ok(command)
    }

    async fn write_preset(&self, command: &Command<'_>, staged: PresetStore, index: u8) -> Result<()> {
        let write = staged.encode_slot(index, command.variant)?;
        command
            .channel
            .write(Attribute::Preset(index), &write.record)
            .await?;

        if let Some(overflow) = &write.overflow {
            if let Err(e) = command
                .channel
                .write(Attribute::PresetName(index), overflow)
                .await
            {
                warn!("Preset {} record written but name incomplete: {}", index, e);
                return Err(MountError::PartialWrite {
                    index,
                    source: Box::new(e),
                });
            }
        }

        let preset = staged.get(index).cloned();
        *self.shared.presets.write().await = staged;
        if let Some(preset) = preset {
            self.shared.events.publish(MountEvent::PresetChanged(preset));
        }
        Ok(())
    }

    async fn write_verified(
        &self,
        command: &Command<'_>,
        attribute: Attribute,
        field: Field,
    ) -> Result<()> {
        self.shared.session.read().await.authorize_write(attribute)?;
        command
            .channel
            .write_field(attribute, &field, command.variant)
            .await?;

        let read_back = command
            .channel
            .read_field(attribute, command.variant)
            .await?;
        self.shared.apply_setting(&read_back).await;
        if read_back != field {
            warn!("{} read back {:?} after writing {:?}", attribute, read_back, field);
            return Err(MountError::NotSaved { attribute });
        }
        Ok(())
    }

    async fn change_pin(
        &self,
        pin: u16,
        role: PinRole,
        expected: fn(PinMode) -> bool,
    ) -> Result<()> {
        let command = self.command().await?;
        self.shared
            .session
            .read()
            .await
            .authorize_write(Attribute::ChangePin)?;
        command
            .channel
            .write_field(
                Attribute::ChangePin,
                &Field::Pin(PinCode { pin, role }),
                command.variant,
            )
            .await?;

        let data = command.channel.read(Attribute::PinSettings).await?;
        let mode = protocol::decode_pin_mode(&data, command.variant)?;
        if self.shared.session.write().await.set_pin_mode(mode) {
            self.shared.publish_session().await;
        }
        if !expected(mode) {
            return Err(MountError::NotSaved {
                attribute: Attribute::ChangePin,
            });
        }
        info!("{} PIN updated, device reports {:?}", AuthLevel::from(role), mode);
        Ok(())
    }
}

impl Drop for MotionMount {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.get_mut().take() {
            task.abort();
        }

        let shared = Arc::clone(&self.shared);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                shared.teardown().await;
            });
        }
    }
}

/// Drive connection attempts until stopped
async fn supervise(shared: Arc<Shared>, first_attempt: oneshot::Sender<Result<()>>) {
    let mut first_attempt = Some(first_attempt);

    loop {
        let (kind, failure) = match shared.establish().await {
            Ok((channel, notifications, variant)) => {
                if let Some(reply) = first_attempt.take() {
                    let _ = reply.send(Ok(()));
                }
                (shared.run_ready(&channel, notifications, variant).await, None)
            }
            Err(e) => {
                error!("Connection attempt failed: {}", e);
                (e.kind(), Some(e))
            }
        };

        shared.teardown().await;
        let delay = shared.machine.write().await.fail(kind);
        shared.publish_connection().await;

        // The caller of connect() sees the recorded failure
        if let (Some(reply), Some(e)) = (first_attempt.take(), failure) {
            let _ = reply.send(Err(e));
        }

        let Some(delay) = delay else {
            break;
        };
        shared.events.publish(MountEvent::ReconnectScheduled(delay));
        tokio::time::sleep(delay).await;

        {
            let mut machine = shared.machine.write().await;
            if machine.is_stopped() || machine.begin_connect().is_err() {
                break;
            }
        }
        shared.publish_connection().await;
    }
}

impl Shared {
    async fn establish(
        &self,
    ) -> Result<(Channel, mpsc::UnboundedReceiver<Notification>, ProtocolVariant)> {
        let timeouts = &self.config.timeouts;
        let link = tokio::time::timeout(
            timeouts.connect_timeout(),
            self.transport.connect(&self.config.address),
        )
        .await
        .map_err(|_| MountError::Timeout {
            timeout_ms: timeouts.connect_timeout_ms,
        })??;

        let channel = Channel::new(link.session, LinkGuard::new(), timeouts.operation_timeout());
        *self.channel.write().await = Some(channel.clone());
        self.transition(ConnectionState::Subscribing).await?;

        for attribute in Attribute::notifying() {
            match channel.subscribe(attribute).await {
                Ok(()) => {}
                Err(e) if channel.guard().status() != LinkStatus::Open => return Err(e),
                Err(e @ MountError::Timeout { .. }) => return Err(e),
                Err(e) => {
                    warn!("Subscription to {} failed, updates unavailable: {}", attribute, e);
                    self.events
                        .publish(MountEvent::SubscriptionDegraded(attribute));
                }
            }
        }

        self.transition(ConnectionState::Syncing).await?;
        let reads = InitialReads {
            pin_information: channel.read(Attribute::PinSettings).await?,
            mcp_versions: channel.read(Attribute::VersionsMcp).await?,
        };
        let variant = variant::detect(&reads)?;
        info!("MotionMount speaks the {} protocol", variant);
        self.machine.write().await.set_variant(variant)?;
        self.sync(&channel, variant, true).await?;

        self.authenticate_configured(&channel, variant).await?;

        self.transition(ConnectionState::Ready).await?;
        info!("MotionMount ready");
        Ok((channel, link.notifications, variant))
    }

    async fn authenticate_configured(&self, channel: &Channel, variant: ProtocolVariant) -> Result<()> {
        let Some(pin) = self.config.pin else {
            return Ok(());
        };
        let Some(role) = self.session.read().await.role_for(self.config.intent) else {
            debug!("Device has no PIN, skipping authentication");
            return Ok(());
        };

        self.transition(ConnectionState::Authenticating).await?;
        let role = match role {
            PinRole::Supervisor => None,
            PinRole::User => Some(PinRole::User),
        };
        let result = self.authenticate(channel, pin, role, variant).await;

        match result {
            Ok(_) => {
                self.publish_session().await;
                Ok(())
            }
            Err(MountError::Auth(e)) => {
                warn!("Configured PIN not accepted: {}", e);
                let requested = match e {
                    AuthError::Rejected { requested, .. } | AuthError::RoleUnavailable(requested) => {
                        requested
                    }
                };
                self.machine.write().await.record_error(ErrorKind::AuthRejected);
                self.events
                    .publish(MountEvent::AuthenticationRejected(requested));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Authenticate a copy of the session and commit the outcome
    ///
    /// `None` tries the strongest role. The session lock is only held to
    /// take the copy and to commit, and nothing is committed once the link
    /// has been closed.
    async fn authenticate(
        &self,
        channel: &Channel,
        pin: u16,
        role: Option<PinRole>,
        variant: ProtocolVariant,
    ) -> Result<Permission> {
        let mut attempt = self.session.read().await.clone();
        let result = match role {
            Some(role) => attempt.authenticate(channel, pin, role, variant).await,
            None => attempt.authenticate_best(channel, pin, variant).await,
        };

        if matches!(result, Ok(_) | Err(MountError::Auth(_))) {
            let mut session = self.session.write().await;
            if channel.guard().status() == LinkStatus::Open {
                session.commit(&attempt);
            }
        }
        result
    }

    async fn run_ready(
        &self,
        channel: &Channel,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        variant: ProtocolVariant,
    ) -> ErrorKind {
        let mut refresh = self.config.refresh_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                status = channel.guard().cancelled() => {
                    return match status {
                        LinkStatus::Failed(kind) => kind,
                        LinkStatus::Open | LinkStatus::Closed => ErrorKind::Cancelled,
                    };
                }
                notification = notifications.recv() => {
                    let Some(notification) = notification else {
                        warn!("Link to MotionMount lost");
                        channel.guard().fail(ErrorKind::Transport);
                        return ErrorKind::Transport;
                    };
                    self.handle_notification(channel, notification, variant).await;
                }
                () = next_refresh(&mut refresh) => {
                    let Ok(_ops) = self.ops.try_lock() else {
                        debug!("Command in progress, skipping periodic refresh");
                        continue;
                    };
                    debug!("Periodic refresh");
                    if let Err(e) = self.sync(channel, variant, false).await {
                        warn!("Periodic refresh failed: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_notification(
        &self,
        channel: &Channel,
        notification: Notification,
        variant: ProtocolVariant,
    ) {
        let Notification { attribute, value } = notification;
        match attribute {
            Attribute::Distance | Attribute::Rotation => {
                let mut state = self.state.write().await;
                let decoded = if attribute == Attribute::Distance {
                    protocol::decode_distance(&value, variant).map(|d| state.distance = d)
                } else {
                    protocol::decode_rotation(&value, variant).map(|r| state.rotation = r)
                };
                match decoded {
                    Ok(()) => {
                        let event = MountEvent::PositionChanged {
                            distance: state.distance,
                            rotation: state.rotation,
                        };
                        drop(state);
                        self.events.publish(event);
                    }
                    Err(e) => warn!("Ignoring {} notification: {}", attribute, e),
                }
            }
            Attribute::Calibrate => {
                debug!("Calibration notification payload {:02X?}", &value[..]);
                self.poll_calibration(channel).await;
            }
            Attribute::PinSettings => match protocol::decode_pin_mode(&value, variant) {
                Ok(mode) => {
                    if self.session.write().await.set_pin_mode(mode) {
                        self.publish_session().await;
                    }
                }
                Err(e) => warn!("Ignoring pin information notification: {}", e),
            },
            Attribute::Unknown(index) => {
                self.state
                    .write()
                    .await
                    .opaque
                    .insert(index, value.to_vec());
                self.events
                    .publish(MountEvent::OpaqueNotification { index, value });
            }
            other => debug!("Unhandled notification from {}", other),
        }
    }

    async fn poll_calibration(&self, channel: &Channel) {
        let step = match channel.read(Attribute::Calibrate).await {
            Ok(data) => protocol::decode_calibration(&data),
            Err(e) => {
                warn!("Reading calibration progress failed: {}", e);
                return;
            }
        };
        let step = match step {
            Ok(step) => step,
            Err(e) => {
                warn!("Ignoring calibration progress: {}", e);
                return;
            }
        };

        let progress = self.calibration.write().await.observe(step);
        match progress {
            Ok(CalibrationProgress::Step(step)) => {
                self.events.publish(MountEvent::CalibrationProgress(step));
            }
            Ok(CalibrationProgress::Finished) => {
                info!("Calibration finished");
                self.events.publish(MountEvent::CalibrationFinished);
            }
            Ok(CalibrationProgress::Ignored) => {}
            Err(MountError::CalibrationOutOfOrder { previous, observed }) => {
                warn!("Calibration step {} after step {}", observed, previous);
                self.events
                    .publish(MountEvent::CalibrationOutOfOrder { previous, observed });
            }
            Err(e) => warn!("Calibration progress rejected: {}", e),
        }
    }

    /// Read everything and replace the mirror
    ///
    /// The initial sync also starts a fresh session; later ones keep the
    /// authentication and only update the PIN mode and feature grants.
    async fn sync(&self, channel: &Channel, variant: ProtocolVariant, initial: bool) -> Result<()> {
        let snapshot = read_snapshot(channel, variant).await?;

        let mut presets = PresetStore::new();
        presets.load(&snapshot.records, &snapshot.overflow, variant)?;

        let state = {
            let mut state = self.state.write().await;
            state.distance = snapshot.distance;
            state.rotation = snapshot.rotation;
            state.auto_move = snapshot.auto_move;
            state.freeze_preset_index = snapshot.freeze_preset;
            state.tv_width_cm = snapshot.tv_width;
            state.name = snapshot.name;
            state.versions = snapshot.versions;
            state.multi_pin_features = snapshot.features;
            state.opaque = snapshot.opaque;
            state.clone()
        };
        *self.presets.write().await = presets;

        {
            let mut session = self.session.write().await;
            if initial {
                session.load(snapshot.pin_mode, snapshot.features);
            } else {
                session.set_pin_mode(snapshot.pin_mode);
                session.set_features(snapshot.features);
            }
        }

        self.events
            .publish(MountEvent::StateRefreshed(Box::new(state)));
        self.publish_session().await;
        Ok(())
    }

    async fn apply_setting(&self, field: &Field) {
        let mut state = self.state.write().await;
        match field {
            Field::AutoMove(mode) => state.auto_move = *mode,
            Field::FreezePreset(index) => state.freeze_preset_index = Some(*index),
            Field::TvWidth(width) => state.tv_width_cm = *width,
            Field::Name(name) => state.name.clone_from(name),
            Field::MultiPinFeatures(features) => {
                state.multi_pin_features = *features;
                drop(state);
                self.session.write().await.set_features(*features);
            }
            _ => {}
        }
    }

    async fn teardown(&self) {
        let channel = self.channel.write().await.take();
        if let Some(channel) = channel {
            channel.guard().close();
            channel.disconnect().await;
        }
        self.session.write().await.reset();
        self.calibration.write().await.clear();
    }

    async fn transition(&self, next: ConnectionState) -> Result<()> {
        self.machine.write().await.advance(next)?;
        self.publish_connection().await;
        Ok(())
    }

    async fn publish_connection(&self) {
        let snapshot = self.machine.read().await.snapshot();
        self.events.publish(MountEvent::ConnectionChanged(snapshot));
    }

    async fn publish_session(&self) {
        let state = self.session.read().await.state();
        self.events.publish(MountEvent::SessionChanged(state));
    }
}

async fn next_refresh(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn read_snapshot(channel: &Channel, variant: ProtocolVariant) -> Result<Snapshot> {
    let distance = protocol::decode_distance(&channel.read(Attribute::Distance).await?, variant)?;
    let rotation = protocol::decode_rotation(&channel.read(Attribute::Rotation).await?, variant)?;
    let auto_move = protocol::decode_auto_move(&channel.read(Attribute::AutoMove).await?, variant)?;
    // Out-of-table freeze slots read as unset
    let freeze_preset = match protocol::decode_freeze_preset(&channel.read(Attribute::Freeze).await?) {
        Ok(index) => Some(index),
        Err(e @ DecodeError::OutOfRange { .. }) => {
            warn!("Freeze preset not recognised: {}", e);
            None
        }
        Err(e) => return Err(e.into()),
    };
    let tv_width = protocol::decode_tv_width(&channel.read(Attribute::TvWidth).await?)?;
    let name = protocol::decode_name(&channel.read(Attribute::Name).await?)?;
    let pin_mode = protocol::decode_pin_mode(&channel.read(Attribute::PinSettings).await?, variant)?;
    let features =
        protocol::decode_multi_pin_features(&channel.read(Attribute::MultiPinFeatures).await?)?;
    let ceb = protocol::decode_ceb_version(&channel.read(Attribute::VersionsCeb).await?)?;
    let mcp = protocol::decode_mcp_versions(&channel.read(Attribute::VersionsMcp).await?, variant)?;

    let mut records = Vec::with_capacity(usize::from(PRESET_SLOTS));
    let mut overflow = Vec::new();
    for index in 0..PRESET_SLOTS {
        let data = channel.read(Attribute::Preset(index)).await?;
        records.push(protocol::decode_preset_record(&data, variant)?);
        if variant.overflow_name_len().is_some() {
            let data = channel.read(Attribute::PresetName(index)).await?;
            overflow.push(protocol::decode_preset_overflow(&data));
        }
    }

    let mut opaque = BTreeMap::new();
    for index in 0..UNKNOWN_ATTRIBUTES {
        match channel.read(Attribute::Unknown(index)).await {
            Ok(data) => {
                opaque.insert(index, data.to_vec());
            }
            Err(MountError::CharacteristicMissing(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(Snapshot {
        distance,
        rotation,
        auto_move,
        freeze_preset,
        tv_width,
        name,
        versions: Versions {
            ceb_bootloader: ceb,
            mcp_hardware: mcp.hardware,
            mcp_bootloader: mcp.bootloader,
            mcp_firmware: mcp.firmware,
        },
        features,
        pin_mode,
        opaque,
        records,
        overflow,
    })
}
