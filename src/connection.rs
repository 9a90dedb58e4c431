use bytes::Bytes;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    ble::GattSession,
    error::{ErrorKind, MountError, Result},
    protocol::{self, Attribute, Field},
    types::{ConnectionSnapshot, ConnectionState},
    variant::ProtocolVariant,
};

/// Lifecycle of the connection, without any I/O
///
/// `Disconnected -> Connecting -> Subscribing -> Syncing -> (Authenticating)
/// -> Ready`, with a failure edge from every state back to `Disconnected`.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    snapshot: ConnectionSnapshot,
    reconnect_interval: Duration,
    stopped: bool,
}

impl ConnectionMachine {
    /// Machine retrying failed connections every `reconnect_interval`
    #[must_use]
    pub fn new(reconnect_interval: Duration) -> Self {
        Self {
            snapshot: ConnectionSnapshot::default(),
            reconnect_interval,
            stopped: true,
        }
    }

    /// Current observable state
    #[must_use]
    pub const fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot
    }

    /// Current machine state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.snapshot.state
    }

    /// Check if an explicit stop is in effect
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Start a connection attempt
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotReady`] unless the machine is disconnected.
    pub fn begin_connect(&mut self) -> Result<()> {
        if self.snapshot.state != ConnectionState::Disconnected {
            return Err(MountError::NotReady {
                reason: format!("cannot connect while {}", self.snapshot.state),
            });
        }
        self.stopped = false;
        self.snapshot.state = ConnectionState::Connecting;
        self.snapshot.protocol_variant = None;
        Ok(())
    }

    /// Move to the next establishment state
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotReady`] for a transition outside the lifecycle.
    pub fn advance(&mut self, next: ConnectionState) -> Result<()> {
        use ConnectionState::{Authenticating, Connecting, Ready, Subscribing, Syncing};

        let allowed = matches!(
            (self.snapshot.state, next),
            (Connecting, Subscribing)
                | (Subscribing, Syncing)
                | (Syncing, Authenticating | Ready)
                | (Authenticating, Ready)
        );
        if !allowed {
            return Err(MountError::NotReady {
                reason: format!("illegal transition {} -> {}", self.snapshot.state, next),
            });
        }
        if next == Ready && self.snapshot.protocol_variant.is_none() {
            return Err(MountError::NotReady {
                reason: "protocol variant not selected".to_string(),
            });
        }

        debug!("Connection {} -> {}", self.snapshot.state, next);
        self.snapshot.state = next;
        Ok(())
    }

    /// Fix the dialect for the current connection
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotReady`] outside `Syncing` or if a dialect was
    /// already selected.
    pub fn set_variant(&mut self, variant: ProtocolVariant) -> Result<()> {
        if self.snapshot.state != ConnectionState::Syncing {
            return Err(MountError::NotReady {
                reason: format!("variant selected while {}", self.snapshot.state),
            });
        }
        if self.snapshot.protocol_variant.is_some_and(|v| v != variant) {
            return Err(MountError::NotReady {
                reason: "protocol variant already selected".to_string(),
            });
        }
        self.snapshot.protocol_variant = Some(variant);
        Ok(())
    }

    /// Record a non-fatal failure without leaving the current state
    pub fn record_error(&mut self, kind: ErrorKind) {
        self.snapshot.last_error = Some(kind);
    }

    /// Take the failure edge
    ///
    /// Returns the delay before the next attempt, or `None` if stopped.
    pub fn fail(&mut self, kind: ErrorKind) -> Option<Duration> {
        self.snapshot.state = ConnectionState::Disconnected;
        self.snapshot.protocol_variant = None;
        self.snapshot.last_error = Some(kind);

        if self.stopped {
            return None;
        }
        info!(
            "Connection failed ({:?}), reconnecting in {:?}",
            kind, self.reconnect_interval
        );
        Some(self.reconnect_interval)
    }

    /// Explicit disconnect: no further attempts until the next connect
    pub fn stop(&mut self) {
        self.stopped = true;
        self.snapshot.state = ConnectionState::Disconnected;
        self.snapshot.protocol_variant = None;
    }
}

/// Health of one transport link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Usable
    Open,
    /// A transport operation failed or timed out
    Failed(ErrorKind),
    /// Closed by an explicit disconnect
    Closed,
}

/// Shared cancellation signal for every operation on one link
#[derive(Debug, Clone)]
pub struct LinkGuard {
    status: Arc<watch::Sender<LinkStatus>>,
}

impl Default for LinkGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkGuard {
    /// Guard for a freshly opened link
    #[must_use]
    pub fn new() -> Self {
        let (status, _) = watch::channel(LinkStatus::Open);
        Self {
            status: Arc::new(status),
        }
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Mark the link failed; the first failure wins
    pub fn fail(&self, kind: ErrorKind) {
        self.transition(LinkStatus::Failed(kind));
    }

    /// Mark the link closed by the caller
    pub fn close(&self) {
        self.transition(LinkStatus::Closed);
    }

    fn transition(&self, next: LinkStatus) {
        self.status.send_if_modified(|status| {
            if *status == LinkStatus::Open {
                *status = next;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the link is no longer open
    pub async fn cancelled(&self) -> LinkStatus {
        let mut status = self.status.subscribe();
        status
            .wait_for(|s| *s != LinkStatus::Open)
            .await
            .map_or(LinkStatus::Closed, |s| *s)
    }
}

fn cancellation_error(status: LinkStatus) -> MountError {
    match status {
        LinkStatus::Closed => MountError::Cancelled,
        LinkStatus::Open | LinkStatus::Failed(_) => MountError::Disconnected,
    }
}

/// Timed, cancellable attribute I/O over one link
///
/// Every operation is bounded by the operation timeout. A timeout or
/// transport failure marks the [`LinkGuard`] failed, which aborts every
/// other pending operation on the same link.
#[derive(Clone)]
pub struct Channel {
    session: Arc<dyn GattSession>,
    guard: LinkGuard,
    timeout: Duration,
}

impl Channel {
    /// Wrap a session
    #[must_use]
    pub fn new(session: Arc<dyn GattSession>, guard: LinkGuard, timeout: Duration) -> Self {
        Self {
            session,
            guard,
            timeout,
        }
    }

    /// Cancellation signal of the link
    #[must_use]
    pub const fn guard(&self) -> &LinkGuard {
        &self.guard
    }

    /// Read an attribute
    ///
    /// # Errors
    ///
    /// Returns a transport error, [`MountError::Timeout`], or
    /// [`MountError::Cancelled`] if the link was closed meanwhile.
    pub async fn read(&self, attribute: Attribute) -> Result<Bytes> {
        self.run(attribute, true, self.session.read(attribute)).await
    }

    /// Read and decode an attribute
    ///
    /// # Errors
    ///
    /// Returns the read's error or a [`MountError::Decode`].
    pub async fn read_field(&self, attribute: Attribute, variant: ProtocolVariant) -> Result<Field> {
        let data = self.read(attribute).await?;
        Ok(protocol::decode(attribute, &data, variant)?)
    }

    /// Write an attribute
    ///
    /// # Errors
    ///
    /// Returns a transport error, [`MountError::Timeout`], or
    /// [`MountError::Cancelled`] if the link was closed meanwhile.
    pub async fn write(&self, attribute: Attribute, data: &[u8]) -> Result<()> {
        debug!("Writing {}: {:02X?}", attribute, data);
        self.run(attribute, true, self.session.write(attribute, data))
            .await
    }

    /// Encode and write an attribute
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Encode`] or the write's error.
    pub async fn write_field(
        &self,
        attribute: Attribute,
        field: &Field,
        variant: ProtocolVariant,
    ) -> Result<()> {
        let data = protocol::encode(attribute, field, variant)?;
        self.write(attribute, &data).await
    }

    /// Enable notifications for an attribute
    ///
    /// A rejected subscription leaves the link usable; a timeout does not.
    ///
    /// # Errors
    ///
    /// Returns the subscription failure or [`MountError::Timeout`].
    pub async fn subscribe(&self, attribute: Attribute) -> Result<()> {
        self.run(attribute, false, self.session.subscribe(attribute))
            .await
    }

    /// Close the session, best effort
    pub async fn disconnect(&self) {
        let result = tokio::time::timeout(self.timeout, self.session.disconnect()).await;
        if !matches!(result, Ok(Ok(()))) {
            debug!("Transport disconnect did not complete cleanly");
        }
    }

    async fn run<T>(
        &self,
        attribute: Attribute,
        fatal: bool,
        operation: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        let status = self.guard.status();
        if status != LinkStatus::Open {
            return Err(cancellation_error(status));
        }

        let outcome = tokio::select! {
            biased;
            status = self.guard.cancelled() => return Err(cancellation_error(status)),
            outcome = tokio::time::timeout(self.timeout, operation) => outcome,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if fatal && e.is_transport_error() {
                    debug!("{} failed: {}", attribute, e);
                    self.guard.fail(e.kind());
                }
                Err(e)
            }
            Err(_) => {
                debug!("{} timed out", attribute);
                self.guard.fail(ErrorKind::Timeout);
                Err(MountError::Timeout {
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use tokio_test::assert_ok;

    const INTERVAL: Duration = Duration::from_secs(60);

    fn ready_machine() -> ConnectionMachine {
        let mut machine = ConnectionMachine::new(INTERVAL);
        machine.begin_connect().unwrap();
        machine.advance(ConnectionState::Subscribing).unwrap();
        machine.advance(ConnectionState::Syncing).unwrap();
        machine.set_variant(ProtocolVariant::Modern).unwrap();
        machine.advance(ConnectionState::Ready).unwrap();
        machine
    }

    #[test]
    fn test_lifecycle_edges() {
        let machine = ready_machine();
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Ready);
        assert_eq!(snapshot.protocol_variant, Some(ProtocolVariant::Modern));
        assert_eq!(snapshot.last_error, None);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut machine = ConnectionMachine::new(INTERVAL);
        assert!(machine.advance(ConnectionState::Ready).is_err());

        machine.begin_connect().unwrap();
        assert!(machine.advance(ConnectionState::Syncing).is_err());
        assert!(machine.begin_connect().is_err());

        machine.advance(ConnectionState::Subscribing).unwrap();
        machine.advance(ConnectionState::Syncing).unwrap();
        // Ready requires a dialect
        assert!(machine.advance(ConnectionState::Ready).is_err());
    }

    #[test]
    fn test_variant_is_immutable_per_connection() {
        let mut machine = ready_machine();
        assert!(machine.set_variant(ProtocolVariant::Legacy).is_err());

        machine.fail(ErrorKind::Transport);
        assert_eq!(machine.snapshot().protocol_variant, None);
        machine.begin_connect().unwrap();
        assert!(machine.set_variant(ProtocolVariant::Legacy).is_err());
    }

    #[test]
    fn test_failure_schedules_reconnect() {
        let mut machine = ready_machine();
        assert_eq!(machine.fail(ErrorKind::Timeout), Some(INTERVAL));

        let snapshot = machine.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert_eq!(snapshot.last_error, Some(ErrorKind::Timeout));

        // Fixed interval, no growth
        machine.begin_connect().unwrap();
        assert_eq!(machine.fail(ErrorKind::Transport), Some(INTERVAL));
    }

    #[test]
    fn test_stop_cancels_reconnect() {
        let mut machine = ready_machine();
        machine.stop();
        assert!(machine.is_stopped());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.fail(ErrorKind::Transport), None);
    }

    #[test]
    fn test_guard_first_failure_wins() {
        let guard = LinkGuard::new();
        assert_eq!(guard.status(), LinkStatus::Open);

        guard.fail(ErrorKind::Timeout);
        guard.close();
        assert_eq!(guard.status(), LinkStatus::Failed(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_timeout_fails_link() {
        let device = MockDevice::modern();
        device.stall(Attribute::Distance);
        let guard = LinkGuard::new();
        let channel = Channel::new(device.session(), guard.clone(), Duration::from_secs(5));

        let result = channel.read(Attribute::Distance).await;
        assert!(matches!(result, Err(MountError::Timeout { timeout_ms: 5000 })));
        assert_eq!(guard.status(), LinkStatus::Failed(ErrorKind::Timeout));

        // Subsequent operations on the failed link are refused
        assert!(matches!(
            channel.read(Attribute::Rotation).await,
            Err(MountError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_operation() {
        let device = MockDevice::modern();
        device.stall(Attribute::Preset(0));
        let guard = LinkGuard::new();
        let channel = Channel::new(device.session(), guard.clone(), Duration::from_secs(5));

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.write(Attribute::Preset(0), &[0; 20]).await }
        });
        tokio::task::yield_now().await;
        guard.close();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(MountError::Cancelled)));
    }

    #[tokio::test]
    async fn test_rejected_subscription_keeps_link() {
        let device = MockDevice::modern();
        device.fail_subscribe(Attribute::Unknown(1));
        let guard = LinkGuard::new();
        let channel = Channel::new(device.session(), guard.clone(), Duration::from_secs(5));

        assert!(channel.subscribe(Attribute::Unknown(1)).await.is_err());
        assert_eq!(guard.status(), LinkStatus::Open);
        assert_ok!(channel.subscribe(Attribute::Distance).await);
    }

    #[tokio::test]
    async fn test_read_field_decodes() {
        let device = MockDevice::modern();
        device.set(Attribute::AutoMove, vec![8]);
        let channel = Channel::new(device.session(), LinkGuard::new(), Duration::from_secs(5));

        let field = channel
            .read_field(Attribute::AutoMove, ProtocolVariant::Modern)
            .await
            .unwrap();
        assert_eq!(field, Field::AutoMove(crate::types::AutoMove::Hdmi(3)));
    }
}
