use tracing::{debug, info, warn};

use crate::{
    connection::Channel,
    error::{AuthError, MountError, Result},
    protocol::{self, Attribute, Field, PinCode, PinRole},
    types::{AuthLevel, MultiPinFeatures, Permission, PinMode, SessionState},
    variant::ProtocolVariant,
};

/// Authentication state of one connection
///
/// PIN values pass through [`authenticate`] and are never stored.
///
/// [`authenticate`]: SessionManager::authenticate
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    state: SessionState,
    features: MultiPinFeatures,
}

impl SessionManager {
    /// Unauthenticated session on a device without PIN
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything (disconnect)
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Start a fresh session from the values read at sync
    pub fn load(&mut self, pin_mode: PinMode, features: MultiPinFeatures) {
        self.state = SessionState {
            pin_mode,
            authenticated: AuthLevel::Unauthenticated,
            permission: base_permission(pin_mode),
        };
        self.features = features;
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Feature grants for authorised users
    #[must_use]
    pub const fn features(&self) -> MultiPinFeatures {
        self.features
    }

    /// Apply a pin-information update
    ///
    /// A connection that held full rights while no PIN was set keeps them
    /// once a PIN appears, as the supervisor. Returns `true` if the state
    /// changed.
    pub fn set_pin_mode(&mut self, pin_mode: PinMode) -> bool {
        if self.state.pin_mode == pin_mode {
            return false;
        }
        let previous = self.state.pin_mode;
        self.state.pin_mode = pin_mode;
        if pin_mode == PinMode::None {
            self.state.permission = Some(Permission::ControlAndSettings);
        } else if previous == PinMode::None
            && self.state.authenticated == AuthLevel::Unauthenticated
        {
            self.state.authenticated = AuthLevel::Supervisor;
        }
        true
    }

    /// Take the authentication outcome of `attempt`, a copy of this session
    ///
    /// PIN mode and feature updates applied here while the attempt was in
    /// flight are kept.
    pub fn commit(&mut self, attempt: &Self) {
        if self.state.pin_mode == PinMode::None {
            return;
        }
        self.state.authenticated = attempt.state.authenticated;
        self.state.permission = attempt.state.permission;
    }

    /// Apply a multi-pin feature update
    pub fn set_features(&mut self, features: MultiPinFeatures) {
        self.features = features;
    }

    /// Role used to meet `intent` under the device's PIN mode
    ///
    /// Returns `None` when no PIN is required.
    #[must_use]
    pub const fn role_for(&self, intent: Permission) -> Option<PinRole> {
        match (self.state.pin_mode, intent) {
            (PinMode::None, _) => None,
            (PinMode::UserAndSupervisor, Permission::ControlAndSettings) => {
                Some(PinRole::Supervisor)
            }
            _ => Some(PinRole::User),
        }
    }

    /// Send a PIN and confirm the resulting permission
    ///
    /// A user PIN must yield control permission and a supervisor PIN control
    /// and settings. On a device with a single PIN the user PIN unlocks
    /// settings as well, and the session counts as supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Rejected`] if the device reports a different
    /// permission (the session is left unauthenticated),
    /// [`AuthError::RoleUnavailable`] if the device has no PIN for `role`,
    /// or the transport error of the write or read.
    pub async fn authenticate(
        &mut self,
        channel: &Channel,
        pin: u16,
        role: PinRole,
        variant: ProtocolVariant,
    ) -> Result<Permission> {
        let requested = AuthLevel::from(role);
        let available = match role {
            PinRole::User => self.state.pin_mode.requires_pin(),
            PinRole::Supervisor => self.state.pin_mode == PinMode::UserAndSupervisor,
        };
        if !available {
            return Err(AuthError::RoleUnavailable(requested).into());
        }

        debug!("Authenticating as {}", requested);
        channel
            .write_field(
                Attribute::Authenticate,
                &Field::Pin(PinCode { pin, role }),
                variant,
            )
            .await?;

        let data = channel.read(Attribute::PinCheck).await?;
        let observed = match protocol::decode_permission(&data) {
            Ok(permission) => Some(permission),
            Err(e) => {
                debug!("Permission check after authentication: {}", e);
                None
            }
        };

        let granted = match (role, observed) {
            (PinRole::User, Some(Permission::ControlOnly)) => Some(AuthLevel::User),
            (PinRole::User, Some(Permission::ControlAndSettings))
                if self.state.pin_mode == PinMode::UserOnly =>
            {
                Some(AuthLevel::Supervisor)
            }
            (PinRole::Supervisor, Some(Permission::ControlAndSettings)) => {
                Some(AuthLevel::Supervisor)
            }
            _ => None,
        };

        match (granted, observed) {
            (Some(level), Some(permission)) => {
                info!("Authenticated as {} ({})", level, permission);
                self.state.authenticated = level;
                self.state.permission = Some(permission);
                Ok(permission)
            }
            _ => {
                warn!("{} PIN rejected", requested);
                self.state.authenticated = AuthLevel::Unauthenticated;
                self.state.permission = base_permission(self.state.pin_mode);
                Err(AuthError::Rejected {
                    requested,
                    observed,
                }
                .into())
            }
        }
    }

    /// Authenticate with the strongest role the PIN grants
    ///
    /// Tries the supervisor role first where the device has one, then falls
    /// back to the user role.
    ///
    /// # Errors
    ///
    /// Returns the user attempt's error if neither role is granted.
    pub async fn authenticate_best(
        &mut self,
        channel: &Channel,
        pin: u16,
        variant: ProtocolVariant,
    ) -> Result<Permission> {
        if self.state.pin_mode == PinMode::UserAndSupervisor {
            match self
                .authenticate(channel, pin, PinRole::Supervisor, variant)
                .await
            {
                Err(MountError::Auth(AuthError::Rejected { .. })) => {
                    debug!("Supervisor role not granted, trying user role");
                }
                other => return other,
            }
        }
        self.authenticate(channel, pin, PinRole::User, variant).await
    }

    /// Check the session holds at least `required`
    ///
    /// # Errors
    ///
    /// Returns [`MountError::PermissionDenied`] otherwise.
    pub fn require_permission(&self, required: Permission) -> Result<()> {
        if self.state.permission.is_some_and(|p| p >= required) {
            Ok(())
        } else {
            Err(MountError::PermissionDenied { required })
        }
    }

    /// Check the session may write `attribute`
    ///
    /// Movement needs control permission. Settings need control and
    /// settings, except those the supervisor granted to authorised users
    /// through the multi-pin features.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::PermissionDenied`] otherwise.
    pub fn authorize_write(&self, attribute: Attribute) -> Result<()> {
        match attribute {
            Attribute::Authenticate => Ok(()),
            Attribute::Distance | Attribute::Rotation | Attribute::SelectPreset => {
                self.require_permission(Permission::ControlOnly)
            }
            _ if self.granted(attribute) => self.require_permission(Permission::ControlOnly),
            _ => self.require_permission(Permission::ControlAndSettings),
        }
    }

    const fn granted(&self, attribute: Attribute) -> bool {
        let features = &self.features;
        match attribute {
            Attribute::Preset(_) | Attribute::PresetName(_) => features.change_presets,
            Attribute::Name => features.change_name,
            Attribute::Freeze => features.change_tv_on_off_detection,
            Attribute::Calibrate => features.start_calibration,
            _ => false,
        }
    }
}

const fn base_permission(pin_mode: PinMode) -> Option<Permission> {
    match pin_mode {
        PinMode::None => Some(Permission::ControlAndSettings),
        PinMode::UserOnly | PinMode::UserAndSupervisor => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connection::LinkGuard, mock::MockDevice};
    use std::time::Duration;

    const MODERN: ProtocolVariant = ProtocolVariant::Modern;

    fn channel(device: &MockDevice) -> Channel {
        Channel::new(device.session(), LinkGuard::new(), Duration::from_secs(5))
    }

    fn dual_pin_session() -> (MockDevice, SessionManager) {
        let device = MockDevice::modern()
            .with_user_pin(1234)
            .with_supervisor_pin(9876);
        let mut session = SessionManager::new();
        session.load(PinMode::UserAndSupervisor, MultiPinFeatures::default());
        (device, session)
    }

    #[tokio::test]
    async fn test_user_pin_grants_control() {
        let (device, mut session) = dual_pin_session();
        let permission = session
            .authenticate(&channel(&device), 1234, PinRole::User, MODERN)
            .await
            .unwrap();

        assert_eq!(permission, Permission::ControlOnly);
        assert_eq!(session.state().authenticated, AuthLevel::User);
        assert_eq!(device.writes_to(Attribute::Authenticate), vec![vec![0xD2, 0x04]]);
    }

    #[tokio::test]
    async fn test_supervisor_pin_grants_settings() {
        let (device, mut session) = dual_pin_session();
        let permission = session
            .authenticate(&channel(&device), 9876, PinRole::Supervisor, MODERN)
            .await
            .unwrap();

        assert_eq!(permission, Permission::ControlAndSettings);
        assert_eq!(session.state().authenticated, AuthLevel::Supervisor);
        // 9876 = 0x2694, high byte offset by 0x40
        assert_eq!(device.writes_to(Attribute::Authenticate), vec![vec![0x94, 0x66]]);
    }

    #[tokio::test]
    async fn test_wrong_pin_is_rejected() {
        let (device, mut session) = dual_pin_session();
        let result = session
            .authenticate(&channel(&device), 1111, PinRole::User, MODERN)
            .await;

        assert!(matches!(
            result,
            Err(MountError::Auth(AuthError::Rejected {
                requested: AuthLevel::User,
                observed: None
            }))
        ));
        assert_eq!(session.state().authenticated, AuthLevel::Unauthenticated);
        assert_eq!(session.state().permission, None);
    }

    #[tokio::test]
    async fn test_user_pin_sent_as_supervisor_is_rejected() {
        let (device, mut session) = dual_pin_session();
        let result = session
            .authenticate(&channel(&device), 1234, PinRole::Supervisor, MODERN)
            .await;
        assert!(matches!(result, Err(MountError::Auth(AuthError::Rejected { .. }))));
    }

    #[tokio::test]
    async fn test_best_role_falls_back_to_user() {
        let (device, mut session) = dual_pin_session();
        let permission = session
            .authenticate_best(&channel(&device), 1234, MODERN)
            .await
            .unwrap();

        assert_eq!(permission, Permission::ControlOnly);
        assert_eq!(device.writes_to(Attribute::Authenticate).len(), 2);
    }

    #[tokio::test]
    async fn test_single_pin_unlocks_settings() {
        let device = MockDevice::modern().with_user_pin(4321);
        let mut session = SessionManager::new();
        session.load(PinMode::UserOnly, MultiPinFeatures::default());

        assert!(matches!(
            session
                .authenticate(&channel(&device), 4321, PinRole::Supervisor, MODERN)
                .await,
            Err(MountError::Auth(AuthError::RoleUnavailable(AuthLevel::Supervisor)))
        ));

        let permission = session
            .authenticate_best(&channel(&device), 4321, MODERN)
            .await
            .unwrap();
        assert_eq!(permission, Permission::ControlAndSettings);
        assert_eq!(session.state().authenticated, AuthLevel::Supervisor);
    }

    #[test]
    fn test_permission_checks() {
        let mut session = SessionManager::new();
        session.load(PinMode::None, MultiPinFeatures::default());
        assert!(session.require_permission(Permission::ControlAndSettings).is_ok());

        session.load(PinMode::UserOnly, MultiPinFeatures::default());
        assert!(matches!(
            session.authorize_write(Attribute::Distance),
            Err(MountError::PermissionDenied {
                required: Permission::ControlOnly
            })
        ));
        assert!(session.authorize_write(Attribute::Authenticate).is_ok());
    }

    #[test]
    fn test_feature_grants() {
        let mut session = SessionManager::new();
        session.load(
            PinMode::UserAndSupervisor,
            MultiPinFeatures::from_bits(0b0010_0001),
        );
        session.state.authenticated = AuthLevel::User;
        session.state.permission = Some(Permission::ControlOnly);

        assert!(session.authorize_write(Attribute::Preset(2)).is_ok());
        assert!(session.authorize_write(Attribute::PresetName(2)).is_ok());
        assert!(session.authorize_write(Attribute::Calibrate).is_ok());
        assert!(session.authorize_write(Attribute::Name).is_err());
        assert!(session.authorize_write(Attribute::TvWidth).is_err());
        assert!(session.authorize_write(Attribute::SelectPreset).is_ok());
    }

    #[test]
    fn test_role_selection() {
        let mut session = SessionManager::new();
        assert_eq!(session.role_for(Permission::ControlAndSettings), None);

        session.load(PinMode::UserOnly, MultiPinFeatures::default());
        assert_eq!(
            session.role_for(Permission::ControlAndSettings),
            Some(PinRole::User)
        );

        session.load(PinMode::UserAndSupervisor, MultiPinFeatures::default());
        assert_eq!(
            session.role_for(Permission::ControlAndSettings),
            Some(PinRole::Supervisor)
        );
        assert_eq!(session.role_for(Permission::ControlOnly), Some(PinRole::User));
    }

    #[test]
    fn test_pin_mode_updates() {
        let mut session = SessionManager::new();
        session.load(PinMode::None, MultiPinFeatures::default());

        // Setting the first PIN keeps this connection's rights
        assert!(session.set_pin_mode(PinMode::UserOnly));
        assert_eq!(session.state().authenticated, AuthLevel::Supervisor);
        assert_eq!(
            session.state().permission,
            Some(Permission::ControlAndSettings)
        );
        assert!(!session.set_pin_mode(PinMode::UserOnly));

        session.load(PinMode::UserOnly, MultiPinFeatures::default());
        assert!(session.set_pin_mode(PinMode::UserAndSupervisor));
        assert_eq!(session.state().authenticated, AuthLevel::Unauthenticated);
        assert_eq!(session.state().permission, None);
        assert!(session.set_pin_mode(PinMode::None));
        assert_eq!(
            session.state().permission,
            Some(Permission::ControlAndSettings)
        );
    }

    #[tokio::test]
    async fn test_commit_keeps_concurrent_pin_mode() {
        let device = MockDevice::modern().with_user_pin(1234);
        let mut session = SessionManager::new();
        session.load(PinMode::UserOnly, MultiPinFeatures::default());

        let mut attempt = session.clone();
        attempt
            .authenticate(&channel(&device), 1234, PinRole::User, MODERN)
            .await
            .unwrap();
        assert_eq!(session.state().authenticated, AuthLevel::Unauthenticated);

        session.set_pin_mode(PinMode::UserAndSupervisor);
        session.set_features(MultiPinFeatures::from_bits(0x01));
        session.commit(&attempt);

        let state = session.state();
        assert_eq!(state.pin_mode, PinMode::UserAndSupervisor);
        assert_eq!(state.authenticated, AuthLevel::Supervisor);
        assert_eq!(state.permission, Some(Permission::ControlAndSettings));
        assert!(session.features().change_presets);

        // PINs removed meanwhile leave full rights in place
        let mut session = SessionManager::new();
        session.load(PinMode::None, MultiPinFeatures::default());
        session.commit(&attempt);
        assert_eq!(session.state().authenticated, AuthLevel::Unauthenticated);
        assert_eq!(
            session.state().permission,
            Some(Permission::ControlAndSettings)
        );
    }

    #[test]
    fn test_reset_clears_session() {
        let mut session = SessionManager::new();
        session.load(PinMode::UserOnly, MultiPinFeatures::from_bits(0x3F));
        session.state.authenticated = AuthLevel::User;
        session.reset();

        assert_eq!(session.state(), SessionState::default());
        assert_eq!(session.features(), MultiPinFeatures::default());
    }
}
