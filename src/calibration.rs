use tracing::debug;

use crate::{
    error::{MountError, Result},
    protocol::CALIBRATION_DONE,
    types::CalibrationState,
};

/// Outcome of observing one calibration step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationProgress {
    /// Step accepted, calibration continues
    Step(u8),
    /// Terminal step reached
    Finished,
    /// Value ignored (no session, or the idle value before the first step)
    Ignored,
}

/// Tracks the steps of a running calibration
///
/// The device only signals that the calibration attribute changed. Each
/// signal is followed by a read, and the value read is fed to [`observe`].
///
/// [`observe`]: CalibrationSession::observe
#[derive(Debug, Clone, Default)]
pub struct CalibrationSession {
    state: Option<CalibrationState>,
}

impl CalibrationSession {
    /// Idle session
    #[must_use]
    pub const fn new() -> Self {
        Self { state: None }
    }

    /// Begin tracking a calibration
    ///
    /// # Errors
    ///
    /// Returns [`MountError::CalibrationInProgress`] if one is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(MountError::CalibrationInProgress);
        }
        self.state = Some(CalibrationState {
            running: true,
            last_step: None,
        });
        Ok(())
    }

    /// Check if a calibration is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.is_some_and(|s| s.running)
    }

    /// Current progress, `None` while idle
    #[must_use]
    pub const fn state(&self) -> Option<CalibrationState> {
        self.state
    }

    /// Feed the step value read after a calibration notification
    ///
    /// # Errors
    ///
    /// Returns [`MountError::CalibrationOutOfOrder`] if a non-terminal step is
    /// not greater than the previous one. The session keeps running.
    pub fn observe(&mut self, step: u8) -> Result<CalibrationProgress> {
        let Some(state) = self.state.as_mut().filter(|s| s.running) else {
            return Ok(CalibrationProgress::Ignored);
        };

        match (state.last_step, step) {
            (None, CALIBRATION_DONE) => Ok(CalibrationProgress::Ignored),
            (Some(_), CALIBRATION_DONE) => {
                debug!("Calibration finished");
                self.state = None;
                Ok(CalibrationProgress::Finished)
            }
            (Some(previous), observed) if observed <= previous => {
                Err(MountError::CalibrationOutOfOrder { previous, observed })
            }
            (_, observed) => {
                debug!("Calibration step {}", observed);
                state.last_step = Some(observed);
                Ok(CalibrationProgress::Step(observed))
            }
        }
    }

    /// Drop the session (disconnect)
    pub fn clear(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increasing_sequence_finishes() {
        let mut session = CalibrationSession::new();
        session.start().unwrap();

        let mut running = Vec::new();
        for step in [3, 7, 12, 0] {
            session.observe(step).unwrap();
            running.push(session.is_running());
        }

        assert_eq!(running, vec![true, true, true, false]);
        assert!(session.state().is_none());
    }

    #[test]
    fn test_decreasing_step_is_out_of_order() {
        let mut session = CalibrationSession::new();
        session.start().unwrap();

        assert_eq!(session.observe(3).unwrap(), CalibrationProgress::Step(3));
        assert!(matches!(
            session.observe(2),
            Err(MountError::CalibrationOutOfOrder {
                previous: 3,
                observed: 2
            })
        ));
        // The anomaly does not abort the session
        assert!(session.is_running());
        assert_eq!(session.state().unwrap().last_step, Some(3));
        assert_eq!(session.observe(0).unwrap(), CalibrationProgress::Finished);
    }

    #[test]
    fn test_repeated_step_is_out_of_order() {
        let mut session = CalibrationSession::new();
        session.start().unwrap();
        session.observe(5).unwrap();
        assert!(session.observe(5).is_err());
    }

    #[test]
    fn test_idle_value_before_first_step() {
        let mut session = CalibrationSession::new();
        assert_eq!(session.observe(4).unwrap(), CalibrationProgress::Ignored);

        session.start().unwrap();
        assert_eq!(session.observe(0).unwrap(), CalibrationProgress::Ignored);
        assert!(session.is_running());
    }

    #[test]
    fn test_start_while_running() {
        let mut session = CalibrationSession::new();
        session.start().unwrap();
        assert!(matches!(
            session.start(),
            Err(MountError::CalibrationInProgress)
        ));
        session.clear();
        assert!(!session.is_running());
        assert!(session.start().is_ok());
    }
}
