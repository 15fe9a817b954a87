//! Session handle with RAII release.

use hvctl_shared::{HvctlError, HvctlResult};

use crate::hypervisor::{Hypervisor, LockType, Machine, Session, SessionState};

/// A hypervisor session that is released when dropped.
///
/// Release unlocks only a session observed as `Locked`; anything else is
/// logged and skipped. Dropping the guard without calling [`release`] does the
/// same, logging unlock failures instead of returning them.
///
/// [`release`]: SessionGuard::release
pub struct SessionGuard {
    session: Option<Box<dyn Session>>,
    machine: String,
}

impl SessionGuard {
    /// Open a session and lock it onto `machine`.
    ///
    /// # Errors
    ///
    /// Any failure to reach the `Locked` state is reported as
    /// [`HvctlError::Session`].
    pub fn acquire(
        hypervisor: &dyn Hypervisor,
        machine: &dyn Machine,
        lock: LockType,
    ) -> HvctlResult<Self> {
        let mut session = hypervisor.create_session().map_err(|e| {
            HvctlError::Session(format!(
                "failed to open a session for '{}': {}",
                machine.name(),
                e
            ))
        })?;

        session.lock_machine(machine.id(), lock).map_err(|e| {
            HvctlError::Session(format!("failed to lock '{}': {}", machine.name(), e))
        })?;

        if session.state() != SessionState::Locked {
            return Err(HvctlError::Session(format!(
                "session for '{}' did not reach the locked state",
                machine.name()
            )));
        }

        tracing::trace!(machine = %machine.name(), ?lock, "Session locked");
        Ok(Self {
            session: Some(session),
            machine: machine.name().to_string(),
        })
    }

    /// Open a session without locking it, as launching a VM process requires.
    pub fn unlocked(hypervisor: &dyn Hypervisor, machine: &dyn Machine) -> HvctlResult<Self> {
        let session = hypervisor.create_session().map_err(|e| {
            HvctlError::Session(format!(
                "failed to open a session for '{}': {}",
                machine.name(),
                e
            ))
        })?;
        Ok(Self {
            session: Some(session),
            machine: machine.name().to_string(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(SessionState::Unlocked)
    }

    pub fn session_mut(&mut self) -> HvctlResult<&mut dyn Session> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(HvctlError::Internal(format!(
                "session for '{}' was already released",
                self.machine
            ))),
        }
    }

    /// Release now, returning any unlock error.
    pub fn release(mut self) -> HvctlResult<()> {
        self.do_release()
    }

    fn do_release(&mut self) -> HvctlResult<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if session.state() != SessionState::Locked {
            tracing::warn!(machine = %self.machine, "Session not locked at release, skipping unlock");
            return Ok(());
        }
        session.unlock_machine()?;
        tracing::trace!(machine = %self.machine, "Session released");
        Ok(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.do_release() {
            tracing::warn!(machine = %self.machine, error = %e, "Failed to release session on drop");
        }
    }
}
