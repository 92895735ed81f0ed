//! In-memory access session: lifecycle, failed-attempt counting, lockout.
//!
//! The password is held only while a session is active and is wiped from
//! memory on logout, lock, expiry or teardown. Nothing here is persisted.
//! Observers get read-only [`SecurityStatus`] snapshots through a watch channel.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use zeroize::{Zeroize, Zeroizing};

/// Attempts allowed before the store locks when not configured.
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NoSession,
    Active,
    Locked,
}

/// Why an operation needing an active session was refused.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("no active session")]
    NoSession,
    #[error("session is locked")]
    Locked,
    #[error("session expired after inactivity")]
    Expired,
}

/// Password scoped to one session. Not serializable; redacted in debug output.
#[derive(Clone)]
pub struct SessionSecret(Zeroizing<String>);

impl SessionSecret {
    pub fn new(password: impl Into<String>) -> Self {
        Self(Zeroizing::new(password.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Overwrite the password bytes in place.
    pub fn clear(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

#[derive(Debug)]
struct Session {
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    secret: SessionSecret,
}

#[derive(Debug)]
enum State {
    NoSession,
    Active(Session),
    Locked { since: DateTime<Utc> },
}

/// Read-only snapshot handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStatus {
    pub phase: SessionPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub locked_since: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
    pub remaining_attempts: u32,
    pub locked: bool,
}

/// Result of recording a failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { remaining: u32 },
    LockedOut { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub max_failed_attempts: u32,
    /// `None` keeps sessions alive until logout.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            idle_timeout: Some(Duration::minutes(30)),
        }
    }
}

/// Owns the session state machine: `NoSession -> Active -> {Locked, NoSession}`,
/// `Locked -> NoSession` only through [`SessionManager::reset_lockout`].
#[derive(Debug)]
pub struct SessionManager {
    state: State,
    failed_attempts: u32,
    policy: SessionPolicy,
    status_tx: watch::Sender<SecurityStatus>,
}

impl SessionManager {
    pub fn new(policy: SessionPolicy) -> Self {
        let max = policy.max_failed_attempts.max(1);
        let policy = SessionPolicy {
            max_failed_attempts: max,
            ..policy
        };
        let (status_tx, _) = watch::channel(SecurityStatus {
            phase: SessionPhase::NoSession,
            started_at: None,
            last_activity_at: None,
            locked_since: None,
            failed_attempts: 0,
            remaining_attempts: max,
            locked: false,
        });
        Self {
            state: State::NoSession,
            failed_attempts: 0,
            policy,
            status_tx,
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn phase(&self) -> SessionPhase {
        match self.state {
            State::NoSession => SessionPhase::NoSession,
            State::Active(_) => SessionPhase::Active,
            State::Locked { .. } => SessionPhase::Locked,
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn subscribe(&self) -> watch::Receiver<SecurityStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SecurityStatus {
        let (started_at, last_activity_at, locked_since) = match &self.state {
            State::Active(session) => (
                Some(session.started_at),
                Some(session.last_activity_at),
                None,
            ),
            State::Locked { since } => (None, None, Some(*since)),
            State::NoSession => (None, None, None),
        };
        SecurityStatus {
            phase: self.phase(),
            started_at,
            last_activity_at,
            locked_since,
            failed_attempts: self.failed_attempts,
            remaining_attempts: self
                .policy
                .max_failed_attempts
                .saturating_sub(self.failed_attempts),
            locked: matches!(self.state, State::Locked { .. }),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    /// Reinstate counters persisted by a previous process. Any active session is ended.
    pub fn restore(&mut self, failed_attempts: u32, locked_since: Option<DateTime<Utc>>) {
        self.end();
        self.failed_attempts = failed_attempts;
        self.state = match locked_since {
            Some(since) => State::Locked { since },
            None => State::NoSession,
        };
        self.publish();
    }

    /// Refuse verification while locked, regardless of the password.
    pub fn ensure_unlock_allowed(&self) -> Result<(), AccessError> {
        match self.state {
            State::Locked { .. } => Err(AccessError::Locked),
            _ => Ok(()),
        }
    }

    /// Start a session after a successful verification.
    pub fn begin(&mut self, secret: SessionSecret, now: DateTime<Utc>) {
        self.end();
        self.failed_attempts = 0;
        self.state = State::Active(Session {
            started_at: now,
            last_activity_at: now,
            secret,
        });
        self.publish();
    }

    /// Count a failed verification; reaching the threshold locks.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> FailureOutcome {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        let outcome = if self.failed_attempts >= self.policy.max_failed_attempts {
            self.end();
            self.state = State::Locked { since: now };
            FailureOutcome::LockedOut {
                attempts: self.failed_attempts,
            }
        } else {
            FailureOutcome::Retry {
                remaining: self.policy.max_failed_attempts - self.failed_attempts,
            }
        };
        self.publish();
        outcome
    }

    /// End an active session, wiping its secret. Returns whether one was active.
    pub fn end(&mut self) -> bool {
        if let State::Active(session) = &mut self.state {
            session.secret.clear();
            self.state = State::NoSession;
            self.publish();
            return true;
        }
        false
    }

    /// Explicit recovery from lockout. Returns whether the manager was locked.
    pub fn reset_lockout(&mut self) -> bool {
        if matches!(self.state, State::Locked { .. }) {
            self.state = State::NoSession;
            self.failed_attempts = 0;
            self.publish();
            return true;
        }
        false
    }

    /// Record activity and hand back the session password.
    /// An idle session past its timeout is ended here.
    pub fn touch(&mut self, now: DateTime<Utc>) -> Result<SessionSecret, AccessError> {
        let timeout = self.policy.idle_timeout;
        let session = match &mut self.state {
            State::Active(session) => session,
            State::Locked { .. } => return Err(AccessError::Locked),
            State::NoSession => return Err(AccessError::NoSession),
        };

        if let Some(timeout) = timeout {
            if now - session.last_activity_at > timeout {
                self.end();
                return Err(AccessError::Expired);
            }
        }

        session.last_activity_at = now;
        let secret = session.secret.clone();
        self.publish();
        Ok(secret)
    }

    /// Swap the session password after a successful rotation.
    pub fn rotate_secret(&mut self, secret: SessionSecret) -> Result<(), AccessError> {
        match &mut self.state {
            State::Active(session) => {
                session.secret.clear();
                session.secret = secret;
                Ok(())
            }
            State::Locked { .. } => Err(AccessError::Locked),
            State::NoSession => Err(AccessError::NoSession),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: u32) -> SessionManager {
        SessionManager::new(SessionPolicy {
            max_failed_attempts: max,
            idle_timeout: Some(Duration::minutes(30)),
        })
    }

    #[test]
    fn begins_and_ends_sessions() {
        let mut sessions = manager(3);
        let now = Utc::now();
        assert_eq!(sessions.touch(now).unwrap_err(), AccessError::NoSession);

        sessions.begin(SessionSecret::new("pw"), now);
        assert_eq!(sessions.phase(), SessionPhase::Active);
        assert_eq!(sessions.touch(now).unwrap().expose(), "pw");

        assert!(sessions.end());
        assert!(!sessions.end());
        assert_eq!(sessions.phase(), SessionPhase::NoSession);
    }

    #[test]
    fn locks_after_threshold_and_requires_reset() {
        let mut sessions = manager(3);
        let now = Utc::now();
        assert_eq!(sessions.record_failure(now), FailureOutcome::Retry { remaining: 2 });
        assert_eq!(sessions.record_failure(now), FailureOutcome::Retry { remaining: 1 });
        assert_eq!(
            sessions.record_failure(now),
            FailureOutcome::LockedOut { attempts: 3 }
        );
        assert_eq!(sessions.ensure_unlock_allowed(), Err(AccessError::Locked));
        assert!(sessions.status().locked);

        assert!(sessions.reset_lockout());
        assert_eq!(sessions.ensure_unlock_allowed(), Ok(()));
        assert_eq!(sessions.failed_attempts(), 0);
    }

    #[test]
    fn successful_unlock_resets_counter() {
        let mut sessions = manager(3);
        let now = Utc::now();
        sessions.record_failure(now);
        sessions.begin(SessionSecret::new("pw"), now);
        assert_eq!(sessions.failed_attempts(), 0);
        assert_eq!(sessions.status().remaining_attempts, 3);
    }

    #[test]
    fn idle_session_expires() {
        let mut sessions = manager(3);
        let start = Utc::now();
        sessions.begin(SessionSecret::new("pw"), start);
        let later = start + Duration::minutes(31);
        assert_eq!(sessions.touch(later).unwrap_err(), AccessError::Expired);
        assert_eq!(sessions.phase(), SessionPhase::NoSession);
    }

    #[test]
    fn subscribers_observe_snapshots() {
        let mut sessions = manager(3);
        let rx = sessions.subscribe();
        sessions.begin(SessionSecret::new("pw"), Utc::now());
        assert_eq!(rx.borrow().phase, SessionPhase::Active);
        sessions.end();
        assert_eq!(rx.borrow().phase, SessionPhase::NoSession);
    }

    #[test]
    fn restores_persisted_lockout() {
        let mut sessions = manager(3);
        let since = Utc::now();
        sessions.restore(3, Some(since));
        assert_eq!(sessions.phase(), SessionPhase::Locked);
        assert_eq!(sessions.status().locked_since, Some(since));

        let mut partial = manager(3);
        partial.restore(2, None);
        assert_eq!(
            partial.record_failure(since),
            FailureOutcome::LockedOut { attempts: 3 }
        );
    }

    #[test]
    fn secret_is_cleared_and_redacted() {
        let mut secret = SessionSecret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "SessionSecret(..)");
        secret.clear();
        assert!(secret.expose().is_empty());
    }
}
