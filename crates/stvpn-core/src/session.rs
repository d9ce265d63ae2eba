//! Session State
//!
//! The published view of the single tunnel session.
//!
//! Fields are tied to the phase they are valid in: a server exists from
//! `Connecting` on, start time and byte counters only while `Connected`.
//! Every change is published as an immutable [`SessionSnapshot`] carrying a
//! strictly increasing sequence number.

use crate::admission::DenyReason;
use crate::format::{format_bytes, format_elapsed};
use crate::server::ServerDescriptor;
use crate::transport::TransportError;
use serde::{Serialize, Serializer};
use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Discriminant of [`SessionPhase`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl PhaseKind {
    pub fn description(&self) -> &'static str {
        match self {
            PhaseKind::Idle => "Disconnected",
            PhaseKind::Connecting => "Connecting...",
            PhaseKind::Connected => "Connected",
            PhaseKind::Disconnecting => "Disconnecting...",
            PhaseKind::Failed => "Connection failed",
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Session lifecycle, with per-phase data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum SessionPhase {
    /// No tunnel
    Idle,
    /// Admitted; waiting for the transport handshake
    Connecting { server: ServerDescriptor },
    /// Tunnel up
    Connected {
        server: ServerDescriptor,
        #[serde(serialize_with = "unix_millis")]
        started_at: SystemTime,
        bytes_up: u64,
        bytes_down: u64,
    },
    /// User asked to leave; waiting for the transport to close
    Disconnecting { server: ServerDescriptor },
    /// Transport failed; the reconnect supervisor may be backing off
    Failed {
        server: ServerDescriptor,
        #[serde(serialize_with = "display")]
        error: TransportError,
    },
}

impl SessionPhase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            SessionPhase::Idle => PhaseKind::Idle,
            SessionPhase::Connecting { .. } => PhaseKind::Connecting,
            SessionPhase::Connected { .. } => PhaseKind::Connected,
            SessionPhase::Disconnecting { .. } => PhaseKind::Disconnecting,
            SessionPhase::Failed { .. } => PhaseKind::Failed,
        }
    }

    /// Server the session is bound to; `None` only while idle
    pub fn server(&self) -> Option<&ServerDescriptor> {
        match self {
            SessionPhase::Idle => None,
            SessionPhase::Connecting { server }
            | SessionPhase::Connected { server, .. }
            | SessionPhase::Disconnecting { server }
            | SessionPhase::Failed { server, .. } => Some(server),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SessionPhase::Idle)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionPhase::Connected { .. })
    }

    /// `(bytes_up, bytes_down)` while connected
    pub fn traffic(&self) -> Option<(u64, u64)> {
        match self {
            SessionPhase::Connected {
                bytes_up,
                bytes_down,
                ..
            } => Some((*bytes_up, *bytes_down)),
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        match self {
            SessionPhase::Connected { started_at, .. } => Some(*started_at),
            _ => None,
        }
    }
}

/// Reconnect progress while the supervisor is backing off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryProgress {
    /// 1-based attempt about to run
    pub attempt: u32,
    pub max_attempts: u32,
    /// Delay before this attempt, jitter included
    #[serde(serialize_with = "millis")]
    pub next_delay: Duration,
}

/// Immutable published view of the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Strictly increasing per manager
    pub sequence: u64,
    #[serde(serialize_with = "unix_millis")]
    pub taken_at: SystemTime,
    #[serde(flatten)]
    pub phase: SessionPhase,
    /// Most recent denial or failure
    #[serde(serialize_with = "display_opt")]
    pub last_error: Option<SessionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryProgress>,
}

impl SessionSnapshot {
    /// The snapshot a fresh manager starts from
    pub fn initial() -> Self {
        Self {
            sequence: 0,
            taken_at: SystemTime::now(),
            phase: SessionPhase::Idle,
            last_error: None,
            retry: None,
        }
    }

    pub fn kind(&self) -> PhaseKind {
        self.phase.kind()
    }

    pub fn server(&self) -> Option<&ServerDescriptor> {
        self.phase.server()
    }

    /// Time spent connected as of this snapshot
    pub fn connected_for(&self) -> Option<Duration> {
        let started = self.phase.started_at()?;
        Some(self.taken_at.duration_since(started).unwrap_or_default())
    }

    /// One-line status for logs and the CLI
    pub fn summary(&self) -> String {
        let mut line = format!("#{} {}", self.sequence, self.kind());

        if let Some(server) = self.server() {
            line.push_str(&format!(" | {}", server));
        }
        if let Some((up, down)) = self.phase.traffic() {
            let elapsed = self.connected_for().unwrap_or_default();
            line.push_str(&format!(
                " | {} | up {} | down {}",
                format_elapsed(elapsed),
                format_bytes(up),
                format_bytes(down)
            ));
        }
        if let Some(retry) = self.retry {
            line.push_str(&format!(
                " | retry {}/{} in {:.1}s",
                retry.attempt,
                retry.max_attempts,
                retry.next_delay.as_secs_f64()
            ));
        }
        if let Some(ref err) = self.last_error {
            line.push_str(&format!(" | last error: {}", err));
        }
        line
    }
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Server is not online")]
    ServerUnavailable,

    #[error("Premium subscription required")]
    SubscriptionRequired,

    #[error("Subscription expired")]
    SubscriptionExpired,

    #[error("A session is already active; disconnect first")]
    SessionAlreadyActive,

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("No active session")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Gave up after {attempts} reconnect attempts: {last}")]
    RetryExhausted { attempts: u32, last: TransportError },

    #[error("Session manager has shut down")]
    Shutdown,
}

impl SessionError {
    /// Admission/usage errors are reported synchronously and never retried
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            SessionError::ServerUnavailable
                | SessionError::SubscriptionRequired
                | SessionError::SubscriptionExpired
                | SessionError::SessionAlreadyActive
                | SessionError::UnknownServer(_)
        )
    }
}

impl From<DenyReason> for SessionError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::ServerUnavailable => SessionError::ServerUnavailable,
            DenyReason::SubscriptionRequired => SessionError::SubscriptionRequired,
            DenyReason::SubscriptionExpired => SessionError::SubscriptionExpired,
        }
    }
}

fn display<S: Serializer, T: Display>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

fn display_opt<S: Serializer, T: Display>(
    value: &Option<T>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.collect_str(v),
        None => serializer.serialize_none(),
    }
}

fn unix_millis<S: Serializer>(at: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let ms = at.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    serializer.serialize_u64(u64::try_from(ms).unwrap_or(u64::MAX))
}

fn millis<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(up: u64, down: u64) -> SessionPhase {
        SessionPhase::Connected {
            server: ServerDescriptor::new("1", "US East"),
            started_at: SystemTime::now(),
            bytes_up: up,
            bytes_down: down,
        }
    }

    #[test]
    fn test_phase_field_validity() {
        assert!(SessionPhase::Idle.server().is_none());
        assert!(SessionPhase::Idle.traffic().is_none());

        let connecting = SessionPhase::Connecting {
            server: ServerDescriptor::new("1", "US East"),
        };
        assert_eq!(connecting.server().unwrap().id, "1");
        assert!(connecting.traffic().is_none());
        assert!(connecting.started_at().is_none());

        assert_eq!(connected(5, 9).traffic(), Some((5, 9)));
    }

    #[test]
    fn test_deny_reason_conversion() {
        assert_eq!(
            SessionError::from(DenyReason::SubscriptionRequired),
            SessionError::SubscriptionRequired
        );
        assert!(SessionError::from(DenyReason::ServerUnavailable).is_admission());
        assert!(!SessionError::Transport(TransportError::HandshakeTimeout).is_admission());
    }

    #[test]
    fn test_connected_for() {
        let started = SystemTime::now();
        let snapshot = SessionSnapshot {
            sequence: 3,
            taken_at: started + Duration::from_secs(65),
            phase: SessionPhase::Connected {
                server: ServerDescriptor::new("1", "US East"),
                started_at: started,
                bytes_up: 0,
                bytes_down: 0,
            },
            last_error: None,
            retry: None,
        };

        assert_eq!(snapshot.connected_for(), Some(Duration::from_secs(65)));
        assert!(snapshot.summary().contains("00:01:05"));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = SessionSnapshot {
            sequence: 4,
            taken_at: UNIX_EPOCH + Duration::from_millis(1_500),
            phase: SessionPhase::Failed {
                server: ServerDescriptor::new("1", "US East"),
                error: TransportError::ConnectionLost("reset".into()),
            },
            last_error: Some(SessionError::Transport(TransportError::ConnectionLost(
                "reset".into(),
            ))),
            retry: Some(RetryProgress {
                attempt: 1,
                max_attempts: 5,
                next_delay: Duration::from_millis(1_100),
            }),
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["phase"], "failed");
        assert_eq!(json["taken_at"], 1500);
        assert_eq!(json["error"], "Connection lost: reset");
        assert_eq!(json["server"]["id"], "1");
        assert_eq!(json["retry"]["next_delay"], 1100);
    }

    #[test]
    fn test_idle_summary() {
        let snapshot = SessionSnapshot::initial();
        assert_eq!(snapshot.summary(), "#0 Disconnected");
    }
}
