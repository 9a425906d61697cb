//! Per-connection state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::Channel;
use crate::observability::metrics;

/// Lifecycle of a socket connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Authenticated = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Authenticated,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    ClientClosed = 0,
    TransportError = 1,
    IdleTimeout = 2,
    SlowConsumer = 3,
    Shutdown = 4,
}

impl CloseReason {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::ClientClosed,
            1 => Self::TransportError,
            2 => Self::IdleTimeout,
            3 => Self::SlowConsumer,
            _ => Self::Shutdown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::IdleTimeout => "idle_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::Shutdown => "shutdown",
        }
    }

    /// WebSocket close code sent to the peer.
    pub const fn close_code(self) -> u16 {
        match self {
            Self::ClientClosed | Self::IdleTimeout => 1000,
            Self::Shutdown => 1001,
            Self::SlowConsumer => 1008,
            Self::TransportError => 1011,
        }
    }
}

/// Result of queueing one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full; the message was discarded.
    Dropped,
    /// Queue full too many times in a row; the consumer must be disconnected.
    Overflow,
    Closed,
}

/// One live socket. Owned by the hub; the socket task holds the receiver.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    state: AtomicU8,
    close_reason: AtomicU8,
    tx: mpsc::Sender<String>,
    pub(super) subscriptions: Mutex<HashSet<Channel>>,
    consecutive_drops: AtomicU32,
    max_dropped: u32,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(
        tenant_id: Uuid,
        user_id: Uuid,
        queue_capacity: usize,
        max_dropped: u32,
    ) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let connection = Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            created_at: Utc::now(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close_reason: AtomicU8::new(CloseReason::ClientClosed as u8),
            tx,
            subscriptions: Mutex::new(HashSet::new()),
            consecutive_drops: AtomicU32::new(0),
            max_dropped: max_dropped.max(1),
            closed: CancellationToken::new(),
        };
        (connection, rx)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closing(&self) -> bool {
        self.state() >= ConnectionState::Closing
    }

    /// Move `from -> to` atomically; `false` if the state was not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter `Closing`. Exactly one caller ever gets `true`.
    pub(super) fn begin_close(&self, reason: CloseReason) -> bool {
        let won = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
            })
            .is_ok();
        if won {
            self.close_reason.store(reason as u8, Ordering::Release);
        }
        won
    }

    pub(super) fn finish_close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.closed.cancel();
    }

    pub fn close_reason(&self) -> CloseReason {
        CloseReason::from_u8(self.close_reason.load(Ordering::Acquire))
    }

    /// Resolves once the hub has closed this connection.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.subscriptions
            .lock()
            .map(|subs| subs.contains(channel))
            .unwrap_or(false)
    }

    /// Queue a message without waiting; a full queue drops it.
    pub fn try_send(&self, message: String) -> SendOutcome {
        if self.is_closing() {
            return SendOutcome::Closed;
        }
        match self.tx.try_send(message) {
            Ok(()) => {
                self.consecutive_drops.store(0, Ordering::Relaxed);
                SendOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_ws_dropped();
                let drops = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                if drops >= self.max_dropped {
                    SendOutcome::Overflow
                } else {
                    SendOutcome::Dropped
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(capacity: usize, max_dropped: u32) -> (Connection, mpsc::Receiver<String>) {
        Connection::new(Uuid::new_v4(), Uuid::new_v4(), capacity, max_dropped)
    }

    #[test]
    fn transitions_only_from_expected_state() {
        let (conn, _rx) = connection(4, 4);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.transition(ConnectionState::Authenticated, ConnectionState::Active));
        assert!(conn.transition(ConnectionState::Connecting, ConnectionState::Authenticated));
        assert!(conn.transition(ConnectionState::Authenticated, ConnectionState::Active));
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[test]
    fn close_is_won_exactly_once() {
        let (conn, _rx) = connection(4, 4);
        assert!(conn.begin_close(CloseReason::IdleTimeout));
        assert!(!conn.begin_close(CloseReason::TransportError));
        assert_eq!(conn.close_reason(), CloseReason::IdleTimeout);
        conn.finish_close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.begin_close(CloseReason::Shutdown));
    }

    #[test]
    fn concurrent_close_has_single_winner() {
        let (conn, _rx) = connection(4, 4);
        let conn = std::sync::Arc::new(conn);
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let conn = conn.clone();
                    scope.spawn(move || usize::from(conn.begin_close(CloseReason::TransportError)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn full_queue_drops_then_overflows() {
        let (conn, mut rx) = connection(1, 3);
        assert_eq!(conn.try_send("a".into()), SendOutcome::Queued);
        assert_eq!(conn.try_send("b".into()), SendOutcome::Dropped);
        assert_eq!(conn.try_send("c".into()), SendOutcome::Dropped);
        assert_eq!(conn.try_send("d".into()), SendOutcome::Overflow);

        // Draining resets the streak.
        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(conn.try_send("e".into()), SendOutcome::Queued);
        assert_eq!(conn.try_send("f".into()), SendOutcome::Dropped);
    }

    #[test]
    fn closing_connection_rejects_sends() {
        let (conn, _rx) = connection(4, 4);
        conn.begin_close(CloseReason::Shutdown);
        assert_eq!(conn.try_send("x".into()), SendOutcome::Closed);
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::SlowConsumer.close_code(), 1008);
        assert_eq!(CloseReason::Shutdown.close_code(), 1001);
        assert_eq!(CloseReason::IdleTimeout.close_code(), 1000);
    }
}
