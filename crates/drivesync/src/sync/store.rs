//! Observable state store
//!
//! `SyncState` is only ever changed by dispatching a `StoreAction` through the
//! pure `reduce` function. The transition is applied atomically under the
//! store lock; subscribers are notified afterwards, with the lock released,
//! so they always observe complete transitions and may read the store again.
//!
//! Every change bumps a sequence number. Deliveries are serialized and never
//! go backwards: a dispatcher whose change was already covered by a newer
//! delivery skips notifying, so subscribers always end on the current state.
//! Subscribers must not dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::debug;

use crate::models::{ExportSummary, SyncState, SyncStatus, UserInfo};
use crate::runtime::lock;

/// Handle returned by `subscribe`
pub type SubscriptionId = u64;

type Subscriber = Arc<dyn Fn(&SyncState) + Send + Sync>;

/// State transitions
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    /// An interactive connect began
    ConnectStarted,
    Connected {
        user_info: UserInfo,
        last_sync_time: Option<DateTime<Utc>>,
    },
    ConnectFailed {
        message: String,
    },
    /// Result of a non-interactive session check
    ConnectionChecked {
        authenticated: bool,
        user_info: Option<UserInfo>,
    },
    Disconnected,
    /// The remote rejected our token outside a sync action
    AuthExpired {
        message: String,
    },
    SyncStarted,
    SyncSucceeded {
        at: DateTime<Utc>,
        export_result: Option<ExportSummary>,
    },
    SyncFailed {
        message: String,
        needs_reconnect: bool,
        export_result: Option<ExportSummary>,
    },
    /// State rehydrated from the persisted sync record
    Restored {
        is_authenticated: bool,
        user_info: Option<UserInfo>,
        last_sync_time: Option<DateTime<Utc>>,
    },
    ClearError,
}

/// Compute the state that follows `action`
///
/// Overlapping sync actions are counted: the status stays `Syncing` until the
/// last one finishes, and an error raised by any of them is kept.
pub fn reduce(state: &SyncState, action: &StoreAction) -> SyncState {
    let mut next = state.clone();

    match action {
        StoreAction::ConnectStarted => {
            next.is_connecting = true;
            next.error = None;
        }
        StoreAction::Connected {
            user_info,
            last_sync_time,
        } => {
            next.is_connecting = false;
            next.is_authenticated = true;
            next.user_info = Some(user_info.clone());
            next.last_sync_time = last_sync_time.or(state.last_sync_time);
            next.error = None;
        }
        StoreAction::ConnectFailed { message } => {
            next.is_connecting = false;
            next.is_authenticated = false;
            next.error = Some(message.clone());
        }
        StoreAction::ConnectionChecked {
            authenticated,
            user_info,
        } => {
            next.is_authenticated = *authenticated;
            next.user_info = if *authenticated {
                user_info.clone().or_else(|| state.user_info.clone())
            } else {
                None
            };
        }
        StoreAction::Disconnected => {
            next = SyncState {
                active_operations: state.active_operations,
                sync_status: if state.active_operations > 0 {
                    SyncStatus::Syncing
                } else {
                    SyncStatus::Idle
                },
                ..SyncState::default()
            };
        }
        StoreAction::AuthExpired { message } => {
            next.is_authenticated = false;
            next.error = Some(message.clone());
        }
        StoreAction::SyncStarted => {
            // A fresh batch supersedes the previous error.
            if state.active_operations == 0 {
                next.error = None;
            }
            next.active_operations = state.active_operations + 1;
            next.sync_status = SyncStatus::Syncing;
        }
        StoreAction::SyncSucceeded { at, export_result } => {
            next.active_operations = state.active_operations.saturating_sub(1);
            next.last_sync_time = Some(*at);
            if export_result.is_some() {
                next.export_result = export_result.clone();
            }
            next.sync_status = settle(&next);
        }
        StoreAction::SyncFailed {
            message,
            needs_reconnect,
            export_result,
        } => {
            next.active_operations = state.active_operations.saturating_sub(1);
            next.error = Some(message.clone());
            if *needs_reconnect {
                next.is_authenticated = false;
            }
            if export_result.is_some() {
                next.export_result = export_result.clone();
            }
            next.sync_status = settle(&next);
        }
        StoreAction::Restored {
            is_authenticated,
            user_info,
            last_sync_time,
        } => {
            next.is_authenticated = *is_authenticated;
            next.user_info = user_info.clone();
            next.last_sync_time = *last_sync_time;
        }
        StoreAction::ClearError => {
            next.error = None;
            if next.sync_status == SyncStatus::Error {
                next.sync_status = SyncStatus::Idle;
            }
        }
    }

    next
}

/// Status once an operation has finished
fn settle(state: &SyncState) -> SyncStatus {
    if state.active_operations > 0 {
        SyncStatus::Syncing
    } else if state.error.is_some() {
        SyncStatus::Error
    } else {
        SyncStatus::Success
    }
}

/// State together with the sequence number of its last change
struct Stamped {
    state: SyncState,
    seq: u64,
}

/// Holds the shared `SyncState` and its subscribers
pub struct StateStore {
    current: Mutex<Stamped>,
    /// Sequence number of the last state handed to subscribers
    delivered: Mutex<u64>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_state(SyncState::default())
    }

    pub fn with_state(state: SyncState) -> Self {
        Self {
            current: Mutex::new(Stamped { state, seq: 0 }),
            delivered: Mutex::new(0),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Current state
    pub fn snapshot(&self) -> SyncState {
        lock(&self.current).state.clone()
    }

    /// Apply `action` and notify subscribers if the state changed
    pub fn dispatch(&self, action: StoreAction) -> SyncState {
        let (next, seq) = {
            let mut current = lock(&self.current);
            let next = reduce(&current.state, &action);
            let seq = if next != current.state {
                current.seq += 1;
                current.state = next.clone();
                Some(current.seq)
            } else {
                None
            };
            (next, seq)
        };

        debug!("[STATE] {:?} -> {:?}", action, next.sync_status);
        if let Some(seq) = seq {
            self.notify(seq);
        }
        next
    }

    /// Deliver the newest state unless a delivery at or past `seq` happened
    fn notify(&self, seq: u64) {
        let mut delivered = lock(&self.delivered);
        if *delivered >= seq {
            return;
        }

        let (state, latest) = {
            let current = lock(&self.current);
            (current.state.clone(), current.seq)
        };
        *delivered = latest;

        let subscribers: Vec<Subscriber> = lock(&self.subscribers)
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();

        for subscriber in subscribers {
            subscriber(&state);
        }
    }

    /// Register a callback run after every state change
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push((id, Arc::new(subscriber)));
        id
    }

    /// Remove a subscriber; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
