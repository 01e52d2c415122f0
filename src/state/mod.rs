// Reachability tracking
//
// One small state machine per (screen, device) pair. The tracker is shared between device
// pipelines via Arc<RwLock<T>> and broadcasts every transition so the CLI can show progress.

use crate::models::{CaptureResult, CaptureStatus};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

/// Lifecycle of one (screen, device) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReachabilityState {
    Pending,
    Attempting,
    Captured,
    Failed,
    Unreachable,
}

impl ReachabilityState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReachabilityState::Captured | ReachabilityState::Failed | ReachabilityState::Unreachable
        )
    }
}

impl fmt::Display for ReachabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReachabilityState::Pending => "Pending",
            ReachabilityState::Attempting => "Attempting",
            ReachabilityState::Captured => "Captured",
            ReachabilityState::Failed => "Failed",
            ReachabilityState::Unreachable => "Unreachable",
        };
        f.write_str(name)
    }
}

/// Rejected transition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("unknown pair ({screen}, {device})")]
    UnknownPair { screen: String, device: String },

    #[error("({screen}, {device}): cannot go from {from} to {to}")]
    Illegal {
        screen: String,
        device: String,
        from: ReachabilityState,
        to: ReachabilityState,
    },
}

/// Emitted on every accepted transition.
#[derive(Clone, Debug, PartialEq)]
pub struct ReachabilityChange {
    pub screen: String,
    pub device: String,
    pub from: ReachabilityState,
    pub to: ReachabilityState,
    pub attempt: u32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
struct PairRecord {
    state: ReachabilityState,
    attempts: u32,
    launches: u32,
    output_path: Option<Utf8PathBuf>,
    reason: Option<String>,
}

type PairKey = (String, String);

/// Thread-safe registry of every (screen, device) pair of a run.
///
/// Pairs keep registration order, which is the order [`results`](Self::results) reports in.
pub struct ReachabilityTracker {
    pairs: Arc<RwLock<IndexMap<PairKey, PairRecord>>>,
    change_tx: broadcast::Sender<ReachabilityChange>,
}

impl ReachabilityTracker {
    /// Create an empty tracker with a broadcast buffer of 256 events.
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            pairs: Arc::new(RwLock::new(IndexMap::new())),
            change_tx,
        }
    }

    /// Add a pair in `Pending`. Registering an existing pair is a no-op.
    pub fn register(&self, screen: &str, device: &str) {
        let mut pairs = self.pairs.write().unwrap_or_else(PoisonError::into_inner);
        pairs
            .entry((screen.to_string(), device.to_string()))
            .or_insert(PairRecord {
                state: ReachabilityState::Pending,
                attempts: 0,
                launches: 0,
                output_path: None,
                reason: None,
            });
    }

    pub fn state(&self, screen: &str, device: &str) -> Option<ReachabilityState> {
        let pairs = self.pairs.read().unwrap_or_else(PoisonError::into_inner);
        pairs
            .get(&(screen.to_string(), device.to_string()))
            .map(|r| r.state)
    }

    /// Start an attempt. Returns the 1-based attempt number.
    pub fn begin_attempt(&self, screen: &str, device: &str) -> Result<u32, TransitionError> {
        self.transition(screen, device, ReachabilityState::Attempting, |record| {
            record.attempts += 1;
        })
        .map(|record| record.attempts)
    }

    pub fn mark_captured(
        &self,
        screen: &str,
        device: &str,
        path: Utf8PathBuf,
    ) -> Result<(), TransitionError> {
        self.transition(screen, device, ReachabilityState::Captured, |record| {
            record.output_path = Some(path);
        })
        .map(|_| ())
    }

    pub fn mark_failed(
        &self,
        screen: &str,
        device: &str,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        let reason = reason.into();
        self.transition(screen, device, ReachabilityState::Failed, |record| {
            record.reason = Some(reason);
        })
        .map(|_| ())
    }

    pub fn mark_unreachable(
        &self,
        screen: &str,
        device: &str,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        let reason = reason.into();
        self.transition(screen, device, ReachabilityState::Unreachable, |record| {
            record.reason = Some(reason);
        })
        .map(|_| ())
    }

    /// Fail every pair that has not reached a terminal state. Returns how many were failed.
    pub fn fail_incomplete(&self, reason: &str) -> usize {
        let pending: Vec<PairKey> = {
            let pairs = self.pairs.read().unwrap_or_else(PoisonError::into_inner);
            pairs
                .iter()
                .filter(|(_, r)| !r.state.is_terminal())
                .map(|(k, _)| k.clone())
                .collect()
        };
        pending
            .iter()
            .filter(|(screen, device)| self.mark_failed(screen, device, reason).is_ok())
            .count()
    }

    /// Record how many app launches a pair has used so far.
    pub fn set_launches(&self, screen: &str, device: &str, launches: u32) {
        let mut pairs = self.pairs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = pairs.get_mut(&(screen.to_string(), device.to_string())) {
            record.launches = launches;
        }
    }

    /// Forget every pair. Subscribers stay attached.
    pub fn clear(&self) {
        self.pairs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// One result per registered pair, in registration order. Pairs that never reached a
    /// terminal state are reported as failed.
    pub fn results(&self) -> Vec<CaptureResult> {
        let pairs = self.pairs.read().unwrap_or_else(PoisonError::into_inner);
        pairs
            .iter()
            .map(|((screen, device), record)| {
                let status = match record.state {
                    ReachabilityState::Captured => CaptureStatus::Captured,
                    ReachabilityState::Unreachable => CaptureStatus::Unreachable,
                    _ => CaptureStatus::Failed,
                };
                let reason = match record.state {
                    ReachabilityState::Pending | ReachabilityState::Attempting => {
                        Some("not completed".to_string())
                    }
                    _ => record.reason.clone(),
                };
                CaptureResult {
                    screen_id: screen.clone(),
                    device: device.clone(),
                    status,
                    output_path: record.output_path.clone(),
                    reason,
                    attempts: record.attempts,
                    launches: record.launches,
                }
            })
            .collect()
    }

    /// Subscribe to transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReachabilityChange> {
        self.change_tx.subscribe()
    }

    fn transition(
        &self,
        screen: &str,
        device: &str,
        to: ReachabilityState,
        apply: impl FnOnce(&mut PairRecord),
    ) -> Result<PairRecord, TransitionError> {
        let mut pairs = self.pairs.write().unwrap_or_else(PoisonError::into_inner);
        let record = pairs
            .get_mut(&(screen.to_string(), device.to_string()))
            .ok_or_else(|| TransitionError::UnknownPair {
                screen: screen.to_string(),
                device: device.to_string(),
            })?;

        let from = record.state;
        let allowed = match (from, to) {
            (ReachabilityState::Pending, ReachabilityState::Attempting) => true,
            (ReachabilityState::Attempting, ReachabilityState::Attempting) => true,
            (ReachabilityState::Attempting, t) => t.is_terminal(),
            // Cancelled before start or device setup failed.
            (ReachabilityState::Pending, ReachabilityState::Failed) => true,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError::Illegal {
                screen: screen.to_string(),
                device: device.to_string(),
                from,
                to,
            });
        }

        record.state = to;
        apply(record);
        let snapshot = record.clone();
        drop(pairs);

        // Nobody listening is fine.
        let _ = self.change_tx.send(ReachabilityChange {
            screen: screen.to_string(),
            device: device.to_string(),
            from,
            to,
            attempt: snapshot.attempts,
            reason: snapshot.reason.clone(),
        });
        Ok(snapshot)
    }
}

impl Default for ReachabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ReachabilityTracker {
    fn clone(&self) -> Self {
        Self {
            pairs: Arc::clone(&self.pairs),
            change_tx: self.change_tx.clone(),
        }
    }
}
