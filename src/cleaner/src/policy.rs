//! Timeout and grace-period rules.
//!
//! The policy is pure: it looks at what is known about one write id and an
//! explicit `now` and decides whether the write must be forcibly aborted and
//! whether it may be folded below the watermark.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use common::config::CleanerConfig;
use common::writes::{WriteRecord, WriteState};

/// What the cleaner knows about one allocated write id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Open {
        created_at: DateTime<Utc>,
    },
    Committed,
    Aborted {
        aborted_at: DateTime<Utc>,
        artifacts_deleted: bool,
    },
    /// Allocated but never recorded, e.g. the writer died before recording it.
    Unrecorded,
}

impl WriteStatus {
    pub fn of(record: Option<&WriteRecord>) -> Self {
        match record {
            None => WriteStatus::Unrecorded,
            Some(record) => match record.state {
                WriteState::Open => WriteStatus::Open {
                    created_at: record.created_at,
                },
                WriteState::Committed => WriteStatus::Committed,
                WriteState::Aborted => WriteStatus::Aborted {
                    aborted_at: record.aborted_since(),
                    artifacts_deleted: record.artifacts_deleted,
                },
            },
        }
    }

    /// Aborted with artifacts that still have to be removed.
    pub fn needs_cleanup(&self) -> bool {
        matches!(
            self,
            WriteStatus::Aborted {
                artifacts_deleted: false,
                ..
            }
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{name} of {value:?} does not fit a timestamp delta")]
pub struct PolicyError {
    name: &'static str,
    value: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    heartbeat_timeout: TimeDelta,
    absolute_timeout: TimeDelta,
    aborted_grace_period: TimeDelta,
}

fn delta(name: &'static str, value: Duration) -> Result<TimeDelta, PolicyError> {
    TimeDelta::from_std(value).map_err(|_| PolicyError { name, value })
}

impl TimeoutPolicy {
    pub fn new(
        heartbeat_timeout: Duration,
        absolute_timeout: Duration,
        aborted_grace_period: Duration,
    ) -> Result<Self, PolicyError> {
        Ok(Self {
            heartbeat_timeout: delta("heartbeat_timeout", heartbeat_timeout)?,
            absolute_timeout: delta("absolute_timeout", absolute_timeout)?,
            aborted_grace_period: delta("aborted_grace_period", aborted_grace_period)?,
        })
    }

    /// Whether the write must be forcibly aborted at `now`.
    ///
    /// `bound` is the creation time of the nearest recorded write above an
    /// unrecorded id. Without one the unrecorded write cannot be aged and is
    /// left alone.
    pub fn should_abort(
        &self,
        status: &WriteStatus,
        bound: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match status {
            WriteStatus::Open { created_at } => now - *created_at >= self.absolute_timeout,
            WriteStatus::Unrecorded => {
                bound.is_some_and(|bound| now - bound >= self.heartbeat_timeout)
            }
            WriteStatus::Committed | WriteStatus::Aborted { .. } => false,
        }
    }

    /// Whether the write is resolved and may sit at or below the watermark.
    pub fn is_foldable(&self, status: &WriteStatus, now: DateTime<Utc>) -> bool {
        match status {
            WriteStatus::Committed => true,
            WriteStatus::Aborted {
                aborted_at,
                artifacts_deleted,
            } => *artifacts_deleted && now - *aborted_at >= self.aborted_grace_period,
            WriteStatus::Open { .. } | WriteStatus::Unrecorded => false,
        }
    }
}

impl TryFrom<&CleanerConfig> for TimeoutPolicy {
    type Error = PolicyError;

    fn try_from(config: &CleanerConfig) -> Result<Self, Self::Error> {
        Self::new(
            config.heartbeat_timeout,
            config.absolute_timeout,
            config.aborted_grace_period,
        )
    }
}
