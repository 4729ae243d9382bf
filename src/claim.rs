//! Lease-based exclusive ownership of a segment's lifecycle.
//!
//! A worker may only run the stage pipeline for a segment while it holds the
//! segment's [`Lease`]. Leases are acquired, renewed and released through a
//! [`LeaseStore`], which only needs a single-row conditional write. Every
//! terminal write is fenced on the lease owner and epoch, so a worker whose
//! lease was taken over after expiry cannot overwrite its successor.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::MergedContext;
use crate::errors::PipelineError;
use crate::store::DbHandle;
use crate::store::models::{Segment, SegmentStatus};

/// Default lease time-to-live.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Source of "now", in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for simulating lease expiry and skew.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Proof of ownership over one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub segment_id: String,
    pub owner_id: String,
    /// Milliseconds since the Unix epoch.
    pub acquired_at: i64,
    pub ttl: Duration,
    /// Incremented on every acquisition; fences stale owners.
    pub epoch: i64,
}

impl Lease {
    pub fn expires_at(&self) -> i64 {
        self.acquired_at + self.ttl.as_millis() as i64
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at()
    }
}

/// Terminal write performed when a lease is given up.
#[derive(Debug, Clone)]
pub enum LeaseRelease {
    Completed {
        context: MergedContext,
        questions_count: i64,
        note: Option<String>,
    },
    Failed {
        error: String,
    },
    /// Back to the queue without counting a retry.
    Pending,
}

/// Storage behind the claim protocol.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn load_segment(&self, segment_id: &str) -> Result<Option<Segment>>;

    /// Conditional acquire. `None` means another live lease or a completed
    /// segment won the race.
    async fn try_acquire(
        &self,
        segment_id: &str,
        owner_id: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<Option<Lease>>;

    /// Extend a held lease. `None` means the lease is no longer ours.
    async fn try_renew(&self, lease: &Lease, now_ms: i64) -> Result<Option<Lease>>;

    /// Owner-fenced terminal write. Returns false if the lease was lost.
    async fn release(&self, lease: &Lease, outcome: LeaseRelease) -> Result<bool>;
}

#[async_trait]
impl LeaseStore for DbHandle {
    async fn load_segment(&self, segment_id: &str) -> Result<Option<Segment>> {
        let segment_id = segment_id.to_string();
        self.call(move |db| db.get_segment(&segment_id)).await
    }

    async fn try_acquire(
        &self,
        segment_id: &str,
        owner_id: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let segment_id = segment_id.to_string();
        let owner_id = owner_id.to_string();
        self.call(move |db| {
            let changed =
                db.try_acquire_segment(&segment_id, &owner_id, now_ms, ttl.as_millis() as i64)?;
            if changed == 0 {
                return Ok(None);
            }
            let epoch = db
                .get_segment(&segment_id)?
                .map(|s| s.lease_epoch)
                .ok_or_else(|| anyhow::anyhow!("Segment {} vanished after acquire", segment_id))?;
            Ok(Some(Lease {
                segment_id,
                owner_id,
                acquired_at: now_ms,
                ttl,
                epoch,
            }))
        })
        .await
    }

    async fn try_renew(&self, lease: &Lease, now_ms: i64) -> Result<Option<Lease>> {
        let lease = lease.clone();
        self.call(move |db| {
            let renewed =
                db.renew_segment_lease(&lease.segment_id, &lease.owner_id, lease.epoch, now_ms)?;
            Ok(renewed.then(|| Lease {
                acquired_at: now_ms,
                ..lease
            }))
        })
        .await
    }

    async fn release(&self, lease: &Lease, outcome: LeaseRelease) -> Result<bool> {
        let lease = lease.clone();
        self.call(move |db| match outcome {
            LeaseRelease::Completed {
                context,
                questions_count,
                note,
            } => db.complete_segment(
                &lease.segment_id,
                &lease.owner_id,
                lease.epoch,
                &context,
                questions_count,
                note.as_deref(),
            ),
            LeaseRelease::Failed { error } => {
                db.fail_segment(&lease.segment_id, &lease.owner_id, lease.epoch, &error)
            }
            LeaseRelease::Pending => {
                db.revert_segment_to_pending(&lease.segment_id, &lease.owner_id, lease.epoch)
            }
        })
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimReason {
    AlreadyDone,
    Conflict,
}

impl std::fmt::Display for ClaimReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyDone => write!(f, "already done"),
            Self::Conflict => write!(f, "held by another worker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    Granted(Lease),
    Denied(ClaimReason),
}

impl ClaimDecision {
    pub fn granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn reason(&self) -> Option<ClaimReason> {
        match self {
            Self::Granted(_) => None,
            Self::Denied(reason) => Some(*reason),
        }
    }
}

#[derive(Clone)]
pub struct ClaimManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Try to take ownership of a segment. Conflicts are outcomes, not errors;
    /// only a missing segment or a datastore failure is returned as `Err`.
    pub async fn attempt_claim(
        &self,
        segment_id: &str,
        worker_id: &str,
    ) -> Result<ClaimDecision, PipelineError> {
        let segment = self
            .store
            .load_segment(segment_id)
            .await
            .map_err(PipelineError::Database)?
            .ok_or_else(|| PipelineError::SegmentNotFound {
                segment_id: segment_id.to_string(),
            })?;

        let now = self.clock.now_ms();
        match segment.status {
            SegmentStatus::Completed => return Ok(ClaimDecision::Denied(ClaimReason::AlreadyDone)),
            SegmentStatus::Processing => {
                let started = segment.lease_started_at.unwrap_or(i64::MIN);
                if now.saturating_sub(started) < self.ttl.as_millis() as i64 {
                    tracing::debug!(
                        segment_id,
                        worker_id,
                        holder = segment.lease_owner.as_deref().unwrap_or(""),
                        "Segment lease is still live"
                    );
                    return Ok(ClaimDecision::Denied(ClaimReason::Conflict));
                }
                tracing::warn!(
                    segment_id,
                    worker_id,
                    previous_owner = segment.lease_owner.as_deref().unwrap_or(""),
                    "Taking over expired segment lease"
                );
            }
            SegmentStatus::Pending | SegmentStatus::Failed => {}
        }

        match self
            .store
            .try_acquire(segment_id, worker_id, now, self.ttl)
            .await
            .map_err(PipelineError::Database)?
        {
            Some(lease) => {
                tracing::info!(segment_id, worker_id, epoch = lease.epoch, "Segment claimed");
                Ok(ClaimDecision::Granted(lease))
            }
            None => Ok(ClaimDecision::Denied(ClaimReason::Conflict)),
        }
    }

    /// Renew a lease between stages. Losing it is reported as `LeaseLost`.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease, PipelineError> {
        let now = self.clock.now_ms();
        self.store
            .try_renew(lease, now)
            .await
            .map_err(PipelineError::Database)?
            .ok_or_else(|| PipelineError::LeaseLost {
                segment_id: lease.segment_id.clone(),
            })
    }

    pub async fn release(&self, lease: &Lease, outcome: LeaseRelease) -> Result<bool, PipelineError> {
        let released = self
            .store
            .release(lease, outcome)
            .await
            .map_err(PipelineError::Database)?;
        if !released {
            tracing::warn!(
                segment_id = %lease.segment_id,
                owner = %lease.owner_id,
                epoch = lease.epoch,
                "Lease release rejected; a newer owner holds the segment"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::TimeRange;
    use crate::store::segment_id_for;

    async fn setup(clock: Arc<ManualClock>) -> (DbHandle, ClaimManager, String) {
        let db = DbHandle::in_memory().unwrap();
        let course = db
            .call(|db| db.create_course("Optics", "video://optics", &[TimeRange::new(0.0, 600.0)]))
            .await
            .unwrap();
        let manager = ClaimManager::new(Arc::new(db.clone()), clock, DEFAULT_LEASE_TIMEOUT);
        (db, manager, segment_id_for(&course.id, 0))
    }

    #[test]
    fn test_lease_expiry() {
        let lease = Lease {
            segment_id: "s".into(),
            owner_id: "w".into(),
            acquired_at: 1_000,
            ttl: Duration::from_secs(1),
            epoch: 1,
        };
        assert!(!lease.is_expired(1_999));
        assert!(lease.is_expired(2_000));
    }

    #[tokio::test]
    async fn test_concurrent_claims_grant_exactly_one() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let (_db, manager, seg) = setup(clock).await;

        let (a, b) = tokio::join!(
            manager.attempt_claim(&seg, "worker-a"),
            manager.attempt_claim(&seg, "worker-b")
        );
        let decisions = [a.unwrap(), b.unwrap()];
        assert_eq!(decisions.iter().filter(|d| d.granted()).count(), 1);
        assert!(
            decisions
                .iter()
                .any(|d| d.reason() == Some(ClaimReason::Conflict))
        );
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let (_db, manager, seg) = setup(clock.clone()).await;

        assert!(manager.attempt_claim(&seg, "worker-a").await.unwrap().granted());
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            manager.attempt_claim(&seg, "worker-b").await.unwrap().reason(),
            Some(ClaimReason::Conflict)
        );

        clock.advance(DEFAULT_LEASE_TIMEOUT);
        let decision = manager.attempt_claim(&seg, "worker-b").await.unwrap();
        match decision {
            ClaimDecision::Granted(lease) => {
                assert_eq!(lease.owner_id, "worker-b");
                assert_eq!(lease.epoch, 2);
            }
            other => panic!("Expected takeover, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lease_is_takeable_exactly_at_timeout() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let (_db, manager, seg) = setup(clock.clone()).await;
        let Ok(ClaimDecision::Granted(first)) = manager.attempt_claim(&seg, "worker-a").await else {
            panic!("first claim should be granted");
        };

        clock.set(first.expires_at() - 1);
        assert!(!first.is_expired(clock.now_ms()));
        assert_eq!(
            manager.attempt_claim(&seg, "worker-b").await.unwrap().reason(),
            Some(ClaimReason::Conflict)
        );

        clock.set(first.expires_at());
        assert!(first.is_expired(clock.now_ms()));
        let decision = manager.attempt_claim(&seg, "worker-b").await.unwrap();
        assert!(decision.granted(), "expected takeover at expiry, got {:?}", decision);
    }

    #[tokio::test]
    async fn test_skewed_clock_cannot_steal_live_lease() {
        let fast = Arc::new(ManualClock::new(1_000_000));
        let (db, manager, seg) = setup(fast.clone()).await;
        assert!(manager.attempt_claim(&seg, "worker-a").await.unwrap().granted());

        // A worker whose clock runs behind sees the lease as even fresher.
        let slow = Arc::new(ManualClock::new(900_000));
        let lagging = ClaimManager::new(Arc::new(db), slow, DEFAULT_LEASE_TIMEOUT);
        assert_eq!(
            lagging.attempt_claim(&seg, "worker-b").await.unwrap().reason(),
            Some(ClaimReason::Conflict)
        );
    }

    #[tokio::test]
    async fn test_completed_segment_reports_already_done() {
        let clock = Arc::new(ManualClock::new(0));
        let (_db, manager, seg) = setup(clock).await;
        let lease = match manager.attempt_claim(&seg, "w").await.unwrap() {
            ClaimDecision::Granted(lease) => lease,
            other => panic!("Expected grant, got {:?}", other),
        };
        let released = manager
            .release(
                &lease,
                LeaseRelease::Completed {
                    context: MergedContext::default(),
                    questions_count: 0,
                    note: None,
                },
            )
            .await
            .unwrap();
        assert!(released);
        assert_eq!(
            manager.attempt_claim(&seg, "w2").await.unwrap().reason(),
            Some(ClaimReason::AlreadyDone)
        );
    }

    #[tokio::test]
    async fn test_stale_owner_cannot_renew_or_release() {
        let clock = Arc::new(ManualClock::new(0));
        let (_db, manager, seg) = setup(clock.clone()).await;
        let Ok(ClaimDecision::Granted(stale)) = manager.attempt_claim(&seg, "worker-a").await else {
            panic!("first claim should be granted");
        };
        clock.advance(DEFAULT_LEASE_TIMEOUT + Duration::from_secs(1));
        assert!(manager.attempt_claim(&seg, "worker-b").await.unwrap().granted());

        assert!(matches!(
            manager.renew(&stale).await,
            Err(PipelineError::LeaseLost { .. })
        ));
        assert!(
            !manager
                .release(&stale, LeaseRelease::Failed { error: "late".into() })
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_segment_is_an_error() {
        let clock = Arc::new(ManualClock::new(0));
        let (_db, manager, _seg) = setup(clock).await;
        assert!(matches!(
            manager.attempt_claim("nope", "w").await,
            Err(PipelineError::SegmentNotFound { .. })
        ));
    }
}
