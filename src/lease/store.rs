//! Compare-and-swap access to `coordination.k8s.io/v1` Lease records
//!
//! Both the leader elector and the per-resource lease coordinator store their
//! claims in Lease objects. Every write carries the resourceVersion that was
//! read, so a concurrent writer makes the update fail with 409 Conflict and
//! the caller simply observes "not acquired".

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

/// Outcome of a single acquire-or-renew attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease did not exist, or had expired, and is now ours
    Acquired,
    /// We already held the lease and extended it
    Renewed,
    /// Another holder owns an unexpired lease
    Held {
        /// Identity of the current holder
        holder: String,
    },
    /// Someone else wrote the lease between our read and write
    Conflict,
}

/// Outcome of a release attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The holder was cleared
    Released,
    /// The lease is missing or held by someone else; nothing was written
    NotHeld,
    /// Someone else wrote the lease between our read and write
    Conflict,
}

impl AcquireOutcome {
    /// Whether the caller holds the lease after this attempt
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Acquired | Self::Renewed)
    }
}

/// What to do with an existing lease, decided from its spec alone
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Claim {
    /// We are the holder
    Renew,
    /// Expired or unheld; take it over with the next transition count
    TakeOver { transitions: i32 },
    /// Somebody else holds it and it has not expired
    HeldBy(String),
}

/// Decide how to claim an existing lease
pub(crate) fn decide_claim(spec: Option<&LeaseSpec>, holder: &str, now: DateTime<Utc>) -> Claim {
    let current = spec.and_then(|s| s.holder_identity.as_deref());
    if current == Some(holder) {
        return Claim::Renew;
    }

    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
    let current = match current {
        Some(h) if !h.is_empty() => h,
        _ => return Claim::TakeOver { transitions },
    };

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    };

    if expired {
        Claim::TakeOver { transitions }
    } else {
        Claim::HeldBy(current.to_string())
    }
}

/// Namespaced view over Lease records
#[derive(Clone)]
pub struct LeaseStore {
    api: Api<Lease>,
    namespace: String,
}

impl LeaseStore {
    /// Create a store for leases in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// Namespace the leases live in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Read a lease, `None` if it does not exist
    pub async fn get(&self, name: &str) -> Result<Option<Lease>, kube::Error> {
        match self.api.get(name).await {
            Ok(lease) => Ok(Some(lease)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Try to acquire the lease for `holder`, or renew it if already held
    pub async fn try_acquire_or_renew(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<AcquireOutcome, kube::Error> {
        let now = Utc::now();

        let existing = match self.get(name).await? {
            None => return self.create(name, holder, duration, now).await,
            Some(lease) => lease,
        };

        match decide_claim(existing.spec.as_ref(), holder, now) {
            Claim::Renew => {
                let mut updated = existing;
                if let Some(ref mut spec) = updated.spec {
                    spec.renew_time = Some(MicroTime(now));
                    spec.lease_duration_seconds = Some(duration_secs(duration));
                }
                self.replace(name, &updated, AcquireOutcome::Renewed).await
            }
            Claim::TakeOver { transitions } => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(self.namespace.clone()),
                        resource_version: existing.metadata.resource_version.clone(),
                        ..Default::default()
                    },
                    spec: Some(held_spec(holder, duration, now, transitions + 1)),
                };
                let outcome = self.replace(name, &lease, AcquireOutcome::Acquired).await?;
                if outcome.is_held() {
                    info!(
                        lease = name,
                        holder,
                        transitions = transitions + 1,
                        "Took over lease"
                    );
                }
                Ok(outcome)
            }
            Claim::HeldBy(current) => Ok(AcquireOutcome::Held { holder: current }),
        }
    }

    /// Renew a lease only if `holder` still owns it; never takes one over
    pub async fn renew(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<AcquireOutcome, kube::Error> {
        let now = Utc::now();
        let Some(existing) = self.get(name).await? else {
            return Ok(AcquireOutcome::Held {
                holder: String::new(),
            });
        };

        match decide_claim(existing.spec.as_ref(), holder, now) {
            Claim::Renew => {
                let mut updated = existing;
                if let Some(ref mut spec) = updated.spec {
                    spec.renew_time = Some(MicroTime(now));
                    spec.lease_duration_seconds = Some(duration_secs(duration));
                }
                self.replace(name, &updated, AcquireOutcome::Renewed).await
            }
            Claim::TakeOver { .. } => Ok(AcquireOutcome::Held {
                holder: existing
                    .spec
                    .and_then(|s| s.holder_identity)
                    .unwrap_or_default(),
            }),
            Claim::HeldBy(current) => Ok(AcquireOutcome::Held { holder: current }),
        }
    }

    /// Clear the holder so another party can acquire without waiting for expiry
    pub async fn release(&self, name: &str, holder: &str) -> Result<ReleaseOutcome, kube::Error> {
        let Some(mut lease) = self.get(name).await? else {
            debug!(lease = name, "Lease not found, nothing to release");
            return Ok(ReleaseOutcome::NotHeld);
        };

        let current = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if current != Some(holder) {
            debug!(lease = name, holder, "Not the lease holder, nothing to release");
            return Ok(ReleaseOutcome::NotHeld);
        }

        if let Some(ref mut spec) = lease.spec {
            spec.holder_identity = None;
            spec.acquire_time = None;
            spec.renew_time = None;
        }

        match self.replace(name, &lease, AcquireOutcome::Acquired).await? {
            AcquireOutcome::Conflict => Ok(ReleaseOutcome::Conflict),
            _ => {
                info!(lease = name, holder, "Lease released");
                Ok(ReleaseOutcome::Released)
            }
        }
    }

    async fn create(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, kube::Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(held_spec(holder, duration, now, 0)),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(lease = name, holder, "Created new lease");
                Ok(AcquireOutcome::Acquired)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = name, holder, "Lease creation conflict");
                Ok(AcquireOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace with the resourceVersion carried in `lease`
    async fn replace(
        &self,
        name: &str,
        lease: &Lease,
        on_success: AcquireOutcome,
    ) -> Result<AcquireOutcome, kube::Error> {
        match self.api.replace(name, &PostParams::default(), lease).await {
            Ok(_) => Ok(on_success),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = name, "Lease update conflict");
                Ok(AcquireOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }
}

/// Whole seconds for `leaseDurationSeconds`, saturating at `i32::MAX`
fn duration_secs(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn held_spec(holder: &str, duration: Duration, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(holder.to_string()),
        lease_duration_seconds: Some(duration_secs(duration)),
        acquire_time: Some(MicroTime(now)),
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(transitions),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::fake_api::FakeLeaseApi;

    fn spec(holder: Option<&str>, renewed_secs_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
            )),
            lease_duration_seconds: Some(duration),
            lease_transitions: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn our_own_lease_is_renewed() {
        let s = spec(Some("me"), 100, 15);
        assert_eq!(decide_claim(Some(&s), "me", Utc::now()), Claim::Renew);
    }

    #[test]
    fn live_lease_of_other_holder_is_respected() {
        let s = spec(Some("other"), 1, 15);
        assert_eq!(
            decide_claim(Some(&s), "me", Utc::now()),
            Claim::HeldBy("other".to_string())
        );
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let s = spec(Some("other"), 60, 15);
        assert_eq!(
            decide_claim(Some(&s), "me", Utc::now()),
            Claim::TakeOver { transitions: 3 }
        );
    }

    #[test]
    fn released_lease_is_taken_over_immediately() {
        let s = spec(None, 0, 15);
        assert_eq!(
            decide_claim(Some(&s), "me", Utc::now()),
            Claim::TakeOver { transitions: 3 }
        );
    }

    #[test]
    fn lease_without_timing_counts_as_expired() {
        let s = LeaseSpec {
            holder_identity: Some("other".to_string()),
            ..Default::default()
        };
        assert_eq!(
            decide_claim(Some(&s), "me", Utc::now()),
            Claim::TakeOver { transitions: 0 }
        );
        assert_eq!(
            decide_claim(None, "me", Utc::now()),
            Claim::TakeOver { transitions: 0 }
        );
    }

    #[test]
    fn oversized_durations_saturate() {
        assert_eq!(duration_secs(Duration::from_secs(15)), 15);
        assert_eq!(duration_secs(Duration::from_secs(u64::MAX)), i32::MAX);
        assert_eq!(duration_secs(Duration::from_secs(1 << 31)), i32::MAX);
    }

    fn store(api: &FakeLeaseApi) -> LeaseStore {
        LeaseStore::new(api.client(), "medik8s-leases")
    }

    const TTL: Duration = Duration::from_secs(15);

    #[tokio::test]
    async fn missing_lease_is_created() {
        let api = FakeLeaseApi::new();
        let outcome = store(&api)
            .try_acquire_or_renew("node-a", "me", TTL)
            .await
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired);

        let spec = api.lease("node-a").unwrap().spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("me"));
        assert_eq!(spec.lease_duration_seconds, Some(15));
        assert_eq!(spec.lease_transitions, Some(0));
    }

    #[tokio::test]
    async fn create_conflict_is_not_acquired() {
        let api = FakeLeaseApi::new();
        api.fail_next_writes(1);
        let outcome = store(&api)
            .try_acquire_or_renew("node-a", "me", TTL)
            .await
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Conflict);
        assert!(api.lease("node-a").is_none());
    }

    #[tokio::test]
    async fn takeover_losing_the_race_is_not_acquired() {
        let api = FakeLeaseApi::new();
        api.insert_held("node-a", "other", 60);
        api.fail_next_writes(1);

        let outcome = store(&api)
            .try_acquire_or_renew("node-a", "me", TTL)
            .await
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Conflict);
        assert_eq!(api.holder("node-a").as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_with_next_transition() {
        let api = FakeLeaseApi::new();
        api.insert_held("node-a", "other", 60);

        let outcome = store(&api)
            .try_acquire_or_renew("node-a", "me", TTL)
            .await
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired);
        let spec = api.lease("node-a").unwrap().spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("me"));
        assert_eq!(spec.lease_transitions, Some(2));
    }

    #[tokio::test]
    async fn renew_never_takes_over() {
        let api = FakeLeaseApi::new();
        api.insert_held("node-a", "other", 60);
        let outcome = store(&api).renew("node-a", "me", TTL).await.unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Held {
                holder: "other".to_string()
            }
        );
    }

    #[tokio::test]
    async fn release_reports_each_outcome() {
        let api = FakeLeaseApi::new();
        let store = store(&api);
        assert_eq!(store.release("node-a", "me").await.unwrap(), ReleaseOutcome::NotHeld);

        store.try_acquire_or_renew("node-a", "me", TTL).await.unwrap();
        api.fail_next_writes(1);
        assert_eq!(store.release("node-a", "me").await.unwrap(), ReleaseOutcome::Conflict);
        assert_eq!(store.release("node-a", "me").await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(api.holder("node-a"), None);
    }

    #[test]
    fn outcome_held_only_when_ours() {
        assert!(AcquireOutcome::Acquired.is_held());
        assert!(AcquireOutcome::Renewed.is_held());
        assert!(!AcquireOutcome::Conflict.is_held());
        assert!(!AcquireOutcome::Held {
            holder: "x".into()
        }
        .is_held());
    }
}
