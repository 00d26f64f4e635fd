//! In-process store used by tests and single-master deployments.
//!
//! All state sits behind one lock, so every multi-request operation is
//! trivially all-or-nothing.

use async_trait::async_trait;
use bosun_core::buildset::{
    BuildRequest, BuildRequestFilter, BuildSet, BuildSetCreated, BuildSetSubmission,
    CompletedBuildSet, Results,
};
use bosun_core::change::{Change, NewChange};
use bosun_core::ids::*;
use bosun_core::ports::{BuildRequestStore, ChangeStore, SchedulerStateStore};
use bosun_core::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Default)]
struct Inner {
    changes: Vec<Change>,
    buildsets: HashMap<BuildSetId, (u64, BuildSet)>,
    requests: HashMap<BuildRequestId, (u64, BuildRequest)>,
    state: HashMap<(String, String, String), serde_json::Value>,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn request(&self, id: BuildRequestId) -> Result<&BuildRequest> {
        self.requests
            .get(&id)
            .map(|(_, r)| r)
            .ok_or_else(|| Error::BuildRequestNotFound(id.to_string()))
    }

    /// Complete any of `buildsets` whose requests are now all complete.
    fn derive_completions(
        &mut self,
        buildsets: BTreeSet<BuildSetId>,
        complete_at: DateTime<Utc>,
    ) -> Vec<CompletedBuildSet> {
        let mut completed = Vec::new();
        for bsid in buildsets {
            let children: Vec<&BuildRequest> = self
                .requests
                .values()
                .map(|(_, r)| r)
                .filter(|r| r.buildset_id == bsid)
                .collect();
            if children.iter().any(|r| !r.complete) {
                continue;
            }
            let results = Results::worst_of(children.iter().filter_map(|r| r.results));
            if let Some((_, bs)) = self.buildsets.get_mut(&bsid) {
                if bs.complete {
                    continue;
                }
                bs.complete = true;
                bs.complete_at = Some(complete_at);
                bs.results = Some(results);
                completed.push(CompletedBuildSet {
                    buildset_id: bsid,
                    scheduler_name: bs.scheduler_name.clone(),
                    results,
                    complete_at,
                });
            }
        }
        completed
    }
}

/// Memory-backed implementation of every store port.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangeStore for MemoryStore {
    async fn add_change(&self, change: NewChange) -> Result<Change> {
        let mut inner = self.inner.lock();
        let number = inner.changes.len() as u64 + 1;
        let change = change.into_change(number, Utc::now());
        inner.changes.push(change.clone());
        Ok(change)
    }

    async fn get_change(&self, number: u64) -> Result<Option<Change>> {
        let inner = self.inner.lock();
        Ok(number
            .checked_sub(1)
            .and_then(|idx| inner.changes.get(idx as usize))
            .cloned())
    }

    async fn get_changes(&self, numbers: &[u64]) -> Result<Vec<Change>> {
        let inner = self.inner.lock();
        numbers
            .iter()
            .map(|&n| {
                n.checked_sub(1)
                    .and_then(|idx| inner.changes.get(idx as usize))
                    .cloned()
                    .ok_or(Error::ChangeNotFound(n))
            })
            .collect()
    }

    async fn last_change_number(&self) -> Result<Option<u64>> {
        Ok(self.inner.lock().changes.last().map(|c| c.number))
    }
}

#[async_trait]
impl BuildRequestStore for MemoryStore {
    async fn add_buildset(
        &self,
        submission: &BuildSetSubmission,
        submitted_at: DateTime<Utc>,
    ) -> Result<BuildSetCreated> {
        if submission.builder_names.is_empty() {
            return Err(Error::InvalidInput("buildset has no builders".into()));
        }
        let mut inner = self.inner.lock();
        let buildset_id = BuildSetId::new();
        let buildset = BuildSet {
            id: buildset_id,
            scheduler_name: submission.scheduler_name.clone(),
            sourcestamps: submission.sourcestamps.clone(),
            reason: submission.reason.clone(),
            properties: submission.properties.clone(),
            builder_names: submission.builder_names.clone(),
            external_idstring: submission.external_idstring.clone(),
            parent_build_id: submission.parent_build_id,
            submitted_at,
            complete: false,
            complete_at: None,
            results: None,
        };
        let seq = inner.next_seq();
        inner.buildsets.insert(buildset_id, (seq, buildset));

        let mut requests = Vec::with_capacity(submission.builder_names.len());
        for builder in &submission.builder_names {
            let request = BuildRequest {
                id: BuildRequestId::new(),
                buildset_id,
                builder_name: builder.clone(),
                priority: submission.priority,
                submitted_at,
                claimed_at: None,
                claimed_by: None,
                complete: false,
                complete_at: None,
                results: None,
            };
            requests.push((builder.clone(), request.id));
            let seq = inner.next_seq();
            inner.requests.insert(request.id, (seq, request));
        }

        Ok(BuildSetCreated {
            buildset_id,
            requests,
        })
    }

    async fn get_buildset(&self, id: BuildSetId) -> Result<Option<BuildSet>> {
        Ok(self.inner.lock().buildsets.get(&id).map(|(_, bs)| bs.clone()))
    }

    async fn list_buildsets(&self, complete: Option<bool>) -> Result<Vec<BuildSet>> {
        let inner = self.inner.lock();
        let mut sets: Vec<&(u64, BuildSet)> = inner
            .buildsets
            .values()
            .filter(|(_, bs)| complete.is_none_or(|c| bs.complete == c))
            .collect();
        sets.sort_by_key(|(seq, bs)| (bs.submitted_at, *seq));
        Ok(sets.into_iter().map(|(_, bs)| bs.clone()).collect())
    }

    async fn get_build_request(&self, id: BuildRequestId) -> Result<Option<BuildRequest>> {
        Ok(self.inner.lock().requests.get(&id).map(|(_, r)| r.clone()))
    }

    async fn list_build_requests(&self, filter: &BuildRequestFilter) -> Result<Vec<BuildRequest>> {
        let inner = self.inner.lock();
        let mut requests: Vec<&(u64, BuildRequest)> = inner
            .requests
            .values()
            .filter(|(_, r)| filter.matches(r))
            .collect();
        requests.sort_by_key(|(seq, r)| (r.submitted_at, *seq));
        Ok(requests.into_iter().map(|(_, r)| r.clone()).collect())
    }

    async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        claimed_at: DateTime<Utc>,
        master: MasterId,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        for &id in ids {
            let request = inner.request(id)?;
            if request.complete {
                return Err(Error::AlreadyComplete(id.to_string()));
            }
            if request.claimed_by.is_some_and(|owner| owner != master) {
                return Err(Error::AlreadyClaimed(id.to_string()));
            }
        }
        for id in ids {
            if let Some((_, request)) = inner.requests.get_mut(id) {
                request.claimed_by = Some(master);
                request.claimed_at = Some(claimed_at);
            }
        }
        Ok(())
    }

    async fn reclaim_build_requests(
        &self,
        ids: &[BuildRequestId],
        master: MasterId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        for &id in ids {
            if !inner.request(id)?.is_claimed_by(master) {
                return Err(Error::ClaimLost(id.to_string()));
            }
        }
        for id in ids {
            if let Some((_, request)) = inner.requests.get_mut(id) {
                request.claimed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn unclaim_build_requests(&self, ids: &[BuildRequestId], master: MasterId) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in ids {
            if let Some((_, request)) = inner.requests.get_mut(id) {
                if request.is_claimed_by(master) {
                    request.claimed_by = None;
                    request.claimed_at = None;
                }
            }
        }
        Ok(())
    }

    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> Result<Vec<CompletedBuildSet>> {
        let mut inner = self.inner.lock();
        for &id in ids {
            let request = inner.request(id)?;
            if request.complete {
                return Err(Error::AlreadyComplete(id.to_string()));
            }
            if request.claimed_by.is_none() {
                return Err(Error::NotClaimed(id.to_string()));
            }
        }
        let mut touched = BTreeSet::new();
        for id in ids {
            if let Some((_, request)) = inner.requests.get_mut(id) {
                request.complete = true;
                request.complete_at = Some(complete_at);
                request.results = Some(results);
                touched.insert(request.buildset_id);
            }
        }
        Ok(inner.derive_completions(touched, complete_at))
    }

    async fn unclaim_expired(&self, claimed_before: DateTime<Utc>) -> Result<Vec<BuildRequestId>> {
        let mut inner = self.inner.lock();
        let mut released = Vec::new();
        for (_, request) in inner.requests.values_mut() {
            if request.complete {
                continue;
            }
            if request.claimed_at.is_some_and(|at| at < claimed_before) {
                request.claimed_by = None;
                request.claimed_at = None;
                released.push(request.id);
            }
        }
        if !released.is_empty() {
            debug!(count = released.len(), %claimed_before, "Released expired claims");
        }
        Ok(released)
    }
}

#[async_trait]
impl SchedulerStateStore for MemoryStore {
    async fn get_state(
        &self,
        scheduler: &str,
        kind: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let key = (scheduler.to_string(), kind.to_string(), key.to_string());
        Ok(self.inner.lock().state.get(&key).cloned())
    }

    async fn set_state(
        &self,
        scheduler: &str,
        kind: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let key = (scheduler.to_string(), kind.to_string(), key.to_string());
        self.inner.lock().state.insert(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_core::sourcestamp::SourceStamp;
    use chrono::Duration;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn submission(builders: &[&str]) -> BuildSetSubmission {
        BuildSetSubmission::new(
            builders.iter().map(|b| b.to_string()).collect(),
            vec![SourceStamp::new("").with_branch(Some("main".into()))],
        )
        .with_reason("test")
    }

    #[tokio::test]
    async fn test_change_numbers_are_monotonic() {
        let store = MemoryStore::new();
        let a = store.add_change(NewChange::new("a")).await.unwrap();
        let b = store.add_change(NewChange::new("b")).await.unwrap();
        assert_eq!((a.number, b.number), (1, 2));
        assert_eq!(store.last_change_number().await.unwrap(), Some(2));
        assert_eq!(store.get_change(2).await.unwrap().unwrap().who, "b");
        assert!(matches!(
            store.get_changes(&[1, 9]).await,
            Err(Error::ChangeNotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_add_buildset_creates_one_request_per_builder() {
        let store = MemoryStore::new();
        let created = store
            .add_buildset(&submission(&["b1", "b2", "b2"]), Utc::now())
            .await
            .unwrap();
        assert_eq!(created.requests.len(), 3);

        let b2 = store
            .list_build_requests(&BuildRequestFilter::unclaimed_for("b2"))
            .await
            .unwrap();
        assert_eq!(b2.len(), 2);
        assert!(b2.iter().all(|r| r.buildset_id == created.buildset_id));
    }

    #[tokio::test]
    async fn test_empty_builder_list_rejected() {
        let store = MemoryStore::new();
        assert!(store.add_buildset(&submission(&[]), Utc::now()).await.is_err());
        assert!(store.list_buildsets(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_all_or_nothing() {
        let store = MemoryStore::new();
        let created = store
            .add_buildset(&submission(&["b1", "b2"]), Utc::now())
            .await
            .unwrap();
        let (m1, m2) = (MasterId::new(), MasterId::new());
        let first = created.request_for("b1").unwrap();
        let second = created.request_for("b2").unwrap();

        store.claim_build_requests(&[first], Utc::now(), m1).await.unwrap();
        let err = store
            .claim_build_requests(&[second, first], Utc::now(), m2)
            .await
            .unwrap_err();
        assert!(err.is_contention());

        let untouched = store.get_build_request(second).await.unwrap().unwrap();
        assert_eq!(untouched.claimed_by, None);

        // The owning master may claim again.
        assert_ok!(
            store
                .claim_build_requests(&[first, second], Utc::now(), m1)
                .await
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_award_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let created = store
            .add_buildset(&submission(&["b1"]), Utc::now())
            .await
            .unwrap();
        let id = created.request_for("b1").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_build_requests(&[id], Utc::now(), MasterId::new())
                    .await
                    .is_ok()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_reclaim_fails_after_ownership_lost() {
        let store = MemoryStore::new();
        let created = store
            .add_buildset(&submission(&["b1"]), Utc::now())
            .await
            .unwrap();
        let id = created.request_for("b1").unwrap();
        let master = MasterId::new();
        let t0 = Utc::now();

        store.claim_build_requests(&[id], t0, master).await.unwrap();
        store
            .reclaim_build_requests(&[id], master, t0 + Duration::seconds(10))
            .await
            .unwrap();

        let released = store.unclaim_expired(t0 + Duration::seconds(5)).await.unwrap();
        assert!(released.is_empty());
        let released = store.unclaim_expired(t0 + Duration::seconds(60)).await.unwrap();
        assert_eq!(released, vec![id]);

        let err = store
            .reclaim_build_requests(&[id], master, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClaimLost(_)));
    }

    #[tokio::test]
    async fn test_unclaim_only_releases_own_claims() {
        let store = MemoryStore::new();
        let created = store
            .add_buildset(&submission(&["b1"]), Utc::now())
            .await
            .unwrap();
        let id = created.request_for("b1").unwrap();
        let (owner, other) = (MasterId::new(), MasterId::new());

        store.claim_build_requests(&[id], Utc::now(), owner).await.unwrap();
        store.unclaim_build_requests(&[id], other).await.unwrap();
        assert!(store.get_build_request(id).await.unwrap().unwrap().is_claimed_by(owner));

        store.unclaim_build_requests(&[id], owner).await.unwrap();
        assert_eq!(store.get_build_request(id).await.unwrap().unwrap().claimed_by, None);
    }

    #[tokio::test]
    async fn test_complete_requires_claim() {
        let store = MemoryStore::new();
        let created = store
            .add_buildset(&submission(&["b1"]), Utc::now())
            .await
            .unwrap();
        let id = created.request_for("b1").unwrap();
        let err = assert_err!(
            store
                .complete_build_requests(&[id], Results::Success, Utc::now())
                .await
        );
        assert!(matches!(err, Error::NotClaimed(_)));
    }

    #[tokio::test]
    async fn test_buildset_completion_is_derived() {
        let store = MemoryStore::new();
        let created = store
            .add_buildset(&submission(&["b1", "b2"]).with_scheduler("s"), Utc::now())
            .await
            .unwrap();
        let master = MasterId::new();
        let ids = created.request_ids();
        store.claim_build_requests(&ids, Utc::now(), master).await.unwrap();

        let done = store
            .complete_build_requests(&ids[..1], Results::Success, Utc::now())
            .await
            .unwrap();
        assert!(done.is_empty());
        let bs = store.get_buildset(created.buildset_id).await.unwrap().unwrap();
        assert!(!bs.complete);

        let done = store
            .complete_build_requests(&ids[1..], Results::Failure, Utc::now())
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].results, Results::Failure);
        assert_eq!(done[0].scheduler_name.as_deref(), Some("s"));

        let bs = store.get_buildset(created.buildset_id).await.unwrap().unwrap();
        assert!(bs.complete);
        assert_eq!(bs.results, Some(Results::Failure));
        assert_eq!(store.list_buildsets(Some(false)).await.unwrap().len(), 0);

        let err = store
            .complete_build_requests(&ids[..1], Results::Success, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyComplete(_)));
    }

    #[tokio::test]
    async fn test_scheduler_state_is_keyed_by_kind() {
        let store = MemoryStore::new();
        store
            .set_state("s", "single_branch", "last_change", serde_json::json!(4))
            .await
            .unwrap();
        assert_eq!(
            store.get_state("s", "single_branch", "last_change").await.unwrap(),
            Some(serde_json::json!(4))
        );
        assert_eq!(store.get_state("s", "nightly", "last_change").await.unwrap(), None);
    }
}
