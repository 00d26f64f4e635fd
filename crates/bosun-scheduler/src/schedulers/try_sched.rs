use super::jobfile::parse_job;
use super::{
    BaseConfig, Scheduler, SchedulerContext, SchedulerKind, TryCredentials, TryJob,
};
use async_trait::async_trait;
use bosun_core::buildset::{BuildSetCreated, BuildSetSubmission};
use bosun_core::sourcestamp::SourceStamp;
use bosun_core::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Build the submission for a try job. Every requested builder must be in
/// the scheduler's builder list; an empty request means all of them.
fn try_submission(base: &BaseConfig, job: TryJob) -> Result<BuildSetSubmission> {
    if let Some(bad) = job
        .builder_names
        .iter()
        .find(|b| !base.builder_names.contains(b))
    {
        return Err(Error::BuilderNotAllowed {
            scheduler: base.name.clone(),
            builder: bad.clone(),
        });
    }
    if !base.codebases.contains_key(&job.codebase) {
        return Err(Error::InvalidInput(format!(
            "codebase '{}' is not configured for scheduler '{}'",
            job.codebase, base.name
        )));
    }
    let builders = if job.builder_names.is_empty() {
        base.builder_names.clone()
    } else {
        job.builder_names
    };

    let mut stamp = SourceStamp::new(job.codebase)
        .with_repository(job.repository)
        .with_project(job.project)
        .with_branch(job.branch)
        .with_revision(job.revision);
    if let Some(patch) = job.patch {
        stamp = stamp.with_patch(patch);
    }

    let mut reason = "'try' job".to_string();
    if let Some(who) = &job.who {
        reason.push_str(&format!(" by user {who}"));
    }
    if let Some(comment) = &job.comment {
        reason.push_str(&format!(" ({comment})"));
    }

    let mut submission = base
        .submission(base.complete_stamps(vec![stamp]), reason, Some(&job.properties))
        .with_external_idstring(job.jobid);
    submission.builder_names = builders;
    Ok(submission)
}

async fn submit_job(base: &BaseConfig, ctx: &SchedulerContext, job: TryJob) -> Result<BuildSetCreated> {
    let jobid = job.jobid.clone();
    let submission = try_submission(base, job)?;
    let created = ctx.submitter.submit(submission).await?;
    info!(scheduler = %base.name, jobid = %jobid, bsid = %created.buildset_id, "Try job submitted");
    Ok(created)
}

/// Accepts try jobs dropped into a maildir-style directory. Jobs are moved
/// from `new/` to `cur/` before they are parsed.
pub struct TryJobdirScheduler {
    base: BaseConfig,
    jobdir: PathBuf,
    poll_interval: Duration,
    next_poll: Option<DateTime<Utc>>,
}

impl TryJobdirScheduler {
    pub fn new(base: BaseConfig, jobdir: impl Into<PathBuf>) -> Self {
        Self {
            base,
            jobdir: jobdir.into(),
            poll_interval: Duration::seconds(5),
            next_poll: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn jobdir(&self) -> &Path {
        &self.jobdir
    }

    /// Claim every file in `new/` and return the claimed paths in name order.
    async fn take_new_jobs(&self) -> Result<Vec<PathBuf>> {
        let new_dir = self.jobdir.join("new");
        let cur_dir = self.jobdir.join("cur");
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&new_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name());
            }
        }
        names.sort();

        let mut claimed = Vec::with_capacity(names.len());
        for name in names {
            let target = cur_dir.join(&name);
            match tokio::fs::rename(new_dir.join(&name), &target).await {
                Ok(()) => claimed.push(target),
                // Another poller got there first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(claimed)
    }

    pub async fn poll(&mut self, ctx: &SchedulerContext) -> Result<usize> {
        let mut submitted = 0;
        for path in self.take_new_jobs().await? {
            let job = match tokio::fs::read(&path).await.map_err(Error::from).and_then(|data| parse_job(&data)) {
                Ok(job) => job,
                Err(e) => {
                    warn!(scheduler = %self.base.name, path = %path.display(), error = %e, "Dropping malformed try job");
                    continue;
                }
            };
            match submit_job(&self.base, ctx, job).await {
                Ok(_) => submitted += 1,
                Err(e @ (Error::BuilderNotAllowed { .. } | Error::InvalidInput(_))) => {
                    warn!(scheduler = %self.base.name, path = %path.display(), error = %e, "Rejected try job");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(submitted)
    }
}

#[async_trait]
impl Scheduler for TryJobdirScheduler {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::TryJobdir
    }

    async fn activate(
        &mut self,
        _ctx: &SchedulerContext,
        _state: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for sub in ["new", "cur", "tmp"] {
            tokio::fs::create_dir_all(self.jobdir.join(sub)).await?;
        }
        self.next_poll = Some(now);
        Ok(())
    }

    fn export_state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.next_poll
    }

    async fn on_timer(&mut self, ctx: &SchedulerContext, now: DateTime<Utc>) -> Result<()> {
        if self.next_poll.is_some_and(|t| t > now) {
            return Ok(());
        }
        self.next_poll = Some(now + self.poll_interval);
        self.poll(ctx).await?;
        Ok(())
    }

    async fn submit_try(
        &mut self,
        ctx: &SchedulerContext,
        job: TryJob,
        _credentials: Option<TryCredentials>,
    ) -> Result<BuildSetCreated> {
        submit_job(&self.base, ctx, job).await
    }
}

/// Accepts try jobs over an authenticated RPC.
pub struct TryUserpassScheduler {
    base: BaseConfig,
    userpass: Vec<(String, String)>,
}

impl TryUserpassScheduler {
    pub fn new(base: BaseConfig, userpass: Vec<(String, String)>) -> Self {
        Self { base, userpass }
    }

    fn authenticate(&self, credentials: Option<&TryCredentials>) -> Result<()> {
        let Some(creds) = credentials else {
            return Err(Error::AuthenticationFailed("anonymous".into()));
        };
        let known = self
            .userpass
            .iter()
            .any(|(user, pass)| *user == creds.username && *pass == creds.password);
        if known {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed(creds.username.clone()))
        }
    }
}

#[async_trait]
impl Scheduler for TryUserpassScheduler {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::TryUserpass
    }

    async fn activate(
        &mut self,
        _ctx: &SchedulerContext,
        _state: Option<serde_json::Value>,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }

    fn export_state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn submit_try(
        &mut self,
        ctx: &SchedulerContext,
        mut job: TryJob,
        credentials: Option<TryCredentials>,
    ) -> Result<BuildSetCreated> {
        self.authenticate(credentials.as_ref())?;
        if job.who.is_none() {
            job.who = credentials.map(|c| c.username);
        }
        submit_job(&self.base, ctx, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::jobfile::encode_job;
    use crate::schedulers::testing::Harness;
    use bosun_core::properties::Properties;
    use bosun_core::sourcestamp::Patch;

    fn base() -> BaseConfig {
        BaseConfig::new("try", vec!["b1".into(), "b2".into()])
    }

    fn creds(user: &str, pass: &str) -> Option<TryCredentials> {
        Some(TryCredentials {
            username: user.into(),
            password: pass.into(),
        })
    }

    fn job(builders: &[&str]) -> TryJob {
        TryJob {
            jobid: "job-1".into(),
            branch: Some("main".into()),
            patch: Some(Patch {
                level: 1,
                body: "diff".into(),
                subdir: None,
            }),
            builder_names: builders.iter().map(|b| b.to_string()).collect(),
            properties: Properties::new().with("x", 1, "Try job"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_userpass_submits_to_requested_builders() {
        let h = Harness::new();
        let mut s = TryUserpassScheduler::new(base(), vec![("alice".into(), "pw".into())]);
        s.activate(&h.ctx, None, Utc::now()).await.unwrap();

        let created = s
            .submit_try(&h.ctx, job(&["b2"]), creds("alice", "pw"))
            .await
            .unwrap();
        assert_eq!(created.requests.len(), 1);
        let set = &h.buildsets().await[0];
        assert_eq!(set.builder_names, vec!["b2".to_string()]);
        assert_eq!(set.external_idstring.as_deref(), Some("job-1"));
        assert_eq!(set.reason, "'try' job by user alice");
        assert!(set.sourcestamps[0].patch.is_some());
        assert_eq!(set.properties.get("x"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_userpass_rejects_bad_credentials() {
        let h = Harness::new();
        let mut s = TryUserpassScheduler::new(base(), vec![("alice".into(), "pw".into())]);
        let err = s
            .submit_try(&h.ctx, job(&[]), creds("alice", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
        let err = s.submit_try(&h.ctx, job(&[]), None).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert!(h.buildsets().await.is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_builder_rejects_whole_job() {
        let h = Harness::new();
        let mut s = TryUserpassScheduler::new(base(), vec![("alice".into(), "pw".into())]);
        let err = s
            .submit_try(&h.ctx, job(&["b1", "secret"]), creds("alice", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuilderNotAllowed { ref builder, .. } if builder == "secret"));
        assert!(h.buildsets().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_builders_means_all_allowed() {
        let h = Harness::new();
        let mut s = TryUserpassScheduler::new(base(), vec![("alice".into(), "pw".into())]);
        let created = s
            .submit_try(&h.ctx, job(&[]), creds("alice", "pw"))
            .await
            .unwrap();
        assert_eq!(created.requests.len(), 2);
    }

    #[tokio::test]
    async fn test_jobdir_picks_up_jobs_and_drops_malformed() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let mut s = TryJobdirScheduler::new(base(), dir.path());
        s.activate(&h.ctx, None, Utc::now()).await.unwrap();

        std::fs::write(dir.path().join("new/01-good"), encode_job(&job(&["b1"])).unwrap()).unwrap();
        std::fs::write(dir.path().join("new/02-bad"), b"garbage").unwrap();
        std::fs::write(dir.path().join("new/03-denied"), encode_job(&job(&["nope"])).unwrap())
            .unwrap();

        let submitted = s.poll(&h.ctx).await.unwrap();
        assert_eq!(submitted, 1);
        assert_eq!(h.buildsets().await.len(), 1);
        assert_eq!(std::fs::read_dir(dir.path().join("new")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("cur")).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_jobdir_polls_on_timer() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut s = TryJobdirScheduler::new(base(), dir.path());
        s.activate(&h.ctx, None, now).await.unwrap();
        std::fs::write(dir.path().join("new/job"), encode_job(&job(&[])).unwrap()).unwrap();

        s.on_timer(&h.ctx, now).await.unwrap();
        assert_eq!(h.buildsets().await.len(), 1);
        assert_eq!(s.next_wakeup(), Some(now + Duration::seconds(5)));
    }
}
