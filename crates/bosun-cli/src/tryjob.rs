//! Writing try jobs into a scheduler's job directory.

use anyhow::Context;
use bosun_scheduler::schedulers::jobfile::encode_job;
use bosun_scheduler::TryJob;
use std::path::{Path, PathBuf};

/// Write `job` into `jobdir/new`, going through `jobdir/tmp` so a poller
/// never sees a partial file.
pub fn write_job(jobdir: &Path, job: &TryJob) -> anyhow::Result<PathBuf> {
    let data = encode_job(job)?;
    let tmp_dir = jobdir.join("tmp");
    let new_dir = jobdir.join("new");
    std::fs::create_dir_all(&tmp_dir).with_context(|| format!("creating {}", tmp_dir.display()))?;
    std::fs::create_dir_all(&new_dir).with_context(|| format!("creating {}", new_dir.display()))?;

    let file_name = format!("{}.job", job.jobid);
    let tmp_path = tmp_dir.join(&file_name);
    let new_path = new_dir.join(&file_name);
    std::fs::write(&tmp_path, data).with_context(|| format!("writing {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, &new_path)
        .with_context(|| format!("moving job into {}", new_dir.display()))?;
    Ok(new_path)
}

/// A job id unique enough for one submitter: timestamp plus process id.
pub fn new_jobid() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
        std::process::id()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_core::sourcestamp::Patch;
    use bosun_scheduler::schedulers::jobfile::parse_job;

    #[test]
    fn test_write_job_lands_in_new() {
        let dir = tempfile::tempdir().unwrap();
        let job = TryJob {
            jobid: "job-1".into(),
            who: Some("dev".into()),
            branch: Some("main".into()),
            revision: Some("abc123".into()),
            patch: Some(Patch {
                level: 1,
                body: "--- a/x\n+++ b/x\n".into(),
                subdir: None,
            }),
            builder_names: vec!["b1".into()],
            ..Default::default()
        };

        let path = write_job(dir.path(), &job).unwrap();
        assert_eq!(path, dir.path().join("new").join("job-1.job"));
        assert!(std::fs::read_dir(dir.path().join("tmp")).unwrap().next().is_none());

        let parsed = parse_job(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.jobid, "job-1");
        assert_eq!(parsed.branch.as_deref(), Some("main"));
        assert_eq!(parsed.patch.map(|p| p.level), Some(1));
        assert_eq!(parsed.builder_names, vec!["b1".to_string()]);
    }

    #[test]
    fn test_new_jobid_has_pid_suffix() {
        let id = new_jobid();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }
}
