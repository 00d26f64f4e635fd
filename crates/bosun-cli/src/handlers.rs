//! Command handlers.

use crate::client::ApiClient;
use crate::config::CliConfig;
use crate::tryjob;
use anyhow::Context;
use bosun_core::change::NewChange;
use bosun_core::properties::Properties;
use bosun_core::sourcestamp::Patch;
use bosun_scheduler::{MasterConfig, TryJob};
use console::style;
use std::path::{Path, PathBuf};

/// Validate a master configuration.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let config = MasterConfig::from_file(path)?;
    config.validate()?;

    println!(
        "{} Configuration \"{}\" is valid",
        style("✓").green(),
        config.master.name
    );
    println!("  Workers: {}", config.workers.len());
    println!("  Builders: {}", config.builders.len());
    for builder in &config.builders {
        println!("    - {} ({} workers)", builder.name, builder.workers.len());
    }
    println!("  Schedulers: {}", config.schedulers.len());
    for scheduler in &config.schedulers {
        println!(
            "    - {} -> {}",
            scheduler.name(),
            scheduler.common().builder_names.join(", ")
        );
    }
    if !config.canceller.rules.is_empty() {
        println!("  Canceller rules: {}", config.canceller.rules.len());
    }
    Ok(())
}

/// Parse `NAME=VALUE` pairs into try-job properties. Values that parse as
/// JSON keep their type; anything else is a string.
fn parse_properties(raw: &[String]) -> anyhow::Result<Properties> {
    let mut props = Properties::new();
    for entry in raw {
        let (name, value) = entry
            .split_once('=')
            .with_context(|| format!("property '{entry}' is not NAME=VALUE"))?;
        if name.is_empty() {
            anyhow::bail!("property '{entry}' has an empty name");
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        props.set(name, value, "Try job");
    }
    Ok(props)
}

pub struct TryArgs {
    pub jobdir: PathBuf,
    pub builders: Vec<String>,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub diff: Option<PathBuf>,
    pub patchlevel: u32,
    pub who: Option<String>,
    pub comment: Option<String>,
    pub codebase: String,
    pub repository: String,
    pub project: String,
    pub properties: Vec<String>,
}

fn build_try_job(args: TryArgs) -> anyhow::Result<TryJob> {
    let patch = match &args.diff {
        Some(path) => Some(Patch {
            level: args.patchlevel,
            body: std::fs::read_to_string(path)
                .with_context(|| format!("reading diff {}", path.display()))?,
            subdir: None,
        }),
        None => None,
    };

    Ok(TryJob {
        jobid: tryjob::new_jobid(),
        who: args.who,
        comment: args.comment,
        codebase: args.codebase,
        repository: args.repository,
        project: args.project,
        branch: args.branch,
        revision: args.revision,
        patch,
        builder_names: args.builders,
        properties: parse_properties(&args.properties)?,
    })
}

/// Submit a try job through a job directory.
pub fn try_job(args: TryArgs) -> anyhow::Result<()> {
    let jobdir = args.jobdir.clone();
    let job = build_try_job(args)?;
    let path = tryjob::write_job(&jobdir, &job)?;

    println!(
        "{} Queued try job {}",
        style("▶").cyan(),
        style(&job.jobid).bold()
    );
    println!("  {}", style(path.display()).dim());
    Ok(())
}

pub struct ChangeArgs {
    pub master: Option<String>,
    pub who: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub category: Option<String>,
    pub project: String,
    pub repository: String,
    pub codebase: String,
    pub comments: String,
    pub files: Vec<String>,
}

/// Report a change to a running master.
pub async fn sendchange(config: &CliConfig, args: ChangeArgs) -> anyhow::Result<()> {
    let url = args.master.as_deref().unwrap_or(&config.api_url);
    let client = ApiClient::new(url);

    let change = NewChange {
        who: args.who,
        files: args.files,
        comments: args.comments,
        branch: args.branch,
        revision: args.revision,
        category: args.category,
        project: args.project,
        repository: args.repository,
        codebase: args.codebase,
        ..Default::default()
    };
    let recorded = client.add_change(&change).await?;

    println!(
        "{} Change {} recorded",
        style("✓").green(),
        style(recorded.number).bold()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn try_args(jobdir: &Path) -> TryArgs {
        TryArgs {
            jobdir: jobdir.to_path_buf(),
            builders: vec!["b1".into()],
            branch: Some("main".into()),
            revision: None,
            diff: None,
            patchlevel: 1,
            who: Some("dev".into()),
            comment: None,
            codebase: String::new(),
            repository: String::new(),
            project: String::new(),
            properties: vec![],
        }
    }

    #[test]
    fn test_parse_properties() {
        let props = parse_properties(&["n=3".into(), "s=hello".into(), "flag=true".into()]).unwrap();
        assert_eq!(props.get("n"), Some(&serde_json::json!(3)));
        assert_eq!(props.get("s"), Some(&serde_json::json!("hello")));
        assert_eq!(props.get("flag"), Some(&serde_json::json!(true)));
        assert_eq!(props.source("n"), Some("Try job"));
    }

    #[test]
    fn test_parse_properties_rejects_missing_equals() {
        assert!(parse_properties(&["nope".into()]).is_err());
        assert!(parse_properties(&["=x".into()]).is_err());
    }

    #[test]
    fn test_build_try_job_reads_diff() {
        let dir = tempfile::tempdir().unwrap();
        let diff_path = dir.path().join("change.diff");
        let mut f = std::fs::File::create(&diff_path).unwrap();
        writeln!(f, "--- a/x").unwrap();

        let mut args = try_args(dir.path());
        args.diff = Some(diff_path);
        args.patchlevel = 0;
        let job = build_try_job(args).unwrap();

        let patch = job.patch.unwrap();
        assert_eq!(patch.level, 0);
        assert_eq!(patch.body, "--- a/x\n");
        assert_eq!(job.builder_names, vec!["b1".to_string()]);
    }

    #[test]
    fn test_validate_rejects_unknown_builder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bosun.yaml");
        std::fs::write(
            &path,
            r#"
workers:
  - name: w1
builders:
  - name: b1
    workers: [w1]
schedulers:
  - type: triggerable
    name: trig
    builder_names: [nope]
"#,
        )
        .unwrap();
        assert!(validate(&path).is_err());
    }
}
