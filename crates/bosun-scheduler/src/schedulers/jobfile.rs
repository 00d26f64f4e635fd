//! Try job files.
//!
//! A job file is a sequence of netstrings (`<len>:<bytes>,`). The first one
//! names the format version. Versions 1 to 4 list positional fields followed
//! by builder names; version 5 carries one JSON object.
//!
//! | version | fields after the version |
//! |---|---|
//! | 1 | jobid, branch, baserev, patch_level, patch_body, builders... |
//! | 2 | as 1, plus repository, project before builders |
//! | 3 | as 2, plus who |
//! | 4 | as 3, plus comment |
//! | 5 | one JSON object |

use super::TryJob;
use bosun_core::properties::Properties;
use bosun_core::sourcestamp::Patch;
use bosun_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Split a buffer into netstrings. Trailing whitespace is allowed.
pub fn parse_netstrings(data: &[u8]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut rest = data;
    loop {
        let trimmed = rest.trim_ascii_start();
        if trimmed.is_empty() {
            return Ok(out);
        }
        rest = trimmed;
        let colon = rest
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| Error::MalformedJob("netstring missing ':'".into()))?;
        let len: usize = std::str::from_utf8(&rest[..colon])
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::MalformedJob("netstring length is not a number".into()))?;
        let body_start = colon + 1;
        let body_end = body_start
            .checked_add(len)
            .filter(|end| *end < rest.len())
            .ok_or_else(|| Error::MalformedJob("netstring is truncated".into()))?;
        if rest[body_end] != b',' {
            return Err(Error::MalformedJob("netstring missing ','".into()));
        }
        let body = std::str::from_utf8(&rest[body_start..body_end])
            .map_err(|_| Error::MalformedJob("netstring is not UTF-8".into()))?;
        out.push(body.to_string());
        rest = &rest[body_end + 1..];
    }
}

fn netstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(format!("{}:", s.len()).as_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(b',');
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JobV5 {
    jobid: String,
    branch: Option<String>,
    baserev: Option<String>,
    patch_level: u32,
    patch_body: String,
    repository: String,
    project: String,
    who: Option<String>,
    comment: Option<String>,
    codebase: String,
    #[serde(rename = "builderNames")]
    builder_names: Vec<String>,
    properties: BTreeMap<String, serde_json::Value>,
}

/// Parse a job file into a [`TryJob`].
pub fn parse_job(data: &[u8]) -> Result<TryJob> {
    let mut fields = parse_netstrings(data)?.into_iter();
    let version = fields
        .next()
        .ok_or_else(|| Error::MalformedJob("empty job file".into()))?;

    if version == "5" {
        let body = fields
            .next()
            .ok_or_else(|| Error::MalformedJob("version 5 job has no body".into()))?;
        let job: JobV5 = serde_json::from_str(&body)
            .map_err(|e| Error::MalformedJob(format!("invalid JSON: {e}")))?;
        if job.jobid.is_empty() {
            return Err(Error::MalformedJob("job has no jobid".into()));
        }
        let patch = (!job.patch_body.is_empty()).then(|| Patch {
            level: job.patch_level,
            body: job.patch_body,
            subdir: None,
        });
        return Ok(TryJob {
            jobid: job.jobid,
            who: job.who,
            comment: job.comment,
            codebase: job.codebase,
            repository: job.repository,
            project: job.project,
            branch: job.branch.and_then(non_empty),
            revision: job.baserev.and_then(non_empty),
            patch,
            builder_names: job.builder_names,
            properties: Properties::from_values(job.properties, "Try job"),
        });
    }

    let positional = match version.as_str() {
        "1" => 5,
        "2" => 7,
        "3" => 8,
        "4" => 9,
        other => return Err(Error::MalformedJob(format!("unknown job version '{other}'"))),
    };
    let head: Vec<String> = fields.by_ref().take(positional).collect();
    if head.len() < positional {
        return Err(Error::MalformedJob(format!(
            "version {version} job needs {positional} fields, found {}",
            head.len()
        )));
    }
    let mut head = head.into_iter();
    let mut next = || head.next().unwrap_or_default();

    let jobid = next();
    let branch = non_empty(next());
    let revision = non_empty(next());
    let level: u32 = next()
        .parse()
        .map_err(|_| Error::MalformedJob("patch level is not a number".into()))?;
    let body = next();
    let (repository, project) = if positional >= 7 { (next(), next()) } else { Default::default() };
    let who = if positional >= 8 { non_empty(next()) } else { None };
    let comment = if positional >= 9 { non_empty(next()) } else { None };

    if jobid.is_empty() {
        return Err(Error::MalformedJob("job has no jobid".into()));
    }

    Ok(TryJob {
        jobid,
        who,
        comment,
        codebase: String::new(),
        repository,
        project,
        branch,
        revision,
        patch: (!body.is_empty()).then(|| Patch {
            level,
            body,
            subdir: None,
        }),
        builder_names: fields.collect(),
        properties: Properties::new(),
    })
}

/// Encode a job as a version 5 job file.
pub fn encode_job(job: &TryJob) -> Result<Vec<u8>> {
    let body = JobV5 {
        jobid: job.jobid.clone(),
        branch: job.branch.clone(),
        baserev: job.revision.clone(),
        patch_level: job.patch.as_ref().map_or(0, |p| p.level),
        patch_body: job.patch.as_ref().map(|p| p.body.clone()).unwrap_or_default(),
        repository: job.repository.clone(),
        project: job.project.clone(),
        who: job.who.clone(),
        comment: job.comment.clone(),
        codebase: job.codebase.clone(),
        builder_names: job.builder_names.clone(),
        properties: job.properties.values(),
    };
    let mut out = Vec::new();
    netstring(&mut out, "5");
    netstring(&mut out, &serde_json::to_string(&body)?);
    Ok(out)
}
