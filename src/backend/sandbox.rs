//! Per-submission working directories shared by the process-based backends.
//!
//! Each submission gets `<root>/<job>-<uuid>/` holding a `job.sh` wrapper. The
//! wrapper runs the payload, captures its output and finally writes
//! `job.info` with the payload's exit code, which is what output validation
//! reads after retrieval.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::task::Task;

pub const SCRIPT_NAME: &str = "job.sh";
pub const INFO_NAME: &str = "job.info";
pub const STDOUT_NAME: &str = "job.stdout";
pub const STDERR_NAME: &str = "job.stderr";

/// Parsed `job.info` of a finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobInfo {
    pub exit_code: Option<i32>,
    pub values: BTreeMap<String, String>,
}

impl JobInfo {
    pub fn parse(text: &str) -> Self {
        let values: BTreeMap<String, String> = text
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let exit_code = values.get("EXITCODE").and_then(|v| v.parse().ok());
        Self { exit_code, values }
    }
}

/// Read `job.info` from an output directory; `None` if absent or unreadable.
pub async fn read_job_info(dir: &Path) -> Option<JobInfo> {
    let text = tokio::fs::read_to_string(dir.join(INFO_NAME)).await.ok()?;
    Some(JobInfo::parse(&text))
}

/// A sandbox created for one submission.
#[derive(Debug, Clone)]
pub struct PreparedSandbox {
    pub name: String,
    pub dir: PathBuf,
    pub script: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn create_root(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Create the directory and wrapper script for one submission of `job`.
    pub async fn prepare(&self, job: u32, task: &dyn Task) -> std::io::Result<PreparedSandbox> {
        let name = format!("{}-{}", job, Uuid::new_v4().simple());
        let dir = self.dir(&name);
        tokio::fs::create_dir_all(&dir).await?;
        let script = dir.join(SCRIPT_NAME);
        let body = match render_script(&dir, job, task) {
            Ok(body) => body,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };
        tokio::fs::write(&script, body).await?;
        Ok(PreparedSandbox { name, dir, script })
    }

    pub async fn remove(&self, name: &str) {
        if let Err(e) = tokio::fs::remove_dir_all(self.dir(name)).await {
            tracing::debug!(sandbox = name, error = %e, "Could not remove sandbox");
        }
    }

    /// Backend-local id encoding the native id and the sandbox name.
    pub fn local_id(native: &str, sandbox: &str) -> String {
        format!("{}.{}", native, sandbox)
    }

    /// Split a local id into `(native, sandbox)`.
    pub fn split_local_id(local: &str) -> Option<(&str, &str)> {
        local
            .split_once('.')
            .filter(|(native, name)| !native.is_empty() && !name.is_empty())
    }
}

pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn render_script(dir: &Path, job: u32, task: &dyn Task) -> std::io::Result<String> {
    let cmd = task.command(job);
    // Batch systems may run a spooled copy of the script, so cd explicitly.
    let mut script = format!(
        "#!/bin/sh\ncd {} || exit 107\n",
        shell_quote(&dir.to_string_lossy())
    );
    script.push_str(&format!("export GC_JOB_ID={}\n", job));
    script.push_str(&format!("export GC_TASK_ID={}\n", shell_quote(task.task_id())));
    for (key, value) in &cmd.env {
        if !is_env_name(key) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid environment variable name {:?}", key),
            ));
        }
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    let mut line = shell_quote(&cmd.executable);
    for arg in &cmd.arguments {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    script.push_str(&format!("{} > {} 2> {}\n", line, STDOUT_NAME, STDERR_NAME));
    script.push_str(&format!("echo \"EXITCODE=$?\" > {}.tmp\n", INFO_NAME));
    script.push_str(&format!("mv {0}.tmp {0}\n", INFO_NAME));
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StaticTask;

    #[test]
    fn job_info_parses_exit_code() {
        let info = JobInfo::parse("EXITCODE=0\nHOST=node17\n");
        assert_eq!(info.exit_code, Some(0));
        assert_eq!(info.values["HOST"], "node17");

        assert_eq!(JobInfo::parse("EXITCODE=abc").exit_code, None);
        assert_eq!(JobInfo::parse("").exit_code, None);
    }

    #[test]
    fn local_id_round_trip() {
        let local = Sandbox::local_id("4242", "3-abcdef");
        assert_eq!(Sandbox::split_local_id(&local), Some(("4242", "3-abcdef")));
        assert_eq!(Sandbox::split_local_id("4242"), None);
    }

    #[test]
    fn script_quotes_arguments() {
        let task = StaticTask::new(1, "/bin/echo")
            .with_arguments(vec!["it's".to_string(), "@JOB@".to_string()]);
        let script = render_script(Path::new("/work/0-x"), 0, &task).unwrap();
        assert!(script.contains("cd '/work/0-x' || exit 107"));
        assert!(script.contains("'/bin/echo' 'it'\\''s' '0' > job.stdout 2> job.stderr"));
        assert!(script.contains("export GC_JOB_ID=0"));
    }

    #[test]
    fn env_names_are_validated() {
        assert!(is_env_name("GC_OUT"));
        assert!(is_env_name("_x1"));
        assert!(!is_env_name(""));
        assert!(!is_env_name("1X"));
        assert!(!is_env_name("A;rm -rf ."));

        let mut task = StaticTask::new(1, "/bin/true");
        task.env.insert("OK_NAME".to_string(), "a b".to_string());
        let script = render_script(Path::new("/w"), 0, &task).unwrap();
        assert!(script.contains("export OK_NAME='a b'"));

        task.env.insert("BAD NAME".to_string(), "x".to_string());
        let err = render_script(Path::new("/w"), 0, &task).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn invalid_env_leaves_no_sandbox() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(tmp.path());
        let mut task = StaticTask::new(1, "/bin/true");
        task.env.insert("X=Y".to_string(), "1".to_string());

        assert!(sandbox.prepare(0, &task).await.is_err());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn prepared_script_writes_job_info() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(tmp.path());
        let task = StaticTask::new(1, "sh")
            .with_arguments(vec!["-c".to_string(), "echo out; exit 4".to_string()]);

        let prepared = sandbox.prepare(0, &task).await.unwrap();
        let status = tokio::process::Command::new("sh")
            .arg(&prepared.script)
            .status()
            .await
            .unwrap();
        assert!(status.success());

        let info = read_job_info(&prepared.dir).await.unwrap();
        assert_eq!(info.exit_code, Some(4));
        let stdout = tokio::fs::read_to_string(prepared.dir.join(STDOUT_NAME))
            .await
            .unwrap();
        assert_eq!(stdout, "out\n");
    }
}
