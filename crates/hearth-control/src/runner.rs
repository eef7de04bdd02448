//! Configuration-management runner.
//!
//! Output is streamed into the job log line by line while the playbook runs.
//! On timeout the whole process group gets SIGTERM, then SIGKILL after a grace
//! period.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
};

use crate::{config::RunnerConfig, joblog::JobLog};

#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub playbook: String,
    /// Inventory host, usually the instance's internal address.
    pub host: String,
    pub vars: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl RunOutcome {
    /// Human-readable failure cause, `None` on success.
    pub fn failure(&self, playbook: &str) -> Option<String> {
        if self.success {
            return None;
        }
        Some(if self.timed_out {
            format!("playbook {playbook} timed out")
        } else {
            match self.exit_code {
                Some(code) => format!("playbook {playbook} exited with code {code}"),
                None => format!("playbook {playbook} was terminated by a signal"),
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("write extra vars: {0}")]
    Vars(#[source] std::io::Error),
    #[error("spawn {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("wait for playbook: {0}")]
    Wait(#[source] std::io::Error),
}

#[async_trait::async_trait]
pub trait PlaybookRunner: Send + Sync {
    async fn run(&self, req: &RunRequest, log: &JobLog) -> Result<RunOutcome, RunError>;
}

pub struct AnsibleRunner {
    cfg: RunnerConfig,
}

impl AnsibleRunner {
    pub fn new(cfg: RunnerConfig) -> Self {
        Self { cfg }
    }

    fn resolve(&self, playbook: &str) -> PathBuf {
        let p = PathBuf::from(playbook);
        if p.is_absolute() {
            p
        } else {
            self.cfg.playbook_dir.join(p)
        }
    }

    fn command(&self, playbook: &Path, host: &str, vars_path: &Path) -> Command {
        let mut cmd = Command::new(&self.cfg.ansible_bin);
        cmd.arg(playbook)
            .arg("-i")
            .arg(format!("{host},"))
            .arg("--extra-vars")
            .arg(format!("@{}", vars_path.display()));
        if let Some(user) = &self.cfg.remote_user {
            cmd.arg("--user").arg(user);
        }
        if let Some(key) = &self.cfg.private_key {
            cmd.arg("--private-key").arg(key);
        }
        cmd.env("ANSIBLE_NOCOLOR", "1")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd
    }
}

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, sig: libc::c_int) {
    if let Some(pgid) = pgid {
        unsafe {
            libc::kill(-pgid, sig);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<i32>, _sig: i32) {}

#[cfg(unix)]
const SIGTERM: libc::c_int = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: libc::c_int = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// The extra-vars file can carry secrets, so only the owner may read it.
async fn write_private(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut file = opts.open(path).await?;
    file.write_all(body).await?;
    file.flush().await
}

/// Forwards one output stream into the job log. Invalid UTF-8 is replaced
/// rather than ending the stream.
async fn pump_lines<R>(stream: R, tag: &'static str, log: JobLog)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                log.emit(format!("[{tag}] {line}")).await;
            }
            Err(err) => {
                tracing::warn!(job_id = %log.job_id(), stream = tag, %err, "failed to read playbook output");
                break;
            }
        }
    }
}

#[async_trait::async_trait]
impl PlaybookRunner for AnsibleRunner {
    async fn run(&self, req: &RunRequest, log: &JobLog) -> Result<RunOutcome, RunError> {
        let playbook = self.resolve(&req.playbook);
        let vars_path =
            std::env::temp_dir().join(format!("hearth-vars-{}.json", uuid::Uuid::new_v4()));
        let body = serde_json::to_vec(&req.vars)
            .map_err(|e| RunError::Vars(std::io::Error::other(e)))?;
        write_private(&vars_path, &body)
            .await
            .map_err(RunError::Vars)?;

        let result = self.run_inner(&playbook, &req.host, &vars_path, log).await;
        if let Err(err) = tokio::fs::remove_file(&vars_path).await {
            tracing::warn!(path = %vars_path.display(), %err, "failed to remove extra vars file");
        }
        result
    }
}

impl AnsibleRunner {
    async fn run_inner(
        &self,
        playbook: &Path,
        host: &str,
        vars_path: &Path,
        log: &JobLog,
    ) -> Result<RunOutcome, RunError> {
        log.emit(format!(
            "[hearth] running {} against {host}",
            playbook.display()
        ))
        .await;
        tracing::info!(job_id = %log.job_id(), playbook = %playbook.display(), host, "starting playbook");

        let mut child = self
            .command(playbook, host, vars_path)
            .spawn()
            .map_err(|source| RunError::Spawn {
                bin: self.cfg.ansible_bin.clone(),
                source,
            })?;
        let pgid = child.id().map(|p| p as i32);

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(out, "stdout", log.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(err, "stderr", log.clone())));
        }

        let mut timed_out = false;
        let status = match tokio::time::timeout(self.cfg.timeout, child.wait()).await {
            Ok(status) => status.map_err(RunError::Wait)?,
            Err(_) => {
                timed_out = true;
                signal_group(pgid, SIGTERM);
                log.emit(format!(
                    "[hearth] timed out after {}s, sent SIGTERM",
                    self.cfg.timeout.as_secs()
                ))
                .await;
                match tokio::time::timeout(self.cfg.kill_grace, child.wait()).await {
                    Ok(status) => status.map_err(RunError::Wait)?,
                    Err(_) => {
                        signal_group(pgid, SIGKILL);
                        log.emit("[hearth] sent SIGKILL").await;
                        child.wait().await.map_err(RunError::Wait)?
                    }
                }
            }
        };

        // A daemonized grandchild may keep the pipes open; do not wait on it forever.
        for reader in readers {
            let _ = tokio::time::timeout(Duration::from_secs(5), reader).await;
        }

        let outcome = RunOutcome {
            success: status.success() && !timed_out,
            exit_code: status.code(),
            timed_out,
        };
        tracing::info!(
            job_id = %log.job_id(),
            playbook = %playbook.display(),
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            timed_out,
            "playbook finished"
        );
        Ok(outcome)
    }
}
