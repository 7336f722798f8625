use std::future::Future;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn iptables_bin(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    fn restore_bin(self) -> &'static str {
        match self {
            Family::V4 => "iptables-restore",
            Family::V6 => "ip6tables-restore",
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to run {0}: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error("{0} exited with {1}")]
    ExitStatus(&'static str, ExitStatus),
}

/// Narrow capability interface over the rule-table backend, so tests can
/// inject an in-memory fake instead of shelling out.
pub trait IpTablesBackend: Send + Sync {
    fn ensure_chain(
        &self,
        family: Family,
        table: &str,
        chain: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn ensure_jump(
        &self,
        family: Family,
        table: &str,
        parent_chain: &str,
        jump_args: &[&str],
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn restore(
        &self,
        family: Family,
        buffer: String,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Production backend: shells out to `iptables`/`ip6tables` for the
/// idempotent ensure-chain/ensure-jump steps, then `iptables-restore` (with
/// `--noflush`, since the restore buffer itself flushes only our chain) for
/// the atomic rule replacement.
#[derive(Clone, Copy, Default)]
pub struct ShellBackend;

impl IpTablesBackend for ShellBackend {
    async fn ensure_chain(
        &self,
        family: Family,
        table: &str,
        chain: &str,
    ) -> Result<(), BackendError> {
        let bin = family.iptables_bin();
        let status = Command::new(bin)
            .args(["-t", table, "-N", chain])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| BackendError::Spawn(bin, e))?;
        // exit code 1: chain already exists, which is the common case.
        if status.success() || status.code() == Some(1) {
            Ok(())
        } else {
            Err(BackendError::ExitStatus(bin, status))
        }
    }

    async fn ensure_jump(
        &self,
        family: Family,
        table: &str,
        parent_chain: &str,
        jump_args: &[&str],
    ) -> Result<(), BackendError> {
        let bin = family.iptables_bin();
        let exists = Command::new(bin)
            .args(["-t", table, "-C", parent_chain])
            .args(jump_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| BackendError::Spawn(bin, e))?
            .success();
        if exists {
            return Ok(());
        }
        let status = Command::new(bin)
            .args(["-t", table, "-A", parent_chain])
            .args(jump_args)
            .status()
            .await
            .map_err(|e| BackendError::Spawn(bin, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(BackendError::ExitStatus(bin, status))
        }
    }

    async fn restore(&self, family: Family, buffer: String) -> Result<(), BackendError> {
        let bin = family.restore_bin();
        let mut child = Command::new(bin)
            .arg("--noflush")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BackendError::Spawn(bin, e))?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(buffer.as_bytes())
            .await
            .map_err(|e| BackendError::Spawn(bin, e))?;
        let status = child
            .wait()
            .await
            .map_err(|e| BackendError::Spawn(bin, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(BackendError::ExitStatus(bin, status))
        }
    }
}
