//! Command execution inside instance pods via the Kubernetes exec API
//!
//! Used for operations PostgreSQL cannot perform over a SQL connection,
//! such as placing a standby signal file before a restart.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Errors that can occur during pod exec
#[derive(Error, Debug)]
pub enum ExecError {
    /// Failed to execute command in pod
    #[error("Failed to execute command in pod: {0}")]
    ExecFailed(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// IO error during exec
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for exec operations
pub(crate) type ExecResult<T> = std::result::Result<T, ExecError>;

/// Container running PostgreSQL in every instance pod
pub const POSTGRES_CONTAINER: &str = "postgres";

/// Shell script that turns a running primary into a standby on next start
///
/// `primary_conninfo` must already be set through `ALTER SYSTEM`. Stopping
/// the postmaster ends the container; the kubelet restarts it and PostgreSQL
/// comes back in recovery because of `standby.signal`.
pub const DEMOTE_SCRIPT: &str =
    r#"touch "$PGDATA/standby.signal" && pg_ctl -D "$PGDATA" stop -m fast -w"#;

/// Run the demotion script in an instance pod
pub(crate) async fn exec_demote(pods: &Api<Pod>, pod_name: &str) -> ExecResult<String> {
    debug!(pod = %pod_name, "Writing standby signal and stopping PostgreSQL");
    let command = vec![
        "sh".to_string(),
        "-c".to_string(),
        DEMOTE_SCRIPT.to_string(),
    ];
    exec_command_in_pod(pods, pod_name, command).await
}

/// Execute an arbitrary command in a pod
async fn exec_command_in_pod(
    pods: &Api<Pod>,
    pod_name: &str,
    command: Vec<String>,
) -> ExecResult<String> {
    let attach_params = AttachParams {
        container: Some(POSTGRES_CONTAINER.to_string()),
        stdin: true,
        stdout: true,
        stderr: true,
        tty: false,
        ..Default::default()
    };

    let mut attached = pods.exec(pod_name, command, &attach_params).await?;

    // Close stdin to signal end of input
    if let Some(mut stdin) = attached.stdin() {
        stdin.shutdown().await?;
    }

    let stdout = attached
        .stdout()
        .ok_or_else(|| ExecError::ExecFailed("Failed to get stdout from exec".to_string()))?;

    let stderr = attached
        .stderr()
        .ok_or_else(|| ExecError::ExecFailed("Failed to get stderr from exec".to_string()))?;

    let stdout_output = read_stream(stdout).await?;
    let stderr_output = read_stream(stderr).await?;

    let status = attached.take_status();
    attached
        .join()
        .await
        .map_err(|e| ExecError::ExecFailed(e.to_string()))?;

    if let Some(status) = status
        && let Some(status) = status.await
        && status.status.as_deref() == Some("Failure")
    {
        return Err(ExecError::ExecFailed(format!(
            "{}: {}",
            status.message.unwrap_or_default(),
            stderr_output.trim()
        )));
    }

    Ok(stdout_output)
}

async fn read_stream<R>(mut reader: R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut output = String::new();
    reader.read_to_string(&mut output).await?;
    Ok(output)
}
