//! Subprocess plumbing shared by the transports

use std::io::ErrorKind;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::{CommandOutput, TransportError};

/// Run `program` with `args`, optionally feeding `stdin`, and capture output
pub async fn run_process(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
) -> Result<CommandOutput, TransportError> {
    debug!("Running {} ({} args)", program, args.len());
    trace!("{} {:?}", program, args);

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TransportError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            // A child that exits without reading its input closes the pipe
            // early; its exit status decides the outcome
            let written = match pipe.write_all(input.as_bytes()).await {
                Ok(()) => pipe.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!("{} closed stdin before reading all input", program);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let output = child.wait_with_output().await?;

    let result = CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    trace!(
        "{} finished: {:?}, {} bytes stdout, {} bytes stderr",
        program,
        result.status,
        result.stdout.len(),
        result.stderr.len()
    );

    Ok(result)
}

/// Run a helper program whose failure is a transfer error
pub(crate) async fn run_transfer(
    program: &str,
    args: &[String],
    target: &str,
    path: &str,
) -> Result<CommandOutput, TransportError> {
    let output = run_process(program, args, None).await?;
    if !output.success() {
        return Err(TransportError::Transfer {
            target: target.to_string(),
            path: path.to_string(),
            message: format!("{} {}: {}", program, output.status_text(), output.stderr.trim()),
        });
    }
    Ok(output)
}

/// Whether `rsync --itemize-changes` output lists any transferred entry
pub(crate) fn rsync_transferred(stdout: &str) -> bool {
    stdout.lines().any(|line| !line.trim().is_empty())
}
