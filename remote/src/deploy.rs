//! Copying the running executable to worker hosts
//!
//! The binary is piped base64-encoded through `sh` on the remote side, moved into place
//! atomically and then compared against its local SHA-256 digest.

use anyhow::{Context, bail};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Where the executable is placed on worker hosts
pub const REMOTE_PATH: &str = "/tmp/osync";

/// Deploy the executable at `local_path` to `host` and return its remote path.
pub async fn deploy_binary(
    session: &Arc<openssh::Session>,
    local_path: &std::path::Path,
    host: &str,
) -> anyhow::Result<String> {
    let binary = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("cannot read {}", local_path.display()))?;
    let digest = hex::encode(Sha256::digest(&binary));
    tracing::info!(
        "deploying {} ({}, sha256 {}) to {}:{}",
        local_path.display(),
        bytesize::ByteSize(binary.len() as u64),
        digest,
        host,
        REMOTE_PATH
    );
    let encoded = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&binary)
    };
    run_shell(session, &install_command(REMOTE_PATH), Some(encoded.as_bytes()))
        .await
        .with_context(|| format!("failed to copy the executable to {host}:{REMOTE_PATH}"))?;
    let output = run_shell(session, &checksum_command(REMOTE_PATH), None)
        .await
        .with_context(|| format!("failed to checksum {host}:{REMOTE_PATH}"))?;
    let remote = parse_sha256sum(&output)?;
    if remote != digest {
        bail!("checksum mismatch on {host}:{REMOTE_PATH}: expected {digest}, got {remote}");
    }
    tracing::debug!("{}:{} verified", host, REMOTE_PATH);
    Ok(REMOTE_PATH.to_string())
}

/// Decode stdin into a temporary file next to `path`, make it executable and rename it over `path`.
fn install_command(path: &str) -> String {
    // $$ is left outside the quotes so concurrent deployments use separate files
    let tmp = format!("{}$$", crate::shell_escape(&format!("{path}.tmp.")));
    let path = crate::shell_escape(path);
    format!("base64 -d > {tmp} && chmod 700 {tmp} && mv -f {tmp} {path}")
}

fn checksum_command(path: &str) -> String {
    format!("sha256sum {}", crate::shell_escape(path))
}

/// First field of `sha256sum` output
fn parse_sha256sum(output: &str) -> anyhow::Result<String> {
    match output.split_whitespace().next() {
        Some(digest) if digest.len() == 64 => Ok(digest.to_ascii_lowercase()),
        _ => bail!("unexpected sha256sum output: {output:?}"),
    }
}

/// Run `command` with `sh -c`, optionally feeding `input` on stdin, and return its stdout.
async fn run_shell(
    session: &Arc<openssh::Session>,
    command: &str,
    input: Option<&[u8]>,
) -> anyhow::Result<String> {
    tracing::debug!("running remote command: {}", command);
    let mut child = session
        .command("sh")
        .arg("-c")
        .arg(command)
        .stdin(openssh::Stdio::piped())
        .stdout(openssh::Stdio::piped())
        .stderr(openssh::Stdio::piped())
        .spawn()
        .await
        .context("failed to spawn remote command")?;
    let mut stdin = child.stdin().take().context("remote stdin unavailable")?;
    let mut stdout = child.stdout().take().context("remote stdout unavailable")?;
    let mut stderr = child.stderr().take().context("remote stderr unavailable")?;
    let feed = async move {
        if let Some(input) = input {
            stdin.write_all(input).await?;
        }
        // the remote side finishes only after EOF
        stdin.shutdown().await
    };
    let mut out = Vec::new();
    let mut err = Vec::new();
    let (fed, read_out, read_err) = tokio::join!(
        feed,
        stdout.read_to_end(&mut out),
        stderr.read_to_end(&mut err)
    );
    fed.context("failed to write to remote stdin")?;
    read_out.context("failed to read remote stdout")?;
    read_err.context("failed to read remote stderr")?;
    let status = child.wait().await.context("remote command did not finish")?;
    if !status.success() {
        bail!(
            "`{}` exited with {:?}: {}",
            command,
            status.code(),
            String::from_utf8_lossy(&err).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_goes_through_a_temporary_file() {
        assert_eq!(
            install_command("/tmp/osync"),
            "base64 -d > '/tmp/osync.tmp.'$$ && chmod 700 '/tmp/osync.tmp.'$$ && \
             mv -f '/tmp/osync.tmp.'$$ '/tmp/osync'"
        );
        assert_eq!(
            install_command("/tmp/it's"),
            "base64 -d > '/tmp/it'\\''s.tmp.'$$ && chmod 700 '/tmp/it'\\''s.tmp.'$$ && \
             mv -f '/tmp/it'\\''s.tmp.'$$ '/tmp/it'\\''s'"
        );
    }

    #[test]
    fn sha256sum_output() {
        let digest = hex::encode(Sha256::digest(b"hello world"));
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let output = format!("{}  /tmp/osync\n", digest.to_uppercase());
        assert_eq!(parse_sha256sum(&output).unwrap(), digest);
        assert!(parse_sha256sum("").is_err());
        assert!(parse_sha256sum("sha256sum: /tmp/osync: No such file").is_err());
    }

    #[test]
    fn checksum_is_quoted() {
        assert_eq!(checksum_command("/tmp/a b"), "sha256sum '/tmp/a b'");
    }
}
