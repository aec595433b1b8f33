//! Minimal HTTP/1.1 client over the daemon's Unix socket.
//!
//! The operator subcommands only need a single request/response exchange
//! with `Connection: close`, so a hand-written exchange over a
//! [`UnixStream`] is all there is to it.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context as _};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixStream;

use crate::USER_AGENT;

/// Overall deadline for one request/response exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A parsed response of the daemon.
#[derive(Debug)]
pub struct UdsResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

/// Performs one HTTP/1.1 exchange over the daemon socket.
///
/// # Errors
///
/// Fails when the socket is unreachable, the exchange times out or the
/// response is not parseable HTTP.
pub async fn request(socket: &Path, method: &str, path: &str) -> anyhow::Result<UdsResponse> {
    tokio::time::timeout(REQUEST_TIMEOUT, exchange(socket, method, path))
        .await
        .context("request timed out")?
}

async fn exchange(socket: &Path, method: &str, path: &str) -> anyhow::Result<UdsResponse> {
    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;

    let request = format!(
        "{method} {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: */*\r\n\
         Connection: close\r\n\
         \r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .context("failed to send request")?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .context("failed to read response")?;
    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> anyhow::Result<UdsResponse> {
    let text = String::from_utf8_lossy(raw);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        bail!("malformed response: missing header terminator");
    };

    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        bail!("malformed response: unexpected status line {status_line:?}");
    }
    let status: u16 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("malformed status in line {status_line:?}"))?;

    Ok(UdsResponse {
        status,
        body: body.to_string(),
    })
}

/// Probes a running daemon's health endpoint.
///
/// # Errors
///
/// Fails when the daemon is unreachable or answers anything but 200.
pub async fn healthcheck(socket: &Path, path: &str) -> anyhow::Result<()> {
    let response = request(socket, "GET", path)
        .await
        .context("healthcheck request failed")?;
    if response.status != 200 {
        eprint!("{}", response.body);
        bail!("healthcheck failed with status: {}", response.status);
    }
    Ok(())
}

/// Asks a running daemon to rescan its license folder.
///
/// # Errors
///
/// Fails when the daemon is unreachable or answers anything but 200.
pub async fn reload(socket: &Path) -> anyhow::Result<()> {
    let response = request(socket, "POST", "/reload")
        .await
        .context("reload request failed")?;
    if response.status != 200 {
        eprint!("{}", response.body);
        bail!("reload failed with status: {}", response.status);
    }
    Ok(())
}
