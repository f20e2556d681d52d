//! Streaming HTTP download used by the install coordinator.
//!
//! Issues the request, then loops pulling chunks until the stream ends.
//! Chunks are written straight to disk here rather than buffered in
//! memory, since archives run into the hundreds of megabytes.

use std::path::Path;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::InstallError;

/// Called with `(downloaded_bytes, total_bytes)` as each chunk arrives.
pub type DownloadProgressFn<'a> = dyn FnMut(u64, Option<u64>) + Send + 'a;

/// Downloads `url` into `dest_path`, creating or truncating it, calling
/// `on_progress` after every chunk.
///
/// Polls `cancel` between chunks. On cancellation the partially written file
/// is left at `dest_path` for the caller to remove along with the rest of
/// the staging directory.
pub async fn download(
    client: &reqwest::Client,
    url: &str,
    dest_path: &Path,
    cancel: &CancellationToken,
    on_progress: &mut DownloadProgressFn<'_>,
) -> Result<(), InstallError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(InstallError::Protocol(format![
            "{url} returned {}",
            response.status()
        ]));
    }
    let total = response
        .content_length()
        .ok_or_else(|| InstallError::Protocol(format!["{url} did not report Content-Length"]))?;
    let total = Some(total);

    let mut file = tokio::fs::File::create(dest_path).await?;
    let mut stream = response.bytes_stream();
    let mut downloaded = 0u64;

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        on_progress(downloaded, total);
    }

    file.flush().await?;
    Ok(())
}
