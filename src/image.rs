//! Image publisher
//!
//! Packages a build context, builds it under the scenario's single image
//! reference and pushes that same reference. Both response streams are scanned
//! record by record: the daemon can finish a request successfully at the
//! transport level while reporting a failed build in-band, so the first record
//! carrying an error aborts the publish and later records are never read.
//!
//! Failures are tagged with a [`PublishStage`] so callers can tell a broken
//! build context from a rejected build request, a failing `RUN` step, an
//! unreachable registry and a refused push.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::ImageRef;
use crate::error::PublishStage;
use crate::generator::BUILD_DESCRIPTOR;
use crate::{Error, Result};

/// Nested error detail of a progress record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error message
    #[serde(default)]
    pub message: Option<String>,
}

/// One record of a build or push response stream.
///
/// Records without an error are informational.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressLine {
    /// Short error string
    #[serde(default)]
    pub error: Option<String>,
    /// Structured error detail
    #[serde(default)]
    pub error_detail: Option<ErrorDetail>,
    /// Build output
    #[serde(default)]
    pub stream: Option<String>,
    /// Status text (pull/push progress)
    #[serde(default)]
    pub status: Option<String>,
}

impl ProgressLine {
    /// Decode one newline-delimited JSON record
    pub fn parse(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// An in-band error record
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error: Some(message.clone()),
            error_detail: Some(ErrorDetail {
                message: Some(message),
            }),
            ..Default::default()
        }
    }

    /// The record's error message, if it reports one.
    ///
    /// Only a non-empty `error` marks a failed record. Its text comes from
    /// `errorDetail.message` when that is set, since it is the untruncated form.
    pub fn error_message(&self) -> Option<&str> {
        let error = non_empty(&self.error)?;
        Some(
            self.error_detail
                .as_ref()
                .and_then(|d| non_empty(&d.message))
                .unwrap_or(error),
        )
    }

    fn text(&self) -> Option<&str> {
        self.stream
            .as_deref()
            .or(self.status.as_deref())
            .map(str::trim_end)
            .filter(|s| !s.is_empty())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|m| !m.trim().is_empty())
}

/// Progress records as produced by a backend; `Err` is a transport failure.
pub type ProgressStream = BoxStream<'static, Result<ProgressLine>>;

/// Build and push backend.
///
/// Both calls return immediately; request failures surface as the first
/// stream item.
#[cfg_attr(test, automock)]
pub trait ImageBackend: Send + Sync {
    /// Build `context` (a tar archive) with `descriptor` and tag it as `image`
    fn build(&self, context: Bytes, descriptor: &str, image: &ImageRef) -> ProgressStream;

    /// Push `image` to its registry
    fn push(&self, image: &ImageRef) -> ProgressStream;
}

/// What a successful publish did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Reference that was built and pushed
    pub image: String,
    /// Size of the build context archive in bytes
    pub context_bytes: usize,
    /// Records read from the build stream
    pub build_records: usize,
    /// Records read from the push stream
    pub push_records: usize,
}

/// Tar `dir` (which must contain the build descriptor) into memory.
pub async fn archive_context(dir: &Path) -> Result<Bytes> {
    if !dir.join(BUILD_DESCRIPTOR).is_file() {
        return Err(Error::setup(
            "archive build context",
            format!("{} has no {}", dir.display(), BUILD_DESCRIPTOR),
        ));
    }

    let dir: PathBuf = dir.to_path_buf();
    let archive = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &dir)?;
        builder.into_inner()
    })
    .await
    .map_err(|e| Error::setup("archive build context", e.to_string()))??;

    Ok(Bytes::from(archive))
}

/// Drain `stream`, failing on the first in-band error record.
///
/// A transport failure before any record means the request itself was
/// rejected and is reported as `start_stage`; afterwards it belongs to `stage`.
pub async fn scan_progress(
    mut stream: ProgressStream,
    start_stage: PublishStage,
    stage: PublishStage,
    image: &ImageRef,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut records = 0usize;
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = cancel.cancelled() => return Err(Error::cancelled(stage.to_string())),
        };
        let Some(item) = item else {
            return Ok(records);
        };

        match item {
            Ok(line) => {
                records += 1;
                if let Some(message) = line.error_message() {
                    warn!(image = %image, stage = %stage, error = %message, "in-band error record");
                    return Err(Error::publish(stage, image.to_string(), message));
                }
                if let Some(text) = line.text() {
                    debug!(stage = %stage, "{}", text);
                }
            }
            Err(e) => {
                let failed = if records == 0 { start_stage } else { stage };
                warn!(image = %image, stage = %failed, error = %e, "progress stream failed");
                return Err(Error::publish(failed, image.to_string(), e.to_string()));
            }
        }
    }
}

/// Build `context_dir` as `image` and push it.
///
/// On success the image is present in the registry under exactly `image`.
#[instrument(skip(backend, cancel), fields(image = %image, context = %context_dir.display()))]
pub async fn build_and_push(
    backend: &dyn ImageBackend,
    image: &ImageRef,
    context_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PublishReport> {
    let context = archive_context(context_dir)
        .await
        .map_err(|e| Error::publish(PublishStage::Archive, image.to_string(), e.to_string()))?;
    let context_bytes = context.len();
    info!(bytes = context_bytes, "building image");

    let build_records = scan_progress(
        backend.build(context, BUILD_DESCRIPTOR, image),
        PublishStage::BuildStart,
        PublishStage::Build,
        image,
        cancel,
    )
    .await?;
    info!(records = build_records, "image built, pushing");

    let push_records = scan_progress(
        backend.push(image),
        PublishStage::PushStart,
        PublishStage::Push,
        image,
        cancel,
    )
    .await?;
    info!(records = push_records, "image pushed");

    Ok(PublishReport {
        image: image.to_string(),
        context_bytes,
        build_records,
        push_records,
    })
}
