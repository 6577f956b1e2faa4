//! What happens to a snapshot file once it has been classified.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tally_core::{RecognitionOutcome, RecognitionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    /// Leave the file where it is.
    Keep,
    Delete,
    /// Move into the dated archive under the recognized directory.
    Archive,
}

/// Per-outcome file handling. Retention of raw captures is a deployment choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    pub on_match: RouteAction,
    pub on_low_confidence: RouteAction,
    pub on_unknown: RouteAction,
    pub on_no_face: RouteAction,
    pub on_error: RouteAction,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            on_match: RouteAction::Archive,
            on_low_confidence: RouteAction::Keep,
            on_unknown: RouteAction::Keep,
            on_no_face: RouteAction::Delete,
            on_error: RouteAction::Keep,
        }
    }
}

impl RoutingPolicy {
    pub fn action_for(&self, status: RecognitionStatus) -> RouteAction {
        match status {
            RecognitionStatus::Match => self.on_match,
            RecognitionStatus::LowConfidence => self.on_low_confidence,
            RecognitionStatus::Unknown => self.on_unknown,
            RecognitionStatus::NoFace => self.on_no_face,
            RecognitionStatus::Error => self.on_error,
        }
    }
}

/// Where a routed snapshot ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", content = "path", rename_all = "snake_case")]
pub enum Disposition {
    Kept,
    Deleted,
    Archived(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SnapshotRouter {
    policy: RoutingPolicy,
    recognized_dir: PathBuf,
}

impl SnapshotRouter {
    pub fn new(policy: RoutingPolicy, recognized_dir: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            recognized_dir: recognized_dir.into(),
        }
    }

    pub async fn route(
        &self,
        path: &Path,
        outcome: &RecognitionOutcome,
        at: DateTime<Utc>,
    ) -> io::Result<Disposition> {
        match self.policy.action_for(outcome.status()) {
            RouteAction::Keep => Ok(Disposition::Kept),
            RouteAction::Delete => {
                tokio::fs::remove_file(path).await?;
                Ok(Disposition::Deleted)
            }
            RouteAction::Archive => {
                let dir = self.recognized_dir.join(at.format("%Y-%m-%d").to_string());
                tokio::fs::create_dir_all(&dir).await?;
                let target = unique_target(&dir, &archive_name(path, outcome, at)).await;
                move_file(path, &target).await?;
                Ok(Disposition::Archived(target))
            }
        }
    }
}

/// File name for an archived snapshot.
///
/// Matches encode `<id>_<name>_<time>_c<confidence %>`; other outcomes keep
/// the original stem behind their status tag.
pub fn archive_name(path: &Path, outcome: &RecognitionOutcome, at: DateTime<Utc>) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg")
        .to_ascii_lowercase();
    let stamp = at.format("%Y%m%d_%H%M%S");

    match outcome {
        RecognitionOutcome::Match {
            person_id,
            person_name,
            confidence,
        }
        | RecognitionOutcome::LowConfidence {
            person_id,
            person_name,
            confidence,
        } => {
            let pct = (confidence * 100.0).round() as u32;
            format!("{person_id}_{}_{stamp}_c{pct:02}.{ext}", slug(person_name))
        }
        other => {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("snapshot");
            format!("{}_{stamp}_{}.{ext}", other.status(), slug(stem))
        }
    }
}

fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}.{ext}"));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// Rename, falling back to copy + remove across filesystems.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}
