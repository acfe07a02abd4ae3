//! Entry metadata and the on-disk record envelope

use crate::keys::{FunctionKey, InputKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::process::Command;
use tracing::warn;

/// Caller-owned metadata for one entry
///
/// The engine stores and returns this map verbatim. By convention it carries
/// an output hash and whatever a serializer needs to decode the bytes; see
/// [`create_metadata`].
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Size and SHA-256 of a stored output, recorded by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDigest {
    /// Output length in bytes
    pub size: u64,
    /// Hex SHA-256 of the output bytes
    pub sha256: String,
}

impl OutputDigest {
    /// Digest of an in-memory buffer
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            size: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(bytes)),
        }
    }

    /// Digest of a reader, streamed
    pub(crate) fn of_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok(Self {
            size,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

/// Version of the record layout written by this crate
pub(crate) const RECORD_VERSION: u32 = 1;

/// What `metadata.json` holds: the caller's map plus the engine's digest
///
/// `committed_at` makes two commits of identical content distinguishable, so
/// a reader can tell whether the entry was replaced while it loaded bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EntryRecord {
    pub version: u32,
    pub committed_at: DateTime<Utc>,
    pub output: OutputDigest,
    pub metadata: Metadata,
}

impl EntryRecord {
    pub(crate) fn new(output: OutputDigest, metadata: Metadata) -> Self {
        Self {
            version: RECORD_VERSION,
            committed_at: Utc::now(),
            output,
            metadata,
        }
    }
}

/// Commit and worktree state of the git repository around the working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitProvenance {
    /// `git rev-parse HEAD`
    pub commit_hash: String,
    /// No uncommitted changes (`git status --porcelain` is empty)
    pub clean: bool,
}

impl GitProvenance {
    /// Query `git`; `None` with a warning when there is no repository or no `git`
    #[must_use]
    pub fn current() -> Option<Self> {
        let provenance = git(&["rev-parse", "HEAD"]).and_then(|commit_hash| {
            let status = git(&["status", "--porcelain"])?;
            Ok(Self {
                commit_hash,
                clean: status.is_empty(),
            })
        });
        match provenance {
            Ok(provenance) => Some(provenance),
            Err(reason) => {
                warn!(%reason, "Failed to get git metadata");
                None
            }
        }
    }
}

/// Trimmed stdout of a successful `git` invocation, or why it failed
fn git(args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .map_err(|e| format!("git {}: {e}", args.join(" ")))?;
    if !output.status.success() {
        return Err(format!(
            "git {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Build the conventional metadata map for a freshly computed output
///
/// Fields: `input_id`, `output_id` (SHA-256 of the output), `output_size`,
/// `created_at` (RFC 3339, UTC) and `serializer`, an arbitrary JSON value the
/// serializer uses to find its way back (format name, file extension, ...).
/// Inside a git checkout `git_commit_hash` and `git_clean` are added too.
#[must_use]
pub fn create_metadata(
    input_key: &InputKey,
    output: &[u8],
    serializer: serde_json::Value,
) -> Metadata {
    build_metadata(input_key, output, serializer, GitProvenance::current())
}

fn build_metadata(
    input_key: &InputKey,
    output: &[u8],
    serializer: serde_json::Value,
    git: Option<GitProvenance>,
) -> Metadata {
    let digest = OutputDigest::of(output);
    let mut metadata = Metadata::new();
    metadata.insert("input_id".into(), input_key.id().into());
    metadata.insert("output_id".into(), digest.sha256.into());
    metadata.insert("output_size".into(), digest.size.into());
    metadata.insert("created_at".into(), Utc::now().to_rfc3339().into());
    metadata.insert("serializer".into(), serializer);
    if let Some(git) = git {
        metadata.insert("git_commit_hash".into(), git.commit_hash.into());
        metadata.insert("git_clean".into(), git.clean.into());
    }
    metadata
}

/// Record kept once per function: when it first stored results, and where from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// The function id the record was written for
    pub function_id: String,
    /// When the record was written
    pub created_at: DateTime<Utc>,
    /// Caller-owned description of the function
    pub metadata: Metadata,
    /// Repository state at creation, when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitProvenance>,
}

impl FunctionRecord {
    /// A record for `function_key` stamped now, with the current git state
    #[must_use]
    pub fn new(function_key: &FunctionKey, metadata: Metadata) -> Self {
        Self {
            function_id: function_key.id().to_string(),
            created_at: Utc::now(),
            metadata,
            git: GitProvenance::current(),
        }
    }
}
