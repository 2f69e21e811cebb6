use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::Event;
use crate::state::ServerState;

/// Directory under the state dir where clients stage stats files.
pub const STAGING_SUBDIR: &str = "user-stats";
/// Where validated files end up.
pub const ARCHIVE_SUBDIR: &str = "user-stats-archive";
/// Suffix given to files that fail validation.
pub const REJECTED_SUFFIX: &str = "rejected";

/// Header tokens every stats CSV must carry, case-insensitively.
const REQUIRED_HEADER_TOKENS: [&str; 5] = [
    "username",
    "characters learned",
    "time per character",
    "features unlocked",
    "emailadress",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    #[error("stats file is empty")]
    Empty,

    #[error("stats header is missing required column {0:?}")]
    MissingColumn(&'static str),

    #[error("row {row}: {learned} learned characters but {timings} timings")]
    TokenCountMismatch {
        row: usize,
        learned: usize,
        timings: usize,
    },

    #[error("row {0}: too few fields")]
    ShortRow(usize),
}

/// Validate a staged stats CSV.
///
/// The header must contain all required column tokens (case-insensitive);
/// in every data row the whitespace-separated token count of the
/// `characters learned` field must equal that of `time per character`.
pub fn validate_stats_csv(content: &str) -> Result<(), StatsError> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or(StatsError::Empty)?;
    let header_lower = header.to_lowercase();

    for token in REQUIRED_HEADER_TOKENS {
        if !header_lower.contains(token) {
            return Err(StatsError::MissingColumn(token));
        }
    }

    let columns: Vec<String> = header_lower.split(',').map(|c| c.trim().to_string()).collect();
    let learned_idx = columns
        .iter()
        .position(|c| c == "characters learned")
        .ok_or(StatsError::MissingColumn("characters learned"))?;
    let timing_idx = columns
        .iter()
        .position(|c| c == "time per character")
        .ok_or(StatsError::MissingColumn("time per character"))?;

    for (row, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split(',').collect();
        let needed = learned_idx.max(timing_idx);
        if fields.len() <= needed {
            return Err(StatsError::ShortRow(row + 1));
        }
        let learned = fields[learned_idx].split_whitespace().count();
        let timings = fields[timing_idx].split_whitespace().count();
        if learned != timings {
            return Err(StatsError::TokenCountMismatch {
                row: row + 1,
                learned,
                timings,
            });
        }
    }
    Ok(())
}

/// Periodically sweep the staging directory, validating and archiving files.
pub async fn run_ingest_loop(state: Arc<ServerState>) {
    let staging = PathBuf::from(&state.config.state_dir).join(STAGING_SUBDIR);
    let archive = PathBuf::from(&state.config.state_dir).join(ARCHIVE_SUBDIR);
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if let Err(e) = sweep_staging(&state, &staging, &archive).await {
            warn!("stats sweep failed: {e}");
        }
    }
}

/// One sweep over `<staging>/<user>/<file>`. Valid files move to the
/// archive and fire an external-data-updated event; invalid files are
/// quarantined in place with a rejected suffix.
pub async fn sweep_staging(
    state: &ServerState,
    staging: &Path,
    archive: &Path,
) -> std::io::Result<()> {
    if !staging.exists() {
        return Ok(());
    }

    let mut user_dirs = tokio::fs::read_dir(staging).await?;
    while let Some(user_dir) = user_dirs.next_entry().await? {
        if !user_dir.file_type().await?.is_dir() {
            continue;
        }
        let user_name = user_dir.file_name();
        let mut files = tokio::fs::read_dir(user_dir.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if !file.file_type().await?.is_file() {
                continue;
            }
            if path.extension().is_some_and(|e| e == REJECTED_SUFFIX) {
                continue;
            }

            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), "unreadable stats file: {e}");
                    continue;
                }
            };

            match validate_stats_csv(&content) {
                Ok(()) => {
                    let dest_dir = archive.join(&user_name);
                    tokio::fs::create_dir_all(&dest_dir).await?;
                    let dest = dest_dir.join(file.file_name());
                    tokio::fs::rename(&path, &dest).await?;
                    info!(path = %dest.display(), "archived stats file");
                    state.bus.publish(Event::ExternalDataUpdated {
                        source: format!("user-stats:{}", user_name.to_string_lossy()),
                    });
                }
                Err(e) => {
                    let mut quarantined = path.clone().into_os_string();
                    quarantined.push(".");
                    quarantined.push(REJECTED_SUFFIX);
                    debug!(path = %path.display(), "rejecting stats file: {e}");
                    tokio::fs::rename(&path, PathBuf::from(quarantined)).await?;
                }
            }
        }
    }
    Ok(())
}
