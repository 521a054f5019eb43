//! Canonical on-disk layout under the wodehouse home.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! | Path | Owner | Purpose |
//! |------|-------|---------|
//! | `records.jsonl` | transport | Shared record log |
//! | `offsets/<consumer>.json` | dispatcher | Per-consumer offsets |
//! | `audit/audit.jsonl` | audit logger | Durable audit trail |
//! | `audit/<YYYY-MM-DD>_daily_log.md` | audit logger | Human-readable log |

use std::path::PathBuf;

use anyhow::Result;

/// Get the wodehouse home directory (~/.wodehouse)
pub fn wodehouse_home() -> Result<PathBuf> {
    crate::config::wodehouse_home()
}

/// Get the record log path (~/.wodehouse/records.jsonl)
pub fn records_log() -> Result<PathBuf> {
    Ok(crate::config::config()?.records_path())
}

/// Get the offsets directory (~/.wodehouse/offsets/)
pub fn offsets_dir() -> Result<PathBuf> {
    Ok(crate::config::config()?.offsets_dir())
}

/// Get the audit directory (~/.wodehouse/audit/)
pub fn audit_dir() -> Result<PathBuf> {
    Ok(crate::config::config()?.audit_dir())
}
