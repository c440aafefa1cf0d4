//! Structured JSONL audit log: one file per UTC date at
//! `{data_dir}/logs/webhooks_YYYY-MM-DD.json`. Writes are atomic:
//! serialize, write to a temp file in the same directory, then append to
//! the target file under its own advisory file lock (the closest
//! idiomatic-Rust equivalent of the original's `fcntl.flock`-guarded
//! read-modify-append, via `fs2`).

use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use time::OffsetDateTime;

use crate::context::AuditRecord;

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("failed to write audit log entry: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize audit log entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct AuditLog {
    data_dir: PathBuf,
}

impl AuditLog {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn path_for(&self, date: OffsetDateTime) -> PathBuf {
        let format = time::macros::format_description!("[year]-[month]-[day]");
        let stamp = date.format(&format).unwrap_or_default();
        self.data_dir.join("logs").join(format!("webhooks_{stamp}.json"))
    }

    /// Serializes `record` to one compact JSON line and appends it to
    /// today's (UTC) log file, creating the `logs/` directory and the
    /// file if necessary. Holds an exclusive advisory lock on the target
    /// file for the duration of the append so concurrent deliveries
    /// cannot interleave partial lines.
    pub fn append(&self, record: &AuditRecord) -> Result<(), AuditLogError> {
        let path = self.path_for(OffsetDateTime::now_utc());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(record)?;

        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(line.as_bytes())?;
            tmp.write_all(b"\n")?;
            tmp.sync_all()?;
        }

        let mut target = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        target.lock_exclusive()?;
        let contents = std::fs::read(&tmp_path)?;
        let result = target.write_all(&contents);
        FileExt::unlock(&target)?;
        let _ = std::fs::remove_file(&tmp_path);
        result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DeliveryContext, StepError};
    use std::collections::BTreeMap;

    #[test]
    fn append_writes_one_jsonl_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().to_path_buf());

        let ctx = DeliveryContext::new(
            "d1".into(),
            "pull_request".into(),
            Some("opened".into()),
            "r".into(),
            "o/r".into(),
        );
        ctx.start_step("pr_handler");
        ctx.complete_step("pr_handler", BTreeMap::new());
        ctx.finish();
        let record = ctx.to_audit_record();

        log.append(&record).unwrap();

        let path = log.path_for(OffsetDateTime::now_utc());
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"hook_id\":\"d1\""));
    }

    #[test]
    fn append_twice_produces_two_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().to_path_buf());

        for i in 0..2 {
            let ctx = DeliveryContext::new(
                format!("d{i}"),
                "pull_request".into(),
                Some("synchronize".into()),
                "r".into(),
                "o/r".into(),
            );
            ctx.finish();
            log.append(&ctx.to_audit_record()).unwrap();
        }

        let path = log.path_for(OffsetDateTime::now_utc());
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn fail_step_surfaces_error_record() {
        let ctx = DeliveryContext::new(
            "d3".into(),
            "check_run".into(),
            Some("completed".into()),
            "r".into(),
            "o/r".into(),
        );
        ctx.start_step("pr_cicd_execution");
        ctx.fail_step(
            "pr_cicd_execution",
            StepError { kind: "GithubApiError".into(), message: "boom".into(), traceback: None },
        );
        ctx.finish();
        let record = ctx.to_audit_record();
        assert!(!record.success);
        assert!(record.workflow_steps["pr_cicd_execution"].error.is_some());
    }
}
