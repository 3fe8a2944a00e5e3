//! Index of recording files, keyed by VM id and covering time range.

use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::RecordingEntry;

impl Database {
    pub fn set_recording_start(&self, vm_id: u32, file_path: &str, time_ms: u64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO recordings (vm_id, file_path, start_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(file_path) DO UPDATE SET start_time = ?3",
            params![vm_id, file_path, time_ms],
        )?;
        Ok(())
    }

    pub fn set_recording_stop(&self, vm_id: u32, file_path: &str, time_ms: u64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO recordings (vm_id, file_path, stop_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(file_path) DO UPDATE SET stop_time = ?3",
            params![vm_id, file_path, time_ms],
        )?;
        Ok(())
    }

    /// Find the file covering `timestamp_ms`, or failing that the next file
    /// that starts after it. Playback walks a time range by calling this
    /// repeatedly with an advancing timestamp.
    pub fn find_recording(&self, vm_id: u32, timestamp_ms: u64) -> Result<Option<RecordingEntry>> {
        let covering = self
            .conn()
            .query_row(
                "SELECT vm_id, start_time, stop_time, file_path FROM recordings
                 WHERE vm_id = ?1 AND start_time <= ?2
                       AND (stop_time IS NULL OR stop_time > ?2)
                 ORDER BY start_time DESC LIMIT 1",
                params![vm_id, timestamp_ms],
                row_to_entry,
            )
            .optional()?;
        if covering.is_some() {
            return Ok(covering);
        }
        self.conn()
            .query_row(
                "SELECT vm_id, start_time, stop_time, file_path FROM recordings
                 WHERE vm_id = ?1 AND start_time > ?2
                 ORDER BY start_time ASC LIMIT 1",
                params![vm_id, timestamp_ms],
                row_to_entry,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordingEntry> {
    Ok(RecordingEntry {
        vm_id: row.get(0)?,
        start_time: row.get::<_, Option<i64>>(1)?.map(|t| t as u64),
        stop_time: row.get::<_, Option<i64>>(2)?.map(|t| t as u64),
        file_path: row.get(3)?,
    })
}
