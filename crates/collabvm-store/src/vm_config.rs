//! Per-VM settings persistence. Each VM's settings snapshot is stored as one
//! bincode blob keyed by VM id.

use rusqlite::params;

use collabvm_proto::VmSettings;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    pub fn create_vm(&self, vm_id: u32, settings: &VmSettings) -> Result<()> {
        let blob = bincode::serialize(settings)?;
        self.conn().execute(
            "INSERT INTO vm_config (vm_id, setting) VALUES (?1, ?2)",
            params![vm_id, blob],
        )?;
        Ok(())
    }

    pub fn update_vm_settings(&self, vm_id: u32, settings: &VmSettings) -> Result<()> {
        let blob = bincode::serialize(settings)?;
        let affected = self.conn().execute(
            "UPDATE vm_config SET setting = ?1 WHERE vm_id = ?2",
            params![blob, vm_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn delete_vm(&self, vm_id: u32) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM vm_config WHERE vm_id = ?1", params![vm_id])?;
        Ok(affected > 0)
    }

    pub fn read_all_vm_settings(&self) -> Result<Vec<(u32, VmSettings)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT vm_id, setting FROM vm_config ORDER BY vm_id")?;
        let rows = stmt.query_map([], |row| {
            let vm_id: u32 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((vm_id, blob))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (vm_id, blob) = row?;
            match bincode::deserialize(&blob) {
                Ok(settings) => out.push((vm_id, settings)),
                Err(err) => {
                    tracing::warn!(vm_id, error = %err, "skipping corrupt VM settings blob");
                }
            }
        }
        Ok(out)
    }

    /// Smallest unused VM id, starting at 1.
    pub fn new_vm_id(&self) -> Result<u32> {
        let max: Option<u32> = self
            .conn()
            .query_row("SELECT MAX(vm_id) FROM vm_config", [], |row| row.get(0))?;
        Ok(max.map_or(1, |m| m + 1))
    }
}
