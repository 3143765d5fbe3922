//! MySQL-backed progress store. Rows are small and upsert-heavy; every list
//! field is flattened to a comma-joined hex/text column so the schema stays
//! portable across MySQL flavors.

use async_trait::async_trait;
use sqlx::Row;

use sp_core::error::{Error, Result};
use sp_core::spdb::{GcObjectMeta, GcZombieMeta, IntegrityMeta, SpDb, TaskState, UploadObjectMeta};
use sp_core::types::SpInfo;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS upload_object_progress (
        object_id BIGINT UNSIGNED PRIMARY KEY,
        task_state INT NOT NULL,
        error_description TEXT,
        secondary_addresses TEXT,
        secondary_signatures TEXT,
        update_timestamp_second BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS upload_event (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        object_id BIGINT UNSIGNED NOT NULL,
        event VARCHAR(64) NOT NULL,
        detail TEXT,
        create_timestamp_second BIGINT NOT NULL,
        INDEX object_id_index (object_id)
    )",
    "CREATE TABLE IF NOT EXISTS gc_object_progress (
        task_key VARCHAR(128) PRIMARY KEY,
        start_block_height BIGINT UNSIGNED NOT NULL,
        end_block_height BIGINT UNSIGNED NOT NULL,
        current_block_height BIGINT UNSIGNED NOT NULL,
        last_deleted_object_id BIGINT UNSIGNED NOT NULL,
        update_timestamp_second BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS gc_zombie_progress (
        task_key VARCHAR(128) PRIMARY KEY,
        start_object_id BIGINT UNSIGNED NOT NULL,
        last_deleted_object_id BIGINT UNSIGNED NOT NULL,
        deleted_zombie_number BIGINT UNSIGNED NOT NULL,
        update_timestamp_second BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS integrity_meta (
        object_id BIGINT UNSIGNED PRIMARY KEY,
        integrity_checksum TEXT NOT NULL,
        piece_checksum_list MEDIUMTEXT NOT NULL,
        signature TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS piece_hash (
        object_id BIGINT UNSIGNED NOT NULL,
        replicate_index INT UNSIGNED NOT NULL,
        piece_index INT UNSIGNED NOT NULL,
        piece_checksum TEXT NOT NULL,
        PRIMARY KEY (object_id, replicate_index, piece_index)
    )",
    "CREATE TABLE IF NOT EXISTS sp_info (
        operator_address VARCHAR(128) PRIMARY KEY,
        sp_id INT UNSIGNED NOT NULL,
        funding_address VARCHAR(128),
        approval_address VARCHAR(128),
        endpoint VARCHAR(256),
        moniker VARCHAR(128),
        is_own TINYINT NOT NULL DEFAULT 0
    )",
];

fn db_err(err: sqlx::Error) -> Error {
    Error::Db(err.to_string())
}

fn encode_bytes_list(list: &[Vec<u8>]) -> String {
    list.iter().map(hex::encode).collect::<Vec<_>>().join(",")
}

fn decode_bytes_list(text: &str) -> Vec<Vec<u8>> {
    text.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| hex::decode(s).ok())
        .collect()
}

fn encode_string_list(list: &[String]) -> String {
    list.join(",")
}

fn decode_string_list(text: &str) -> Vec<String> {
    text.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[derive(Clone)]
pub struct Database {
    db_pool: sqlx::mysql::MySqlPool,
}

impl Database {
    pub fn new(database_url: &str) -> anyhow::Result<Self> {
        let db_pool = sqlx::mysql::MySqlPool::connect_lazy(database_url)?;
        Ok(Database { db_pool })
    }

    /// Creates the progress tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.db_pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SpDb for Database {
    async fn update_upload_progress(&self, meta: &UploadObjectMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO upload_object_progress \
             (object_id, task_state, error_description, secondary_addresses, secondary_signatures, update_timestamp_second) \
             VALUES (?, ?, ?, ?, ?, UNIX_TIMESTAMP()) \
             ON DUPLICATE KEY UPDATE task_state = VALUES(task_state), \
             error_description = VALUES(error_description), \
             secondary_addresses = VALUES(secondary_addresses), \
             secondary_signatures = VALUES(secondary_signatures), \
             update_timestamp_second = UNIX_TIMESTAMP()",
        )
        .bind(meta.object_id)
        .bind(meta.task_state as i32)
        .bind(&meta.error_description)
        .bind(encode_string_list(&meta.secondary_addresses))
        .bind(encode_bytes_list(&meta.secondary_signatures))
        .execute(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_upload_metas_to_replicate(&self, limit: usize) -> Result<Vec<UploadObjectMeta>> {
        let rows = sqlx::query(
            "SELECT object_id, task_state, error_description, secondary_addresses, secondary_signatures \
             FROM upload_object_progress WHERE task_state IN (?, ?) ORDER BY object_id LIMIT ?",
        )
        .bind(TaskState::UploadObjectDone as i32)
        .bind(TaskState::ReplicateObjectDoing as i32)
        .bind(limit as i64)
        .fetch_all(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(upload_meta_from_row).collect())
    }

    async fn get_upload_metas_to_seal(&self, limit: usize) -> Result<Vec<UploadObjectMeta>> {
        let rows = sqlx::query(
            "SELECT object_id, task_state, error_description, secondary_addresses, secondary_signatures \
             FROM upload_object_progress WHERE task_state IN (?, ?) ORDER BY object_id LIMIT ?",
        )
        .bind(TaskState::ReplicateObjectDone as i32)
        .bind(TaskState::SealObjectDoing as i32)
        .bind(limit as i64)
        .fetch_all(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(upload_meta_from_row).collect())
    }

    async fn insert_upload_event(&self, object_id: u64, event: &str, detail: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO upload_event (object_id, event, detail, create_timestamp_second) \
             VALUES (?, ?, ?, UNIX_TIMESTAMP())",
        )
        .bind(object_id)
        .bind(event)
        .bind(detail)
        .execute(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_gc_object_progress(&self, meta: &GcObjectMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO gc_object_progress \
             (task_key, start_block_height, end_block_height, current_block_height, last_deleted_object_id, update_timestamp_second) \
             VALUES (?, ?, ?, ?, ?, UNIX_TIMESTAMP())",
        )
        .bind(&meta.task_key)
        .bind(meta.start_block_height)
        .bind(meta.end_block_height)
        .bind(meta.current_block_height)
        .bind(meta.last_deleted_object_id)
        .execute(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_gc_object_progress(&self, meta: &GcObjectMeta) -> Result<()> {
        sqlx::query(
            "UPDATE gc_object_progress SET current_block_height = ?, last_deleted_object_id = ?, \
             update_timestamp_second = UNIX_TIMESTAMP() WHERE task_key = ?",
        )
        .bind(meta.current_block_height)
        .bind(meta.last_deleted_object_id)
        .bind(&meta.task_key)
        .execute(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_gc_object_progress(&self, task_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM gc_object_progress WHERE task_key = ?")
            .bind(task_key)
            .execute(&self.db_pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_gc_metas_to_gc(&self, limit: usize) -> Result<Vec<GcObjectMeta>> {
        let rows = sqlx::query(
            "SELECT task_key, start_block_height, end_block_height, current_block_height, last_deleted_object_id \
             FROM gc_object_progress ORDER BY update_timestamp_second DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|row| GcObjectMeta {
                task_key: row.get("task_key"),
                start_block_height: row.get("start_block_height"),
                end_block_height: row.get("end_block_height"),
                current_block_height: row.get("current_block_height"),
                last_deleted_object_id: row.get("last_deleted_object_id"),
            })
            .collect())
    }

    async fn insert_gc_zombie_progress(&self, meta: &GcZombieMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO gc_zombie_progress \
             (task_key, start_object_id, last_deleted_object_id, deleted_zombie_number, update_timestamp_second) \
             VALUES (?, ?, ?, ?, UNIX_TIMESTAMP())",
        )
        .bind(&meta.task_key)
        .bind(meta.start_object_id)
        .bind(meta.last_deleted_object_id)
        .bind(meta.deleted_zombie_number)
        .execute(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_gc_zombie_progress(&self, meta: &GcZombieMeta) -> Result<()> {
        sqlx::query(
            "UPDATE gc_zombie_progress SET last_deleted_object_id = ?, deleted_zombie_number = ?, \
             update_timestamp_second = UNIX_TIMESTAMP() WHERE task_key = ?",
        )
        .bind(meta.last_deleted_object_id)
        .bind(meta.deleted_zombie_number)
        .bind(&meta.task_key)
        .execute(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_gc_zombie_progress(&self, task_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM gc_zombie_progress WHERE task_key = ?")
            .bind(task_key)
            .execute(&self.db_pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_object_integrity(&self, meta: &IntegrityMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO integrity_meta (object_id, integrity_checksum, piece_checksum_list, signature) \
             VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE integrity_checksum = VALUES(integrity_checksum), \
             piece_checksum_list = VALUES(piece_checksum_list), signature = VALUES(signature)",
        )
        .bind(meta.object_id)
        .bind(hex::encode(&meta.integrity_checksum))
        .bind(encode_bytes_list(&meta.piece_checksum_list))
        .bind(hex::encode(&meta.signature))
        .execute(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_object_integrity(&self, object_id: u64) -> Result<IntegrityMeta> {
        let row = sqlx::query(
            "SELECT object_id, integrity_checksum, piece_checksum_list, signature \
             FROM integrity_meta WHERE object_id = ?",
        )
        .bind(object_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::Db(format!("integrity meta {} not found", object_id)))?;
        let integrity_checksum: String = row.get("integrity_checksum");
        let piece_checksum_list: String = row.get("piece_checksum_list");
        let signature: String = row.get("signature");
        Ok(IntegrityMeta {
            object_id: row.get("object_id"),
            integrity_checksum: hex::decode(integrity_checksum).unwrap_or_default(),
            piece_checksum_list: decode_bytes_list(&piece_checksum_list),
            signature: hex::decode(signature).unwrap_or_default(),
        })
    }

    async fn delete_object_integrity(&self, object_id: u64) -> Result<()> {
        sqlx::query("DELETE FROM integrity_meta WHERE object_id = ?")
            .bind(object_id)
            .execute(&self.db_pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_replicate_piece_checksum(
        &self,
        object_id: u64,
        replicate_idx: u32,
        piece_idx: u32,
        checksum: Vec<u8>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO piece_hash (object_id, replicate_index, piece_index, piece_checksum) \
             VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE piece_checksum = VALUES(piece_checksum)",
        )
        .bind(object_id)
        .bind(replicate_idx)
        .bind(piece_idx)
        .bind(hex::encode(checksum))
        .execute(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_all_replicate_piece_checksums(
        &self,
        object_id: u64,
        replicate_idx: u32,
    ) -> Result<()> {
        sqlx::query("DELETE FROM piece_hash WHERE object_id = ? AND replicate_index = ?")
            .bind(object_id)
            .bind(replicate_idx)
            .execute(&self.db_pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_all_sp(&self, sp_list: &[SpInfo]) -> Result<()> {
        for sp in sp_list {
            sqlx::query(
                "INSERT INTO sp_info (operator_address, sp_id, funding_address, approval_address, endpoint, moniker) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE sp_id = VALUES(sp_id), funding_address = VALUES(funding_address), \
                 approval_address = VALUES(approval_address), endpoint = VALUES(endpoint), moniker = VALUES(moniker)",
            )
            .bind(&sp.operator_address)
            .bind(sp.id)
            .bind(&sp.funding_address)
            .bind(&sp.approval_address)
            .bind(&sp.endpoint)
            .bind(&sp.moniker)
            .execute(&self.db_pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn set_own_sp_info(&self, sp: &SpInfo) -> Result<()> {
        sqlx::query("UPDATE sp_info SET is_own = 0 WHERE is_own = 1")
            .execute(&self.db_pool)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO sp_info (operator_address, sp_id, funding_address, approval_address, endpoint, moniker, is_own) \
             VALUES (?, ?, ?, ?, ?, ?, 1) \
             ON DUPLICATE KEY UPDATE is_own = 1, endpoint = VALUES(endpoint), moniker = VALUES(moniker)",
        )
        .bind(&sp.operator_address)
        .bind(sp.id)
        .bind(&sp.funding_address)
        .bind(&sp.approval_address)
        .bind(&sp.endpoint)
        .bind(&sp.moniker)
        .execute(&self.db_pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_own_sp_info(&self) -> Result<SpInfo> {
        let row = sqlx::query(
            "SELECT operator_address, sp_id, funding_address, approval_address, endpoint, moniker \
             FROM sp_info WHERE is_own = 1",
        )
        .fetch_optional(&self.db_pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::Db("own sp info not set".to_string()))?;
        Ok(SpInfo {
            operator_address: row.get("operator_address"),
            id: row.get("sp_id"),
            funding_address: row.get("funding_address"),
            approval_address: row.get("approval_address"),
            endpoint: row.get("endpoint"),
            moniker: row.get("moniker"),
        })
    }
}

fn upload_meta_from_row(row: sqlx::mysql::MySqlRow) -> UploadObjectMeta {
    let task_state: i32 = row.get("task_state");
    let secondary_addresses: String = row.get("secondary_addresses");
    let secondary_signatures: String = row.get("secondary_signatures");
    UploadObjectMeta {
        object_id: row.get("object_id"),
        task_state: TaskState::from_i32(task_state),
        error_description: row.get("error_description"),
        secondary_addresses: decode_string_list(&secondary_addresses),
        secondary_signatures: decode_bytes_list(&secondary_signatures),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_list_roundtrip() {
        let list = vec![vec![1u8, 2, 3], vec![0xde, 0xad]];
        assert_eq!(decode_bytes_list(&encode_bytes_list(&list)), list);
        assert!(decode_bytes_list("").is_empty());
    }

    #[test]
    fn test_string_list_roundtrip() {
        let list = vec!["0xaa".to_string(), "0xbb".to_string()];
        assert_eq!(decode_string_list(&encode_string_list(&list)), list);
        assert!(decode_string_list("").is_empty());
    }
}
