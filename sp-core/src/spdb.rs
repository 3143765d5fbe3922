//! Progress persistence contract. Rows here are write-behind observability
//! and restart recovery, not execution truth; callers tolerate lost
//! fire-and-forget writes.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::SpInfo;

/// User-visible task state stored per object; the gateway reads it for
/// progress queries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum TaskState {
    #[default]
    Init = 0,
    UploadObjectDoing = 1,
    UploadObjectDone = 2,
    UploadObjectError = 3,
    ReplicateObjectDoing = 4,
    ReplicateObjectDone = 5,
    ReplicateObjectError = 6,
    SealObjectDoing = 7,
    SealObjectDone = 8,
    SealObjectError = 9,
}

impl TaskState {
    pub fn from_i32(value: i32) -> TaskState {
        match value {
            1 => TaskState::UploadObjectDoing,
            2 => TaskState::UploadObjectDone,
            3 => TaskState::UploadObjectError,
            4 => TaskState::ReplicateObjectDoing,
            5 => TaskState::ReplicateObjectDone,
            6 => TaskState::ReplicateObjectError,
            7 => TaskState::SealObjectDoing,
            8 => TaskState::SealObjectDone,
            9 => TaskState::SealObjectError,
            _ => TaskState::Init,
        }
    }
}

/// Executor audit event names recorded next to upload progress.
pub const EXECUTOR_BEGIN_TASK: &str = "executor_begin_task";
pub const EXECUTOR_END_TASK: &str = "executor_end_task";
pub const EXECUTOR_BEGIN_SEAL_TX: &str = "executor_begin_seal_tx";
pub const EXECUTOR_END_SEAL_TX: &str = "executor_end_seal_tx";
pub const EXECUTOR_BEGIN_CONFIRM_SEAL: &str = "executor_begin_confirm_seal";
pub const EXECUTOR_END_CONFIRM_SEAL: &str = "executor_end_confirm_seal";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadObjectMeta {
    pub object_id: u64,
    pub task_state: TaskState,
    pub error_description: String,
    pub secondary_addresses: Vec<String>,
    pub secondary_signatures: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcObjectMeta {
    pub task_key: String,
    pub start_block_height: u64,
    pub end_block_height: u64,
    pub current_block_height: u64,
    pub last_deleted_object_id: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcZombieMeta {
    pub task_key: String,
    pub start_object_id: u64,
    pub last_deleted_object_id: u64,
    pub deleted_zombie_number: u64,
}

/// Per-object integrity row used by the challenge and recovery protocols.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntegrityMeta {
    pub object_id: u64,
    pub integrity_checksum: Vec<u8>,
    pub piece_checksum_list: Vec<Vec<u8>>,
    pub signature: Vec<u8>,
}

#[async_trait]
pub trait SpDb: Send + Sync {
    /// Upserts the per-object upload progress row.
    async fn update_upload_progress(&self, meta: &UploadObjectMeta) -> Result<()>;
    async fn get_upload_metas_to_replicate(&self, limit: usize) -> Result<Vec<UploadObjectMeta>>;
    async fn get_upload_metas_to_seal(&self, limit: usize) -> Result<Vec<UploadObjectMeta>>;
    async fn insert_upload_event(&self, object_id: u64, event: &str, detail: &str) -> Result<()>;

    async fn insert_gc_object_progress(&self, meta: &GcObjectMeta) -> Result<()>;
    async fn update_gc_object_progress(&self, meta: &GcObjectMeta) -> Result<()>;
    async fn delete_gc_object_progress(&self, task_key: &str) -> Result<()>;
    async fn get_gc_metas_to_gc(&self, limit: usize) -> Result<Vec<GcObjectMeta>>;

    async fn insert_gc_zombie_progress(&self, meta: &GcZombieMeta) -> Result<()>;
    async fn update_gc_zombie_progress(&self, meta: &GcZombieMeta) -> Result<()>;
    async fn delete_gc_zombie_progress(&self, task_key: &str) -> Result<()>;

    async fn set_object_integrity(&self, meta: &IntegrityMeta) -> Result<()>;
    async fn get_object_integrity(&self, object_id: u64) -> Result<IntegrityMeta>;
    async fn delete_object_integrity(&self, object_id: u64) -> Result<()>;

    async fn set_replicate_piece_checksum(
        &self,
        object_id: u64,
        replicate_idx: u32,
        piece_idx: u32,
        checksum: Vec<u8>,
    ) -> Result<()>;
    async fn delete_all_replicate_piece_checksums(
        &self,
        object_id: u64,
        replicate_idx: u32,
    ) -> Result<()>;

    async fn update_all_sp(&self, sp_list: &[SpInfo]) -> Result<()>;
    async fn set_own_sp_info(&self, sp: &SpInfo) -> Result<()>;
    async fn get_own_sp_info(&self) -> Result<SpInfo>;
}

#[derive(Debug, Default)]
struct MemSpDbState {
    upload_progress: HashMap<u64, UploadObjectMeta>,
    upload_events: Vec<(u64, String, String)>,
    gc_object_progress: HashMap<String, GcObjectMeta>,
    gc_zombie_progress: HashMap<String, GcZombieMeta>,
    integrity: HashMap<u64, IntegrityMeta>,
    piece_checksums: HashMap<(u64, u32, u32), Vec<u8>>,
    sp_list: Vec<SpInfo>,
    own_sp: Option<SpInfo>,
}

/// In-memory reference implementation of the progress store.
#[derive(Debug, Default)]
pub struct MemSpDb {
    state: Mutex<MemSpDbState>,
}

impl MemSpDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_progress(&self, object_id: u64) -> Option<UploadObjectMeta> {
        self.state
            .lock()
            .unwrap()
            .upload_progress
            .get(&object_id)
            .cloned()
    }

    pub fn gc_object_progress(&self, task_key: &str) -> Option<GcObjectMeta> {
        self.state
            .lock()
            .unwrap()
            .gc_object_progress
            .get(task_key)
            .cloned()
    }

    pub fn upload_event_count(&self) -> usize {
        self.state.lock().unwrap().upload_events.len()
    }
}

#[async_trait]
impl SpDb for MemSpDb {
    async fn update_upload_progress(&self, meta: &UploadObjectMeta) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .upload_progress
            .insert(meta.object_id, meta.clone());
        Ok(())
    }

    async fn get_upload_metas_to_replicate(&self, limit: usize) -> Result<Vec<UploadObjectMeta>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .upload_progress
            .values()
            .filter(|m| {
                matches!(
                    m.task_state,
                    TaskState::UploadObjectDone | TaskState::ReplicateObjectDoing
                )
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_upload_metas_to_seal(&self, limit: usize) -> Result<Vec<UploadObjectMeta>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .upload_progress
            .values()
            .filter(|m| {
                matches!(
                    m.task_state,
                    TaskState::ReplicateObjectDone | TaskState::SealObjectDoing
                )
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_upload_event(&self, object_id: u64, event: &str, detail: &str) -> Result<()> {
        self.state.lock().unwrap().upload_events.push((
            object_id,
            event.to_string(),
            detail.to_string(),
        ));
        Ok(())
    }

    async fn insert_gc_object_progress(&self, meta: &GcObjectMeta) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .gc_object_progress
            .insert(meta.task_key.clone(), meta.clone());
        Ok(())
    }

    async fn update_gc_object_progress(&self, meta: &GcObjectMeta) -> Result<()> {
        self.insert_gc_object_progress(meta).await
    }

    async fn delete_gc_object_progress(&self, task_key: &str) -> Result<()> {
        self.state.lock().unwrap().gc_object_progress.remove(task_key);
        Ok(())
    }

    async fn get_gc_metas_to_gc(&self, limit: usize) -> Result<Vec<GcObjectMeta>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .gc_object_progress
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_gc_zombie_progress(&self, meta: &GcZombieMeta) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .gc_zombie_progress
            .insert(meta.task_key.clone(), meta.clone());
        Ok(())
    }

    async fn update_gc_zombie_progress(&self, meta: &GcZombieMeta) -> Result<()> {
        self.insert_gc_zombie_progress(meta).await
    }

    async fn delete_gc_zombie_progress(&self, task_key: &str) -> Result<()> {
        self.state.lock().unwrap().gc_zombie_progress.remove(task_key);
        Ok(())
    }

    async fn set_object_integrity(&self, meta: &IntegrityMeta) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .integrity
            .insert(meta.object_id, meta.clone());
        Ok(())
    }

    async fn get_object_integrity(&self, object_id: u64) -> Result<IntegrityMeta> {
        self.state
            .lock()
            .unwrap()
            .integrity
            .get(&object_id)
            .cloned()
            .ok_or_else(|| Error::Db(format!("integrity meta {} not found", object_id)))
    }

    async fn delete_object_integrity(&self, object_id: u64) -> Result<()> {
        self.state.lock().unwrap().integrity.remove(&object_id);
        Ok(())
    }

    async fn set_replicate_piece_checksum(
        &self,
        object_id: u64,
        replicate_idx: u32,
        piece_idx: u32,
        checksum: Vec<u8>,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .piece_checksums
            .insert((object_id, replicate_idx, piece_idx), checksum);
        Ok(())
    }

    async fn delete_all_replicate_piece_checksums(
        &self,
        object_id: u64,
        replicate_idx: u32,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .piece_checksums
            .retain(|(id, r, _), _| !(*id == object_id && *r == replicate_idx));
        Ok(())
    }

    async fn update_all_sp(&self, sp_list: &[SpInfo]) -> Result<()> {
        self.state.lock().unwrap().sp_list = sp_list.to_vec();
        Ok(())
    }

    async fn set_own_sp_info(&self, sp: &SpInfo) -> Result<()> {
        self.state.lock().unwrap().own_sp = Some(sp.clone());
        Ok(())
    }

    async fn get_own_sp_info(&self) -> Result<SpInfo> {
        self.state
            .lock()
            .unwrap()
            .own_sp
            .clone()
            .ok_or_else(|| Error::Db("own sp info not set".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_progress_upsert() {
        let db = MemSpDb::new();
        db.update_upload_progress(&UploadObjectMeta {
            object_id: 9,
            task_state: TaskState::UploadObjectDone,
            ..Default::default()
        })
        .await
        .unwrap();
        db.update_upload_progress(&UploadObjectMeta {
            object_id: 9,
            task_state: TaskState::ReplicateObjectDone,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(
            db.upload_progress(9).unwrap().task_state,
            TaskState::ReplicateObjectDone
        );
        assert_eq!(db.get_upload_metas_to_seal(10).await.unwrap().len(), 1);
        assert!(db.get_upload_metas_to_replicate(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gc_progress_roundtrip() {
        let db = MemSpDb::new();
        let meta = GcObjectMeta {
            task_key: "GCObject-start:0-end:99".to_string(),
            start_block_height: 0,
            end_block_height: 99,
            current_block_height: 50,
            last_deleted_object_id: 3,
        };
        db.insert_gc_object_progress(&meta).await.unwrap();
        assert_eq!(db.get_gc_metas_to_gc(10).await.unwrap(), vec![meta.clone()]);
        db.delete_gc_object_progress(&meta.task_key).await.unwrap();
        assert!(db.get_gc_metas_to_gc(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_task_state_i32_roundtrip() {
        for state in [
            TaskState::Init,
            TaskState::UploadObjectError,
            TaskState::SealObjectDone,
        ] {
            assert_eq!(TaskState::from_i32(state as i32), state);
        }
    }
}
