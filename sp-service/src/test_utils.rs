//! Shared fixtures: scriptable chain, peer-SP and metadata stubs wired into a
//! real manager/executor pair over the in-memory stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use sp_core::client::{Metadata, SpApiClient};
use sp_core::consensus::Consensus;
use sp_core::error::{Error, Result};
use sp_core::piece_store::MemPieceStore;
use sp_core::rcmgr::ResourceManager;
use sp_core::spdb::MemSpDb;
use sp_core::task::{ReceivePieceTask, RecoverPieceTask};
use sp_core::types::{
    Bucket, BucketInfo, DeletedObject, MsgDiscontinueBucket, MsgRejectSealObject, MsgSealObject,
    ObjectInfo, ObjectStatus, SpInfo, StorageParams, StreamRecord, ValidatorInfo,
};

use crate::config::RuntimeConfig;
use crate::executor::Executor;
use crate::manager::Manager;

#[derive(Default)]
pub struct MockConsensus {
    pub height: AtomicU64,
    pub objects: Mutex<HashMap<u64, ObjectInfo>>,
    /// Per-object countdown of `query_object_info_by_id` calls until the
    /// object reports sealed.
    pub seal_countdowns: Mutex<HashMap<u64, u32>>,
    pub storage_params: Mutex<StorageParams>,
    pub sp_list: Mutex<Vec<SpInfo>>,
    pub buckets: Mutex<HashMap<String, BucketInfo>>,
    pub seal_submissions: Mutex<Vec<MsgSealObject>>,
    pub reject_submissions: Mutex<Vec<MsgRejectSealObject>>,
    pub discontinue_submissions: Mutex<Vec<MsgDiscontinueBucket>>,
}

impl MockConsensus {
    pub fn insert_object(&self, object: ObjectInfo) {
        self.objects.lock().unwrap().insert(object.id, object);
    }

    pub fn seal_after_polls(&self, object_id: u64, polls: u32) {
        self.seal_countdowns.lock().unwrap().insert(object_id, polls);
    }
}

#[async_trait]
impl Consensus for MockConsensus {
    async fn current_height(&self) -> Result<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }
    async fn has_account(&self, _account: &str) -> Result<bool> {
        Ok(true)
    }
    async fn list_sps(&self) -> Result<Vec<SpInfo>> {
        Ok(self.sp_list.lock().unwrap().clone())
    }
    async fn list_bonded_validators(&self) -> Result<Vec<ValidatorInfo>> {
        Ok(Vec::new())
    }
    async fn query_storage_params(&self) -> Result<StorageParams> {
        Ok(self.storage_params.lock().unwrap().clone())
    }
    async fn query_storage_params_by_timestamp(&self, _timestamp: i64) -> Result<StorageParams> {
        Ok(self.storage_params.lock().unwrap().clone())
    }
    async fn query_bucket_info(&self, bucket: &str) -> Result<BucketInfo> {
        self.buckets
            .lock()
            .unwrap()
            .get(bucket)
            .cloned()
            .ok_or(Error::NoSuchObject)
    }
    async fn query_object_info(&self, _bucket: &str, object: &str) -> Result<ObjectInfo> {
        self.objects
            .lock()
            .unwrap()
            .values()
            .find(|o| o.object_name == object)
            .cloned()
            .ok_or(Error::NoSuchObject)
    }
    async fn query_object_info_by_id(&self, object_id: u64) -> Result<ObjectInfo> {
        let mut object = self
            .objects
            .lock()
            .unwrap()
            .get(&object_id)
            .cloned()
            .ok_or(Error::NoSuchObject)?;
        let mut countdowns = self.seal_countdowns.lock().unwrap();
        if let Some(polls) = countdowns.get_mut(&object_id) {
            if *polls > 1 {
                *polls -= 1;
            } else {
                object.object_status = ObjectStatus::Sealed;
                self.objects.lock().unwrap().insert(object_id, object.clone());
            }
        }
        Ok(object)
    }
    async fn query_payment_stream_record(&self, _account: &str) -> Result<StreamRecord> {
        Ok(StreamRecord::default())
    }
    async fn verify_get_object_permission(
        &self,
        _account: &str,
        _bucket: &str,
        _object: &str,
    ) -> Result<bool> {
        Ok(true)
    }
    async fn verify_put_object_permission(&self, _account: &str, _bucket: &str) -> Result<bool> {
        Ok(true)
    }
    async fn submit_seal_object(&self, msg: &MsgSealObject) -> Result<()> {
        self.seal_submissions.lock().unwrap().push(msg.clone());
        Ok(())
    }
    async fn submit_reject_seal_object(&self, msg: &MsgRejectSealObject) -> Result<()> {
        self.reject_submissions.lock().unwrap().push(msg.clone());
        Ok(())
    }
    async fn submit_discontinue_bucket(&self, msg: &MsgDiscontinueBucket) -> Result<()> {
        self.discontinue_submissions.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockApiClient {
    /// endpoint -> piece payload served for recovery fetches
    pub recovery_pieces: Mutex<HashMap<String, Vec<u8>>>,
    /// endpoint -> artificial response delay in milliseconds
    pub delays: Mutex<HashMap<String, u64>>,
    pub replicated: Mutex<Vec<(String, u32, i32, usize)>>,
    pub done_calls: Mutex<Vec<String>>,
}

impl MockApiClient {
    pub fn serve_piece(&self, endpoint: &str, data: Vec<u8>) {
        self.recovery_pieces
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), data);
    }

    pub fn delay(&self, endpoint: &str, millis: u64) {
        self.delays.lock().unwrap().insert(endpoint.to_string(), millis);
    }

    pub fn replicated_count(&self) -> usize {
        self.replicated.lock().unwrap().len()
    }
}

#[async_trait]
impl SpApiClient for MockApiClient {
    async fn replicate_piece(
        &self,
        endpoint: &str,
        task: &ReceivePieceTask,
        data: &[u8],
    ) -> Result<()> {
        self.replicated.lock().unwrap().push((
            endpoint.to_string(),
            task.replicate_idx,
            task.piece_idx,
            data.len(),
        ));
        Ok(())
    }

    async fn done_replicate_piece(
        &self,
        endpoint: &str,
        _task: &ReceivePieceTask,
    ) -> Result<Vec<u8>> {
        self.done_calls.lock().unwrap().push(endpoint.to_string());
        Ok(format!("sig-{}", endpoint).into_bytes())
    }

    async fn get_piece(&self, endpoint: &str, _task: &RecoverPieceTask) -> Result<Vec<u8>> {
        let delay = self.delays.lock().unwrap().get(endpoint).copied();
        if let Some(millis) = delay {
            sleep(Duration::from_millis(millis)).await;
        }
        self.recovery_pieces
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::Gateway(format!("no piece at {}", endpoint)))
    }

    async fn sign_recovery_task(&self, _task: &RecoverPieceTask) -> Result<Vec<u8>> {
        Ok(b"recovery-signature".to_vec())
    }
}

#[derive(Default)]
pub struct MockMetadata {
    pub deleted_objects: Mutex<Vec<DeletedObject>>,
    pub response_end_block: AtomicU64,
    pub expired_buckets: Mutex<Vec<Bucket>>,
}

#[async_trait]
impl Metadata for MockMetadata {
    async fn list_deleted_objects_by_block_number_range(
        &self,
        _operator_address: &str,
        start_block: u64,
        end_block: u64,
    ) -> Result<(Vec<DeletedObject>, u64)> {
        let objects = self
            .deleted_objects
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.delete_at >= start_block && o.delete_at <= end_block)
            .cloned()
            .collect();
        Ok((objects, self.response_end_block.load(Ordering::SeqCst)))
    }

    async fn list_expired_buckets_by_sp(
        &self,
        _create_at: i64,
        _operator_address: &str,
        limit: i64,
    ) -> Result<Vec<Bucket>> {
        let buckets = self.expired_buckets.lock().unwrap();
        Ok(buckets.iter().take(limit as usize).cloned().collect())
    }
}

pub struct TestEnv {
    pub consensus: Arc<MockConsensus>,
    pub api: Arc<MockApiClient>,
    pub metadata: Arc<MockMetadata>,
    pub db: Arc<MemSpDb>,
    pub piece_store: Arc<MemPieceStore>,
    pub manager: Arc<Manager>,
    pub executor: Arc<Executor>,
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        operator_address: "0xself".to_string(),
        max_execute_num: 2,
        ask_task_interval: 10,
        listen_seal_timeout_height: 5,
        listen_seal_retry_timeout: 1,
        max_listen_seal_retry: 3,
        gc_object_block_interval: 99,
        gc_safe_block_distance: 5,
        ..RuntimeConfig::new()
    }
}

pub fn test_env(config: RuntimeConfig) -> TestEnv {
    let consensus = Arc::new(MockConsensus::default());
    let api = Arc::new(MockApiClient::default());
    let metadata = Arc::new(MockMetadata::default());
    let db = Arc::new(MemSpDb::new());
    let piece_store = Arc::new(MemPieceStore::new());
    let rcmgr = ResourceManager::new(config.executor_limit());
    let manager = Arc::new(Manager::new(
        &config,
        consensus.clone(),
        db.clone(),
        metadata.clone(),
    ));
    manager.install_strategies();
    let executor = Arc::new(Executor::new(
        &config,
        &rcmgr,
        manager.clone(),
        consensus.clone(),
        piece_store.clone(),
        db.clone(),
        api.clone(),
        metadata.clone(),
    ));
    TestEnv {
        consensus,
        api,
        metadata,
        db,
        piece_store,
        manager,
        executor,
    }
}

/// A limit wide enough to admit anything during tests.
pub fn wide_limit() -> sp_core::rcmgr::ScopeStat {
    sp_core::rcmgr::ScopeStat {
        memory: i64::MAX,
        num_tasks_high: 1024,
        num_tasks_medium: 1024,
        num_tasks_low: 1024,
        num_tasks_total: 4096,
    }
}
