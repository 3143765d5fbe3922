//! The task is the smallest unit of asynchronous work in the node. Every
//! variant embeds a shared header carrying identity-independent bookkeeping
//! (timing, retry budget, priority, runner address) and adds its own payload.
//! Object-bound variants snapshot `ObjectInfo` and `StorageParams` at
//! creation; storage params change on chain over time, so re-querying them
//! mid-task would break the piece math.

pub mod queue;

use std::time::{SystemTime, UNIX_EPOCH};

use serde_derive::{Deserialize, Serialize};

use crate::error::Error;
use crate::rcmgr::ScopeStat;
use crate::types::{
    BucketInfo, MsgCreateBucket, MsgCreateObject, ObjectInfo, StorageParams,
};

pub type TaskKey = String;

pub fn get_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TaskPriority {
    #[default]
    Low,
    Medium,
    High,
}

impl TaskPriority {
    /// Numeric weight used by the manager's weighted-random pick.
    pub fn weight(self) -> u32 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Medium => 8,
            TaskPriority::High => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    ApprovalCreateBucket,
    ApprovalCreateObject,
    ApprovalReplicatePiece,
    UploadObject,
    ResumableUploadObject,
    ReplicatePiece,
    ReceivePiece,
    SealObject,
    DownloadObject,
    DownloadPiece,
    ChallengePiece,
    GcObject,
    GcZombiePiece,
    GcMeta,
    RecoverPiece,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHeader {
    /// Operator address of the worker currently running the task.
    pub address: String,
    pub create_time: i64,
    pub update_time: i64,
    /// Seconds before an untouched task counts as timed out.
    pub timeout: i64,
    pub retry: i64,
    pub max_retry: i64,
    pub priority: TaskPriority,
    pub error: Option<Error>,
}

impl TaskHeader {
    pub fn new(priority: TaskPriority, timeout: i64, max_retry: i64) -> Self {
        let now = get_timestamp();
        TaskHeader {
            address: String::new(),
            create_time: now,
            update_time: now,
            timeout,
            retry: 0,
            max_retry,
            priority,
            error: None,
        }
    }

    pub fn exceed_timeout(&self) -> bool {
        self.update_time + self.timeout < get_timestamp()
    }

    pub fn exceed_retry(&self) -> bool {
        self.retry > self.max_retry
    }

    pub fn expired(&self) -> bool {
        self.exceed_timeout() || self.exceed_retry()
    }

    /// The only mutation path for the retry counter.
    pub fn inc_retry(&mut self) {
        self.retry += 1;
        self.update_time = get_timestamp();
    }

    pub fn set_update_time(&mut self) {
        self.update_time = get_timestamp();
    }

    pub fn set_error(&mut self, error: Option<Error>) {
        self.error = error;
        self.update_time = get_timestamp();
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ApprovalCreateBucketTask {
    pub header: TaskHeader,
    pub create_bucket_info: MsgCreateBucket,
    pub expired_height: u64,
}

impl ApprovalCreateBucketTask {
    pub fn key(&self) -> TaskKey {
        format!(
            "ApprovalCreateBucket-bucket:{}-account:{}",
            self.create_bucket_info.bucket_name, self.create_bucket_info.creator
        )
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, 0)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ApprovalCreateObjectTask {
    pub header: TaskHeader,
    pub create_object_info: MsgCreateObject,
    pub expired_height: u64,
}

impl ApprovalCreateObjectTask {
    pub fn key(&self) -> TaskKey {
        format!(
            "ApprovalCreateObject-bucket:{}-object:{}-account:{}",
            self.create_object_info.bucket_name,
            self.create_object_info.object_name,
            self.create_object_info.creator
        )
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, 0)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ApprovalReplicatePieceTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    pub ask_sp_operator_address: String,
    pub ask_signature: Vec<u8>,
    pub expired_height: u64,
}

impl ApprovalReplicatePieceTask {
    pub fn key(&self) -> TaskKey {
        format!("ApprovalReplicatePiece-id:{}", self.object_info.id)
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, self.object_info.payload_size as i64)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UploadObjectTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
}

impl UploadObjectTask {
    pub fn new(object_info: ObjectInfo, storage_params: StorageParams, timeout: i64) -> Self {
        UploadObjectTask {
            header: TaskHeader::new(TaskPriority::High, timeout, 0),
            object_info,
            storage_params,
        }
    }

    pub fn task_key(object_id: u64) -> TaskKey {
        format!("Uploading-id:{}", object_id)
    }

    pub fn key(&self) -> TaskKey {
        Self::task_key(self.object_info.id)
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, self.object_info.payload_size as i64)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ResumableUploadObjectTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    /// Offset the user asked to resume from.
    pub resume_offset: u64,
    /// True on the last request of the resumable flow; triggers integrity
    /// checks and replication.
    pub completed: bool,
}

impl ResumableUploadObjectTask {
    pub fn new(
        object_info: ObjectInfo,
        storage_params: StorageParams,
        timeout: i64,
        completed: bool,
        resume_offset: u64,
    ) -> Self {
        ResumableUploadObjectTask {
            header: TaskHeader::new(TaskPriority::High, timeout, 0),
            object_info,
            storage_params,
            resume_offset,
            completed,
        }
    }

    pub fn task_key(object_id: u64) -> TaskKey {
        format!("ResumableUploading-id:{}", object_id)
    }

    pub fn key(&self) -> TaskKey {
        Self::task_key(self.object_info.id)
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, self.object_info.payload_size as i64)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ReplicatePieceTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    /// Set when the combined replicate-and-seal shortcut sealed the object,
    /// saving a separate seal task.
    pub sealed: bool,
    pub secondary_addresses: Vec<String>,
    pub secondary_signatures: Vec<Vec<u8>>,
}

impl ReplicatePieceTask {
    pub fn new(
        object_info: ObjectInfo,
        storage_params: StorageParams,
        priority: TaskPriority,
        timeout: i64,
        max_retry: i64,
    ) -> Self {
        ReplicatePieceTask {
            header: TaskHeader::new(priority, timeout, max_retry),
            object_info,
            storage_params,
            sealed: false,
            secondary_addresses: Vec::new(),
            secondary_signatures: Vec::new(),
        }
    }

    pub fn task_key(object_id: u64) -> TaskKey {
        format!("Replicating-id:{}", object_id)
    }

    pub fn key(&self) -> TaskKey {
        Self::task_key(self.object_info.id)
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, self.object_info.payload_size as i64)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ReceivePieceTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    /// Which secondary slot of the object this SP fills.
    pub replicate_idx: u32,
    pub piece_idx: i32,
    pub piece_size: i64,
    pub piece_checksum: Vec<u8>,
    /// Primary SP signature proving the task origin.
    pub signature: Vec<u8>,
    /// Secondary SPs confirm the seal before counting the piece as kept;
    /// unsealed pieces waste their storage.
    pub sealed: bool,
}

impl ReceivePieceTask {
    pub fn task_key(object_id: u64, replicate_idx: u32, piece_idx: i32) -> TaskKey {
        format!(
            "Receiving-id:{}-r:{}-p:{}",
            object_id, replicate_idx, piece_idx
        )
    }

    pub fn key(&self) -> TaskKey {
        Self::task_key(self.object_info.id, self.replicate_idx, self.piece_idx)
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, self.piece_size)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SealObjectTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    pub secondary_addresses: Vec<String>,
    pub secondary_signatures: Vec<Vec<u8>>,
}

impl SealObjectTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        object_info: ObjectInfo,
        storage_params: StorageParams,
        priority: TaskPriority,
        secondary_addresses: Vec<String>,
        secondary_signatures: Vec<Vec<u8>>,
        timeout: i64,
        max_retry: i64,
    ) -> Self {
        SealObjectTask {
            header: TaskHeader::new(priority, timeout, max_retry),
            object_info,
            storage_params,
            secondary_addresses,
            secondary_signatures,
        }
    }

    pub fn task_key(object_id: u64) -> TaskKey {
        format!("Sealing-id:{}", object_id)
    }

    pub fn key(&self) -> TaskKey {
        Self::task_key(self.object_info.id)
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, 0)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DownloadObjectTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub bucket_info: BucketInfo,
    pub storage_params: StorageParams,
    pub user_address: String,
    pub low: i64,
    pub high: i64,
}

impl DownloadObjectTask {
    pub fn key(&self) -> TaskKey {
        format!(
            "Downloading-id:{}-low:{}-high:{}",
            self.object_info.id, self.low, self.high
        )
    }

    pub fn size(&self) -> i64 {
        self.high - self.low + 1
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, self.size())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DownloadPieceTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub bucket_info: BucketInfo,
    pub storage_params: StorageParams,
    pub user_address: String,
    pub enable_check: bool,
    pub total_size: u64,
    pub piece_key: String,
    pub piece_offset: u64,
    pub piece_length: u64,
}

impl DownloadPieceTask {
    pub fn key(&self) -> TaskKey {
        format!(
            "DownloadingPiece-key:{}-offset:{}-length:{}",
            self.piece_key, self.piece_offset, self.piece_length
        )
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, self.piece_length as i64)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ChallengePieceTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub bucket_info: BucketInfo,
    pub storage_params: StorageParams,
    pub user_address: String,
    pub segment_idx: u32,
    pub redundancy_idx: i32,
    pub integrity_hash: Vec<u8>,
    pub piece_hashes: Vec<Vec<u8>>,
    pub piece_data_size: i64,
}

impl ChallengePieceTask {
    pub fn key(&self) -> TaskKey {
        format!(
            "Challenging-id:{}-s:{}-r:{}",
            self.object_info.id, self.segment_idx, self.redundancy_idx
        )
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, self.piece_data_size)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GcObjectTask {
    pub header: TaskHeader,
    pub start_block_number: u64,
    pub end_block_number: u64,
    pub current_block_number: u64,
    pub last_deleted_object_id: u64,
}

impl GcObjectTask {
    pub fn new(priority: TaskPriority, start: u64, end: u64, timeout: i64) -> Self {
        GcObjectTask {
            header: TaskHeader::new(priority, timeout, 3),
            start_block_number: start,
            end_block_number: end,
            current_block_number: start,
            last_deleted_object_id: 0,
        }
    }

    pub fn key(&self) -> TaskKey {
        format!(
            "GCObject-start:{}-end:{}",
            self.start_block_number, self.end_block_number
        )
    }

    pub fn set_gc_object_progress(&mut self, current_block: u64, last_deleted_object_id: u64) {
        self.current_block_number = current_block;
        self.last_deleted_object_id = last_deleted_object_id;
        self.header.set_update_time();
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, 0)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GcZombiePieceTask {
    pub header: TaskHeader,
    pub start_object_id: u64,
    pub last_deleted_object_id: u64,
    pub deleted_zombie_number: u64,
}

impl GcZombiePieceTask {
    pub fn key(&self) -> TaskKey {
        format!("GCZombie-start:{}", self.start_object_id)
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, 0)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GcMetaTask {
    pub header: TaskHeader,
    pub current_idx: u64,
    pub delete_count: u64,
}

impl GcMetaTask {
    pub fn key(&self) -> TaskKey {
        format!("GCMeta-create:{}", self.header.create_time)
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, 0)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RecoverPieceTask {
    pub header: TaskHeader,
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    pub segment_idx: u32,
    /// −1 recovers the primary segment from the secondaries; >= 0 recovers
    /// this SP's own EC chunk from the primary.
    pub ec_idx: i32,
    pub piece_size: u64,
    pub signature: Vec<u8>,
    pub recovered: bool,
}

impl RecoverPieceTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        object_info: ObjectInfo,
        storage_params: StorageParams,
        priority: TaskPriority,
        segment_idx: u32,
        ec_idx: i32,
        piece_size: u64,
        timeout: i64,
        max_retry: i64,
    ) -> Self {
        RecoverPieceTask {
            header: TaskHeader::new(priority, timeout, max_retry),
            object_info,
            storage_params,
            segment_idx,
            ec_idx,
            piece_size,
            signature: Vec::new(),
            recovered: false,
        }
    }

    pub fn task_key(object_id: u64, segment_idx: u32, ec_idx: i32) -> TaskKey {
        format!("Recovering-id:{}-s:{}-e:{}", object_id, segment_idx, ec_idx)
    }

    pub fn key(&self) -> TaskKey {
        Self::task_key(self.object_info.id, self.segment_idx, self.ec_idx)
    }

    pub fn set_recover_done(&mut self) {
        self.recovered = true;
        self.header.set_update_time();
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        ScopeStat::task(self.header.priority, self.piece_size as i64)
    }
}

/// Closed union over every task family. All scheduler and wire surfaces
/// exchange this type; dispatch is a match on the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Task {
    ApprovalCreateBucket(ApprovalCreateBucketTask),
    ApprovalCreateObject(ApprovalCreateObjectTask),
    ApprovalReplicatePiece(ApprovalReplicatePieceTask),
    UploadObject(UploadObjectTask),
    ResumableUploadObject(ResumableUploadObjectTask),
    ReplicatePiece(ReplicatePieceTask),
    ReceivePiece(ReceivePieceTask),
    SealObject(SealObjectTask),
    DownloadObject(DownloadObjectTask),
    DownloadPiece(DownloadPieceTask),
    ChallengePiece(ChallengePieceTask),
    GcObject(GcObjectTask),
    GcZombiePiece(GcZombiePieceTask),
    GcMeta(GcMetaTask),
    RecoverPiece(RecoverPieceTask),
}

macro_rules! each_variant {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Task::ApprovalCreateBucket($inner) => $body,
            Task::ApprovalCreateObject($inner) => $body,
            Task::ApprovalReplicatePiece($inner) => $body,
            Task::UploadObject($inner) => $body,
            Task::ResumableUploadObject($inner) => $body,
            Task::ReplicatePiece($inner) => $body,
            Task::ReceivePiece($inner) => $body,
            Task::SealObject($inner) => $body,
            Task::DownloadObject($inner) => $body,
            Task::DownloadPiece($inner) => $body,
            Task::ChallengePiece($inner) => $body,
            Task::GcObject($inner) => $body,
            Task::GcZombiePiece($inner) => $body,
            Task::GcMeta($inner) => $body,
            Task::RecoverPiece($inner) => $body,
        }
    };
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        match self {
            Task::ApprovalCreateBucket(_) => TaskType::ApprovalCreateBucket,
            Task::ApprovalCreateObject(_) => TaskType::ApprovalCreateObject,
            Task::ApprovalReplicatePiece(_) => TaskType::ApprovalReplicatePiece,
            Task::UploadObject(_) => TaskType::UploadObject,
            Task::ResumableUploadObject(_) => TaskType::ResumableUploadObject,
            Task::ReplicatePiece(_) => TaskType::ReplicatePiece,
            Task::ReceivePiece(_) => TaskType::ReceivePiece,
            Task::SealObject(_) => TaskType::SealObject,
            Task::DownloadObject(_) => TaskType::DownloadObject,
            Task::DownloadPiece(_) => TaskType::DownloadPiece,
            Task::ChallengePiece(_) => TaskType::ChallengePiece,
            Task::GcObject(_) => TaskType::GcObject,
            Task::GcZombiePiece(_) => TaskType::GcZombiePiece,
            Task::GcMeta(_) => TaskType::GcMeta,
            Task::RecoverPiece(_) => TaskType::RecoverPiece,
        }
    }

    pub fn header(&self) -> &TaskHeader {
        each_variant!(self, t => &t.header)
    }

    pub fn header_mut(&mut self) -> &mut TaskHeader {
        each_variant!(self, t => &mut t.header)
    }

    pub fn key(&self) -> TaskKey {
        each_variant!(self, t => t.key())
    }

    pub fn estimate_limit(&self) -> ScopeStat {
        each_variant!(self, t => t.estimate_limit())
    }

    pub fn object_info(&self) -> Option<&ObjectInfo> {
        match self {
            Task::ApprovalReplicatePiece(t) => Some(&t.object_info),
            Task::UploadObject(t) => Some(&t.object_info),
            Task::ResumableUploadObject(t) => Some(&t.object_info),
            Task::ReplicatePiece(t) => Some(&t.object_info),
            Task::ReceivePiece(t) => Some(&t.object_info),
            Task::SealObject(t) => Some(&t.object_info),
            Task::DownloadObject(t) => Some(&t.object_info),
            Task::DownloadPiece(t) => Some(&t.object_info),
            Task::ChallengePiece(t) => Some(&t.object_info),
            Task::RecoverPiece(t) => Some(&t.object_info),
            _ => None,
        }
    }

    pub fn priority(&self) -> TaskPriority {
        self.header().priority
    }

    pub fn expired(&self) -> bool {
        self.header().expired()
    }

    pub fn exceed_timeout(&self) -> bool {
        self.header().exceed_timeout()
    }

    pub fn exceed_retry(&self) -> bool {
        self.header().exceed_retry()
    }

    pub fn retry(&self) -> i64 {
        self.header().retry
    }

    pub fn inc_retry(&mut self) {
        self.header_mut().inc_retry();
    }

    pub fn error(&self) -> Option<&Error> {
        self.header().error.as_ref()
    }

    pub fn set_error(&mut self, error: Option<Error>) {
        self.header_mut().set_error(error);
    }

    /// Short description for logs.
    pub fn info(&self) -> String {
        let header = self.header();
        format!(
            "key[{}], retry[{}/{}], priority[{:?}], error[{:?}]",
            self.key(),
            header.retry,
            header.max_retry,
            header.priority,
            header.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_expiry() {
        let mut header = TaskHeader::new(TaskPriority::Medium, 60, 2);
        assert!(!header.expired());
        header.update_time = get_timestamp() - 120;
        assert!(header.exceed_timeout());
        assert!(header.expired());

        let mut header = TaskHeader::new(TaskPriority::Medium, 3600, 1);
        header.inc_retry();
        header.inc_retry();
        assert!(header.exceed_retry());
        assert!(header.expired());
        assert!(header.retry <= header.max_retry + 1);
    }

    #[test]
    fn test_inc_retry_touches_update_time() {
        let mut header = TaskHeader::new(TaskPriority::Low, 60, 3);
        header.update_time = 0;
        header.inc_retry();
        assert!(header.update_time > 0);
        assert!(header.create_time <= header.update_time);
    }

    #[test]
    fn test_task_keys_are_stable() {
        let object = ObjectInfo {
            id: 42,
            ..Default::default()
        };
        let replicate = ReplicatePieceTask::new(
            object.clone(),
            StorageParams::default(),
            TaskPriority::High,
            60,
            3,
        );
        assert_eq!(replicate.key(), ReplicatePieceTask::task_key(42));
        let gc = GcObjectTask::new(TaskPriority::Low, 100, 199, 60);
        assert_eq!(gc.key(), "GCObject-start:100-end:199");

        let task = Task::ReplicatePiece(replicate);
        assert_eq!(task.key(), ReplicatePieceTask::task_key(42));
        assert_eq!(task.task_type(), TaskType::ReplicatePiece);
    }

    #[test]
    fn test_estimate_limit_tracks_payload() {
        let object = ObjectInfo {
            id: 1,
            payload_size: 4096,
            ..Default::default()
        };
        let task = Task::UploadObject(UploadObjectTask::new(
            object,
            StorageParams::default(),
            60,
        ));
        let limit = task.estimate_limit();
        assert_eq!(limit.memory, 4096);
        assert_eq!(limit.num_tasks_high, 1);
        assert_eq!(limit.num_tasks_total, 1);
    }

    #[test]
    fn test_gc_progress_is_monotone_state() {
        let mut gc = GcObjectTask::new(TaskPriority::Low, 100, 199, 60);
        gc.set_gc_object_progress(150, 7);
        assert_eq!(gc.current_block_number, 150);
        assert_eq!(gc.last_deleted_object_id, 7);
    }
}
