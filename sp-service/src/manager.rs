//! The manager schedules all asynchronous work: it owns one queue per task
//! family, generates garbage-collection and discontinuation work on timers,
//! reloads in-flight tasks after a restart, and serves the ask/report surface
//! the executor workers drive.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use tokio::time::{interval, sleep, Duration};

use sp_core::consensus::Consensus;
use sp_core::client::Metadata;
use sp_core::error::{Error, Result};
use sp_core::rcmgr::ScopeStat;
use sp_core::spdb::{GcObjectMeta, SpDb, TaskState, UploadObjectMeta};
use sp_core::task::queue::TaskQueue;
use sp_core::task::{
    get_timestamp, GcObjectTask, ReplicatePieceTask, SealObjectTask, Task, TaskPriority,
};
use sp_core::types::{MsgDiscontinueBucket, MsgRejectSealObject, ObjectInfo, ObjectStatus};

use crate::config::RuntimeConfig;
use crate::metrics;

/// Reason recorded on chain when this SP stops serving a bucket.
pub const DISCONTINUE_BUCKET_REASON: &str = "testnet cleanup";
/// Max buckets fetched per discontinuation round.
pub const DISCONTINUE_BUCKET_LIMIT: i64 = 500;

pub const REJECT_UNSEAL_OBJECT_RETRY: u32 = 3;
pub const REJECT_UNSEAL_OBJECT_TIMEOUT: u64 = 3;
pub const DEFAULT_LISTEN_REJECT_UNSEAL_TIMEOUT_HEIGHT: u32 = 10;

const GC_OBJECT_TASK_TIMEOUT: i64 = 300;
const SEAL_OBJECT_TASK_TIMEOUT: i64 = 120;
const REPLICATE_TASK_MIN_TIMEOUT: i64 = 60;
const REPLICATE_TASK_MAX_TIMEOUT: i64 = 1024;
const REPLICATE_SPEED: u64 = 10 * 1024 * 1024;
const REPLICATE_MAX_RETRY: i64 = 3;
const SEAL_MAX_RETRY: i64 = 3;

/// Timeout of a replicate task scaled to the payload it moves.
fn replicate_piece_timeout(payload_size: u64) -> i64 {
    ((payload_size / REPLICATE_SPEED) as i64)
        .clamp(REPLICATE_TASK_MIN_TIMEOUT, REPLICATE_TASK_MAX_TIMEOUT)
}

pub struct Manager {
    operator_address: String,
    consensus: Arc<dyn Consensus>,
    db: Arc<dyn SpDb>,
    metadata: Arc<dyn Metadata>,

    enable_load_task: bool,
    load_task_limit_to_replicate: usize,
    load_task_limit_to_seal: usize,
    load_task_limit_to_gc: usize,

    upload_queue: TaskQueue,
    resumable_upload_queue: TaskQueue,
    replicate_queue: TaskQueue,
    seal_queue: TaskQueue,
    receive_queue: TaskQueue,
    gc_object_queue: TaskQueue,
    gc_zombie_queue: TaskQueue,
    gc_meta_queue: TaskQueue,
    download_queue: TaskQueue,
    challenge_queue: TaskQueue,
    recovery_queue: TaskQueue,

    // single writer (the event loop); read by statistics
    gc_block_height: Mutex<u64>,
    gc_object_time_interval: u64,
    gc_object_block_interval: u64,
    gc_safe_block_distance: u64,

    sync_consensus_info_interval: u64,
    statistics_output_interval: u64,

    discontinue_bucket_enabled: bool,
    discontinue_bucket_time_interval: u64,
    discontinue_bucket_keep_alive_days: i64,
}

impl Manager {
    pub fn new(
        config: &RuntimeConfig,
        consensus: Arc<dyn Consensus>,
        db: Arc<dyn SpDb>,
        metadata: Arc<dyn Metadata>,
    ) -> Self {
        Manager {
            operator_address: config.operator_address.clone(),
            consensus,
            db,
            metadata,
            enable_load_task: config.enable_load_task,
            load_task_limit_to_replicate: config.load_task_limit_to_replicate,
            load_task_limit_to_seal: config.load_task_limit_to_seal,
            load_task_limit_to_gc: config.load_task_limit_to_gc,
            upload_queue: TaskQueue::new("upload", config.max_upload_object_number),
            resumable_upload_queue: TaskQueue::new(
                "resumable-upload",
                config.max_upload_object_number,
            ),
            replicate_queue: TaskQueue::new("replicate", config.task_queue_cap),
            seal_queue: TaskQueue::new("seal", config.task_queue_cap),
            receive_queue: TaskQueue::new("receive", config.task_queue_cap),
            gc_object_queue: TaskQueue::new("gc-object", config.task_queue_cap),
            gc_zombie_queue: TaskQueue::new("gc-zombie", config.task_queue_cap),
            gc_meta_queue: TaskQueue::new("gc-meta", config.task_queue_cap),
            download_queue: TaskQueue::new("download", config.task_queue_cap),
            challenge_queue: TaskQueue::new("challenge", config.task_queue_cap),
            recovery_queue: TaskQueue::new("recovery", config.task_queue_cap),
            gc_block_height: Mutex::new(0),
            gc_object_time_interval: config.gc_object_time_interval,
            gc_object_block_interval: config.gc_object_block_interval,
            gc_safe_block_distance: config.gc_safe_block_distance,
            sync_consensus_info_interval: config.sync_consensus_info_interval,
            statistics_output_interval: config.statistics_output_interval,
            discontinue_bucket_enabled: config.discontinue_bucket_enabled,
            discontinue_bucket_time_interval: config.discontinue_bucket_time_interval,
            discontinue_bucket_keep_alive_days: config.discontinue_bucket_keep_alive_days,
        }
    }

    pub fn operator_address(&self) -> &str {
        &self.operator_address
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.install_strategies();
        if let Err(err) = self.load_task_from_db().await {
            log::error!("failed to load tasks from db: {}", err);
        }
        let manager = self.clone();
        tokio::spawn(async move { manager.event_loop().await });
        Ok(())
    }

    pub(crate) fn install_strategies(&self) {
        self.upload_queue
            .set_retire_task_strategy(self.gc_upload_queue_strategy(TaskState::UploadObjectError));
        self.resumable_upload_queue
            .set_retire_task_strategy(self.gc_upload_queue_strategy(TaskState::UploadObjectError));
        self.replicate_queue.set_retire_task_strategy(
            self.gc_upload_queue_strategy(TaskState::ReplicateObjectError),
        );
        self.replicate_queue
            .set_filter_task_strategy(Box::new(filter_uploading_task));
        self.seal_queue
            .set_retire_task_strategy(self.gc_upload_queue_strategy(TaskState::SealObjectError));
        self.seal_queue
            .set_filter_task_strategy(Box::new(filter_uploading_task));
        self.receive_queue
            .set_retire_task_strategy(Box::new(|t: &mut Task| t.expired()));
        self.receive_queue
            .set_filter_task_strategy(Box::new(filter_uploading_task));
        self.gc_object_queue
            .set_retire_task_strategy(Box::new(reset_gc_object_task));
        self.gc_object_queue
            .set_filter_task_strategy(Box::new(filter_gc_task));
        // read-side queues are caches, always evictable
        self.download_queue
            .set_retire_task_strategy(Box::new(|_: &mut Task| true));
        self.challenge_queue
            .set_retire_task_strategy(Box::new(|_: &mut Task| true));
        self.recovery_queue
            .set_retire_task_strategy(Box::new(|t: &mut Task| {
                t.exceed_retry() || t.exceed_timeout()
            }));
        self.recovery_queue
            .set_filter_task_strategy(Box::new(filter_uploading_task));
    }

    /// Retire strategy of the upload-pipeline queues: evict expired tasks and
    /// record the failure in the progress store. The write is fire-and-forget
    /// observability, losing it must not block eviction.
    fn gc_upload_queue_strategy(
        &self,
        error_state: TaskState,
    ) -> Box<dyn Fn(&mut Task) -> bool + Send + Sync> {
        let db = self.db.clone();
        Box::new(move |task: &mut Task| {
            if !task.expired() {
                return false;
            }
            if let Some(object) = task.object_info() {
                let db = db.clone();
                let object_id = object.id;
                tokio::spawn(async move {
                    let meta = UploadObjectMeta {
                        object_id,
                        task_state: error_state,
                        error_description: "expired".to_string(),
                        ..Default::default()
                    };
                    if let Err(err) = db.update_upload_progress(&meta).await {
                        log::error!(
                            "failed to update task state, object_id {}: {}",
                            object_id,
                            err
                        );
                    }
                });
            }
            true
        })
    }

    async fn event_loop(self: Arc<Self>) {
        self.sync_consensus_info().await;
        let mut gc_object_ticker = interval(Duration::from_secs(self.gc_object_time_interval));
        let mut sync_ticker = interval(Duration::from_secs(self.sync_consensus_info_interval));
        let mut statistics_ticker = interval(Duration::from_secs(self.statistics_output_interval));
        let mut discontinue_ticker =
            interval(Duration::from_secs(self.discontinue_bucket_time_interval));
        loop {
            tokio::select! {
                _ = statistics_ticker.tick() => {
                    self.output_queue_metrics();
                    log::debug!("{}", self.statistics());
                }
                _ = sync_ticker.tick() => self.sync_consensus_info().await,
                _ = gc_object_ticker.tick() => self.generate_gc_object_task().await,
                _ = discontinue_ticker.tick() => {
                    if self.discontinue_bucket_enabled {
                        self.discontinue_buckets().await;
                        log::info!("finished to discontinue buckets");
                    }
                }
            }
        }
    }

    /// Emits one gc-object task per tick, gated by the reorg safety margin.
    /// The gc height only advances after a successful push, so the range is
    /// never lost to a full queue.
    pub(crate) async fn generate_gc_object_task(&self) {
        let start = *self.gc_block_height.lock().unwrap();
        let end = start + self.gc_object_block_interval;
        let current_block_height = match self.consensus.current_height().await {
            Ok(height) => height,
            Err(err) => {
                log::error!(
                    "failed to get current block height for gc object and try again later: {}",
                    err
                );
                return;
            }
        };
        if end + self.gc_safe_block_distance > current_block_height {
            log::debug!(
                "current block number {} less safe distance {} from gc range [{}, {}], try again later",
                current_block_height, self.gc_safe_block_distance, start, end
            );
            return;
        }
        let task = GcObjectTask::new(TaskPriority::Low, start, end, GC_OBJECT_TASK_TIMEOUT);
        let task_key = task.key();
        match self.gc_object_queue.push(Task::GcObject(task)) {
            Ok(()) => {
                metrics::GC_BLOCK_NUMBER_GAUGE
                    .with_label_values(&["manager"])
                    .set(start as f64);
                *self.gc_block_height.lock().unwrap() = end + 1;
                if let Err(err) = self
                    .db
                    .insert_gc_object_progress(&GcObjectMeta {
                        task_key: task_key.clone(),
                        start_block_height: start,
                        end_block_height: end,
                        current_block_height: start,
                        last_deleted_object_id: 0,
                    })
                    .await
                {
                    log::error!("failed to init the gc object task progress: {}", err);
                }
                log::info!("generate a gc object task, key {}", task_key);
            }
            Err(err) => {
                log::error!("failed to push gc object task {}: {}", task_key, err);
            }
        }
    }

    async fn sync_consensus_info(&self) {
        let start = Instant::now();
        let sp_list = match self.consensus.list_sps().await {
            Ok(list) => list,
            Err(err) => {
                log::error!("failed to list sps: {}", err);
                return;
            }
        };
        metrics::CHAIN_HISTOGRAM
            .with_label_values(&["list_sps"])
            .observe(start.elapsed().as_secs_f64());
        if let Err(err) = self.db.update_all_sp(&sp_list).await {
            log::error!("failed to update all sp list: {}", err);
            return;
        }
        for sp in &sp_list {
            if sp.operator_address.eq_ignore_ascii_case(&self.operator_address) {
                if let Err(err) = self.db.set_own_sp_info(sp).await {
                    log::error!("failed to set own sp info: {}", err);
                }
                return;
            }
        }
    }

    pub(crate) async fn discontinue_buckets(&self) {
        let create_at = get_timestamp() - self.discontinue_bucket_keep_alive_days * 24 * 3600;
        let buckets = match self
            .metadata
            .list_expired_buckets_by_sp(create_at, &self.operator_address, DISCONTINUE_BUCKET_LIMIT)
            .await
        {
            Ok(buckets) => buckets,
            Err(err) => {
                log::error!("failed to query expired buckets: {}", err);
                return;
            }
        };
        for bucket in buckets {
            // pace submissions so the mempool is not flooded
            sleep(Duration::from_secs(1)).await;
            let bucket_name = bucket.bucket_info.bucket_name;
            log::info!("start to discontinue bucket {}", bucket_name);
            let msg = MsgDiscontinueBucket {
                bucket_name: bucket_name.clone(),
                reason: DISCONTINUE_BUCKET_REASON.to_string(),
            };
            match self.consensus.submit_discontinue_bucket(&msg).await {
                Ok(()) => log::info!("succeed to discontinue bucket {}", bucket_name),
                Err(err) => log::error!(
                    "failed to discontinue bucket {} on chain: {}",
                    bucket_name,
                    err
                ),
            }
        }
    }

    /// Reloads interrupted work from the progress store: replicate and seal
    /// tasks whose objects are still in created state, plus unfinished gc
    /// ranges. Objects that sealed or vanished while the node was down are
    /// skipped.
    pub async fn load_task_from_db(&self) -> Result<()> {
        if !self.enable_load_task {
            log::info!("skip load tasks from db");
            return Ok(());
        }
        log::info!("start to load task from sp db");
        let mut replicate_count = 0usize;
        let mut seal_count = 0usize;
        let mut gc_count = 0usize;

        let replicate_metas = self
            .db
            .get_upload_metas_to_replicate(self.load_task_limit_to_replicate)
            .await?;
        for meta in replicate_metas {
            let Some((object_info, storage_params)) = self.query_created_object(meta.object_id).await
            else {
                continue;
            };
            let timeout = replicate_piece_timeout(object_info.payload_size);
            let task = ReplicatePieceTask::new(
                object_info,
                storage_params,
                TaskPriority::High,
                timeout,
                REPLICATE_MAX_RETRY,
            );
            if let Err(err) = self.replicate_queue.push(Task::ReplicatePiece(task)) {
                log::error!(
                    "failed to push replicate piece task of object {}: {}",
                    meta.object_id,
                    err
                );
                continue;
            }
            replicate_count += 1;
        }

        let seal_metas = self
            .db
            .get_upload_metas_to_seal(self.load_task_limit_to_seal)
            .await?;
        for meta in seal_metas {
            let Some((object_info, storage_params)) = self.query_created_object(meta.object_id).await
            else {
                continue;
            };
            let task = SealObjectTask::new(
                object_info,
                storage_params,
                TaskPriority::High,
                meta.secondary_addresses.clone(),
                meta.secondary_signatures.clone(),
                SEAL_OBJECT_TASK_TIMEOUT,
                SEAL_MAX_RETRY,
            );
            if let Err(err) = self.seal_queue.push(Task::SealObject(task)) {
                log::error!(
                    "failed to push seal object task of object {}: {}",
                    meta.object_id,
                    err
                );
                continue;
            }
            seal_count += 1;
        }

        let gc_metas = self.db.get_gc_metas_to_gc(self.load_task_limit_to_gc).await?;
        for meta in gc_metas {
            let mut task = GcObjectTask::new(
                TaskPriority::Low,
                meta.start_block_height,
                meta.end_block_height,
                GC_OBJECT_TASK_TIMEOUT,
            );
            task.set_gc_object_progress(meta.current_block_height, meta.last_deleted_object_id);
            if let Err(err) = self.gc_object_queue.push(Task::GcObject(task)) {
                log::error!("failed to push gc object task {}: {}", meta.task_key, err);
                continue;
            }
            gc_count += 1;
            let mut height = self.gc_block_height.lock().unwrap();
            if meta.end_block_height >= *height {
                *height = meta.end_block_height + 1;
            }
        }

        log::info!(
            "end to load task from sp db, replicate_task_number {}, seal_task_number {}, gc_object_task_number {}",
            replicate_count, seal_count, gc_count
        );
        Ok(())
    }

    async fn query_created_object(
        &self,
        object_id: u64,
    ) -> Option<(ObjectInfo, sp_core::types::StorageParams)> {
        let object_info = match self.consensus.query_object_info_by_id(object_id).await {
            Ok(info) => info,
            Err(err) => {
                log::error!("failed to query object info {} and continue: {}", object_id, err);
                return None;
            }
        };
        if object_info.object_status != ObjectStatus::Created {
            log::info!("object {} is not in created status and continue", object_id);
            return None;
        }
        let storage_params = match self
            .consensus
            .query_storage_params_by_timestamp(object_info.create_at)
            .await
        {
            Ok(params) => params,
            Err(err) => {
                log::error!(
                    "failed to query storage params of object {} and continue: {}",
                    object_id,
                    err
                );
                return None;
            }
        };
        Some((object_info, storage_params))
    }

    /// Submits a freshly created task. Only upload-family and recovery tasks
    /// enter through here; everything else is generated internally.
    pub async fn begin_task(&self, task: Task) -> Result<()> {
        match &task {
            Task::UploadObject(t) => {
                if self.task_uploading(t.object_info.id) {
                    return Err(Error::TaskRepeated);
                }
                let object_id = t.object_info.id;
                self.upload_queue.push(task)?;
                self.db
                    .update_upload_progress(&UploadObjectMeta {
                        object_id,
                        task_state: TaskState::UploadObjectDoing,
                        ..Default::default()
                    })
                    .await?;
                Ok(())
            }
            Task::ResumableUploadObject(t) => {
                if self.task_uploading(t.object_info.id) {
                    return Err(Error::TaskRepeated);
                }
                let object_id = t.object_info.id;
                self.resumable_upload_queue.push(task)?;
                self.db
                    .update_upload_progress(&UploadObjectMeta {
                        object_id,
                        task_state: TaskState::UploadObjectDoing,
                        ..Default::default()
                    })
                    .await?;
                Ok(())
            }
            Task::RecoverPiece(t) => {
                if self.recovery_queue.has(&t.key()) {
                    return Err(Error::TaskRepeated);
                }
                self.recovery_queue.push(task)
            }
            _ => Err(Error::TypeMismatch),
        }
    }

    /// True when the object is anywhere in the upload pipeline.
    pub fn task_uploading(&self, object_id: u64) -> bool {
        use sp_core::task::{ResumableUploadObjectTask, UploadObjectTask};
        self.upload_queue.has(&UploadObjectTask::task_key(object_id))
            || self
                .resumable_upload_queue
                .has(&ResumableUploadObjectTask::task_key(object_id))
            || self.replicate_queue.has(&ReplicatePieceTask::task_key(object_id))
            || self.seal_queue.has(&SealObjectTask::task_key(object_id))
    }

    pub fn uploading_object_number(&self) -> usize {
        self.upload_queue.len()
            + self.resumable_upload_queue.len()
            + self.replicate_queue.len()
            + self.seal_queue.len()
    }

    /// Hands one task to an asking worker. Candidates are the first eligible
    /// task of every background queue; the winner is drawn by priority
    /// weight. The task stays queued while it runs; the retry bump is what
    /// hides it from the next ask until it times out.
    pub async fn ask_task(&self, limit: &ScopeStat) -> Result<Task> {
        let mut candidates = Vec::new();
        for queue in [
            &self.replicate_queue,
            &self.seal_queue,
            &self.receive_queue,
            &self.gc_object_queue,
            &self.gc_zombie_queue,
            &self.gc_meta_queue,
            &self.recovery_queue,
        ] {
            if let Some(task) = queue.top_by_limit(limit) {
                candidates.push(task);
            }
        }
        let picked = self.pick_up_task(candidates).ok_or(Error::NoTaskMatchLimit)?;
        let address = self.operator_address.clone();
        let queue = self.queue_of(&picked);
        queue
            .update_by_key(&picked.key(), |task| {
                task.inc_retry();
                task.header_mut().address = address;
            })
            .ok_or(Error::NoTaskMatchLimit)
    }

    /// Weighted random pick biased toward higher priority without starving
    /// the rest: sort ascending, draw r in [0, sum of weights), return the
    /// first task whose prefix sum reaches r.
    pub fn pick_up_task(&self, mut tasks: Vec<Task>) -> Option<Task> {
        if tasks.is_empty() {
            return None;
        }
        if tasks.len() == 1 {
            return tasks.pop();
        }
        tasks.sort_by_key(|t| t.priority());
        let total: u32 = tasks.iter().map(|t| t.priority().weight()).sum();
        let rand_priority = rand::thread_rng().gen_range(0..total);
        let mut prefix = 0u32;
        for task in tasks {
            prefix += task.priority().weight();
            if prefix >= rand_priority {
                return Some(task);
            }
        }
        None
    }

    /// Terminal-state or progress update from a worker. Reporting a task the
    /// manager no longer tracks yields `CanceledTask`, which the worker must
    /// obey immediately.
    pub async fn report_task(&self, task: Task) -> Result<()> {
        let key = task.key();
        match task {
            Task::UploadObject(t) => {
                if self.upload_queue.pop_by_key(&key).is_none() {
                    return Err(Error::CanceledTask);
                }
                self.handle_done_upload(t.object_info, t.storage_params, t.header.error)
                    .await
            }
            Task::ResumableUploadObject(t) => {
                if self.resumable_upload_queue.pop_by_key(&key).is_none() {
                    return Err(Error::CanceledTask);
                }
                if !t.completed {
                    return Ok(());
                }
                self.handle_done_upload(t.object_info, t.storage_params, t.header.error)
                    .await
            }
            Task::ReplicatePiece(t) => {
                if !self.replicate_queue.has(&key) {
                    return Err(Error::CanceledTask);
                }
                if let Some(err) = &t.header.error {
                    return self.handle_failed_replicate(&key, &t, err.clone()).await;
                }
                self.replicate_queue.pop_by_key(&key);
                if t.sealed {
                    // combined replicate-and-seal succeeded, no seal task needed
                    metrics::UPLOAD_STAGE_TIME_HISTOGRAM
                        .with_label_values(&["replicate_seal_total"])
                        .observe((get_timestamp() - t.header.create_time) as f64);
                    return self
                        .db
                        .update_upload_progress(&UploadObjectMeta {
                            object_id: t.object_info.id,
                            task_state: TaskState::SealObjectDone,
                            secondary_addresses: t.secondary_addresses,
                            secondary_signatures: t.secondary_signatures,
                            ..Default::default()
                        })
                        .await;
                }
                self.db
                    .update_upload_progress(&UploadObjectMeta {
                        object_id: t.object_info.id,
                        task_state: TaskState::SealObjectDoing,
                        secondary_addresses: t.secondary_addresses.clone(),
                        secondary_signatures: t.secondary_signatures.clone(),
                        ..Default::default()
                    })
                    .await?;
                let seal = SealObjectTask::new(
                    t.object_info,
                    t.storage_params,
                    TaskPriority::High,
                    t.secondary_addresses,
                    t.secondary_signatures,
                    SEAL_OBJECT_TASK_TIMEOUT,
                    SEAL_MAX_RETRY,
                );
                match self.seal_queue.push(Task::SealObject(seal)) {
                    Ok(()) | Err(Error::TaskRepeated) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Task::SealObject(t) => {
                if !self.seal_queue.has(&key) {
                    return Err(Error::CanceledTask);
                }
                if let Some(err) = t.header.error.clone() {
                    if t.header.exceed_retry() {
                        self.seal_queue.pop_by_key(&key);
                        self.db
                            .update_upload_progress(&UploadObjectMeta {
                                object_id: t.object_info.id,
                                task_state: TaskState::SealObjectError,
                                error_description: err.to_string(),
                                ..Default::default()
                            })
                            .await?;
                        if let Err(reject_err) = self.reject_unseal_object(&t.object_info).await {
                            log::error!(
                                "failed to reject unseal object {}: {}",
                                t.object_info.id,
                                reject_err
                            );
                        }
                        return Ok(());
                    }
                    self.seal_queue.update_by_key(&key, |queued| {
                        queued.set_error(Some(err.clone()));
                    });
                    return Ok(());
                }
                self.seal_queue.pop_by_key(&key);
                self.db
                    .update_upload_progress(&UploadObjectMeta {
                        object_id: t.object_info.id,
                        task_state: TaskState::SealObjectDone,
                        ..Default::default()
                    })
                    .await
            }
            Task::ReceivePiece(t) => {
                if t.sealed {
                    // the object sealed (or the task is otherwise settled),
                    // the confirm task can be retired
                    self.receive_queue.pop_by_key(&key);
                    return Ok(());
                }
                if t.header.error.is_some() {
                    if !self.receive_queue.has(&key) {
                        return Err(Error::CanceledTask);
                    }
                    self.receive_queue.update_by_key(&key, |queued| {
                        queued.set_error(t.header.error.clone());
                    });
                    return Ok(());
                }
                // the receiver hands the seal-confirm task over once the
                // piece data has landed
                match self.receive_queue.push(Task::ReceivePiece(t)) {
                    Ok(()) | Err(Error::TaskRepeated) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Task::GcObject(t) => {
                if !self.gc_object_queue.has(&key) {
                    return Err(Error::CanceledTask);
                }
                if let Some(err) = t.header.error.clone() {
                    self.gc_object_queue.update_by_key(&key, |queued| {
                        queued.set_error(Some(err.clone()));
                    });
                    return Ok(());
                }
                if t.current_block_number > t.end_block_number {
                    self.gc_object_queue.pop_by_key(&key);
                    return self.db.delete_gc_object_progress(&key).await;
                }
                self.gc_object_queue.update_by_key(&key, |queued| {
                    if let Task::GcObject(queued) = queued {
                        queued.set_gc_object_progress(
                            t.current_block_number,
                            t.last_deleted_object_id,
                        );
                    }
                });
                self.db
                    .update_gc_object_progress(&GcObjectMeta {
                        task_key: key,
                        start_block_height: t.start_block_number,
                        end_block_height: t.end_block_number,
                        current_block_height: t.current_block_number,
                        last_deleted_object_id: t.last_deleted_object_id,
                    })
                    .await
            }
            Task::GcZombiePiece(_) | Task::GcMeta(_) => {
                self.gc_zombie_queue.pop_by_key(&key);
                self.gc_meta_queue.pop_by_key(&key);
                Ok(())
            }
            Task::RecoverPiece(t) => {
                if !self.recovery_queue.has(&key) {
                    return Err(Error::CanceledTask);
                }
                if t.recovered || t.header.exceed_retry() {
                    self.recovery_queue.pop_by_key(&key);
                    return Ok(());
                }
                self.recovery_queue.update_by_key(&key, |queued| {
                    queued.set_error(t.header.error.clone());
                });
                Ok(())
            }
            task @ (Task::DownloadObject(_) | Task::DownloadPiece(_)) => {
                // read-side reports only feed the recent-access cache
                match self.download_queue.push(task) {
                    Ok(()) | Err(Error::TaskRepeated) | Err(Error::QueueFull) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            task @ Task::ChallengePiece(_) => {
                match self.challenge_queue.push(task) {
                    Ok(()) | Err(Error::TaskRepeated) | Err(Error::QueueFull) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Task::ApprovalCreateBucket(_)
            | Task::ApprovalCreateObject(_)
            | Task::ApprovalReplicatePiece(_) => Err(Error::TypeMismatch),
        }
    }

    async fn handle_done_upload(
        &self,
        object_info: ObjectInfo,
        storage_params: sp_core::types::StorageParams,
        error: Option<Error>,
    ) -> Result<()> {
        if let Some(err) = error {
            return self
                .db
                .update_upload_progress(&UploadObjectMeta {
                    object_id: object_info.id,
                    task_state: TaskState::UploadObjectError,
                    error_description: err.to_string(),
                    ..Default::default()
                })
                .await;
        }
        self.db
            .update_upload_progress(&UploadObjectMeta {
                object_id: object_info.id,
                task_state: TaskState::ReplicateObjectDoing,
                ..Default::default()
            })
            .await?;
        let timeout = replicate_piece_timeout(object_info.payload_size);
        let replicate = ReplicatePieceTask::new(
            object_info,
            storage_params,
            TaskPriority::High,
            timeout,
            REPLICATE_MAX_RETRY,
        );
        match self.replicate_queue.push(Task::ReplicatePiece(replicate)) {
            Ok(()) | Err(Error::TaskRepeated) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn handle_failed_replicate(
        &self,
        key: &str,
        task: &ReplicatePieceTask,
        error: Error,
    ) -> Result<()> {
        if task.header.exceed_retry() {
            self.replicate_queue.pop_by_key(key);
            self.db
                .update_upload_progress(&UploadObjectMeta {
                    object_id: task.object_info.id,
                    task_state: TaskState::ReplicateObjectError,
                    error_description: error.to_string(),
                    ..Default::default()
                })
                .await?;
            if let Err(err) = self.reject_unseal_object(&task.object_info).await {
                log::error!(
                    "failed to reject unseal object {}: {}",
                    task.object_info.id,
                    err
                );
            }
            return Ok(());
        }
        self.replicate_queue.update_by_key(key, |queued| {
            queued.set_error(Some(error.clone()));
        });
        Ok(())
    }

    /// Rejects a failed upload on chain so the user's create stops dangling.
    /// The submit is retried a few times; each accepted submit is confirmed
    /// by listening for the object's disappearance.
    pub async fn reject_unseal_object(&self, object: &ObjectInfo) -> Result<()> {
        metrics::SEAL_OBJECT_FAILED_COUNTER
            .with_label_values(&["manager"])
            .inc();
        let msg = MsgRejectSealObject {
            bucket_name: object.bucket_name.clone(),
            object_name: object.object_name.clone(),
        };
        let mut last_err = Error::RejectUnsealTimeout;
        for _ in 0..REJECT_UNSEAL_OBJECT_RETRY {
            match self.consensus.submit_reject_seal_object(&msg).await {
                Err(err) => {
                    last_err = err;
                    sleep(Duration::from_secs(REJECT_UNSEAL_OBJECT_TIMEOUT)).await;
                }
                Ok(()) => {
                    match self
                        .consensus
                        .listen_reject_unseal_object(
                            object.id,
                            DEFAULT_LISTEN_REJECT_UNSEAL_TIMEOUT_HEIGHT,
                        )
                        .await
                    {
                        Ok(true) => return Ok(()),
                        Ok(false) => {
                            log::error!("failed to reject unseal object {}", object.id);
                        }
                        Err(err) => {
                            log::error!("failed to reject unseal object {}: {}", object.id, err);
                            last_err = err;
                        }
                    }
                }
            }
        }
        Err(last_err)
    }

    fn queue_of(&self, task: &Task) -> &TaskQueue {
        match task {
            Task::UploadObject(_) => &self.upload_queue,
            Task::ResumableUploadObject(_) => &self.resumable_upload_queue,
            Task::ReplicatePiece(_) => &self.replicate_queue,
            Task::SealObject(_) => &self.seal_queue,
            Task::ReceivePiece(_) => &self.receive_queue,
            Task::GcObject(_) => &self.gc_object_queue,
            Task::GcZombiePiece(_) => &self.gc_zombie_queue,
            Task::GcMeta(_) => &self.gc_meta_queue,
            Task::DownloadObject(_) | Task::DownloadPiece(_) => &self.download_queue,
            Task::ChallengePiece(_) => &self.challenge_queue,
            Task::RecoverPiece(_) => &self.recovery_queue,
            Task::ApprovalCreateBucket(_)
            | Task::ApprovalCreateObject(_)
            | Task::ApprovalReplicatePiece(_) => &self.upload_queue,
        }
    }

    fn output_queue_metrics(&self) {
        for queue in [
            &self.upload_queue,
            &self.resumable_upload_queue,
            &self.replicate_queue,
            &self.seal_queue,
            &self.receive_queue,
            &self.gc_object_queue,
            &self.gc_zombie_queue,
            &self.gc_meta_queue,
            &self.download_queue,
            &self.challenge_queue,
            &self.recovery_queue,
        ] {
            metrics::TASK_QUEUE_SIZE_GAUGE
                .with_label_values(&[queue.name()])
                .set(queue.len() as f64);
        }
    }

    pub fn statistics(&self) -> String {
        format!(
            "upload[{}], resumableUpload[{}], replicate[{}], seal[{}], receive[{}], recovery[{}], gcObject[{}], gcZombie[{}], gcMeta[{}], download[{}], challenge[{}], gcBlockHeight[{}], gcSafeDistance[{}]",
            self.upload_queue.len(),
            self.resumable_upload_queue.len(),
            self.replicate_queue.len(),
            self.seal_queue.len(),
            self.receive_queue.len(),
            self.recovery_queue.len(),
            self.gc_object_queue.len(),
            self.gc_zombie_queue.len(),
            self.gc_meta_queue.len(),
            self.download_queue.len(),
            self.challenge_queue.len(),
            *self.gc_block_height.lock().unwrap(),
            self.gc_safe_block_distance,
        )
    }

    #[cfg(test)]
    pub(crate) fn gc_block_height(&self) -> u64 {
        *self.gc_block_height.lock().unwrap()
    }

    #[cfg(test)]
    pub(crate) fn push_for_test(&self, task: Task) -> Result<()> {
        self.queue_of(&task).push(task)
    }
}

/// Filter of the upload-pipeline queues: serve initial attempts and timed-out
/// retries, hide tasks that are currently running or out of retries.
fn filter_uploading_task(task: &Task) -> bool {
    if task.exceed_retry() {
        return false;
    }
    if task.exceed_timeout() {
        return true;
    }
    task.retry() == 0
}

/// GC tasks are served once and re-served only after an explicit reset.
fn filter_gc_task(task: &Task) -> bool {
    task.retry() == 0
}

/// GC object tasks are never discarded, only restarted: an expired task gets
/// its retry counter cleared and stays queued.
fn reset_gc_object_task(task: &mut Task) -> bool {
    if task.expired() {
        log::error!("reset gc object task {}", task.key());
        task.header_mut().retry = 0;
        task.header_mut().set_update_time();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::test_utils::{test_config, test_env, wide_limit};
    use sp_core::task::UploadObjectTask;
    use sp_core::types::{ObjectInfo, RedundancyType, StorageParams};

    fn object(id: u64, payload_size: u64) -> ObjectInfo {
        ObjectInfo {
            id,
            bucket_name: "bucket".to_string(),
            object_name: format!("object-{}", id),
            payload_size,
            create_at: get_timestamp(),
            redundancy_type: RedundancyType::Ec,
            ..Default::default()
        }
    }

    fn replicate_task(id: u64, payload_size: u64) -> ReplicatePieceTask {
        ReplicatePieceTask::new(
            object(id, payload_size),
            StorageParams::default(),
            TaskPriority::High,
            60,
            3,
        )
    }

    #[tokio::test]
    async fn test_ask_task_without_candidates() {
        let env = test_env(test_config());
        assert_eq!(
            env.manager.ask_task(&wide_limit()).await.unwrap_err(),
            Error::NoTaskMatchLimit
        );
    }

    #[tokio::test]
    async fn test_ask_task_hands_out_and_hides_running_task() {
        let env = test_env(test_config());
        env.manager
            .push_for_test(Task::ReplicatePiece(replicate_task(1, 128)))
            .unwrap();

        let task = env.manager.ask_task(&wide_limit()).await.unwrap();
        assert!(matches!(task, Task::ReplicatePiece(_)));
        assert_eq!(task.retry(), 1);
        assert_eq!(task.header().address, "0xself");

        // the task stays queued but is filtered while it runs
        assert_eq!(
            env.manager.ask_task(&wide_limit()).await.unwrap_err(),
            Error::NoTaskMatchLimit
        );
        assert!(env.manager.task_uploading(1));
    }

    #[tokio::test]
    async fn test_ask_task_respects_resource_limit() {
        let env = test_env(test_config());
        env.manager
            .push_for_test(Task::ReplicatePiece(replicate_task(2, 1_000_000)))
            .unwrap();
        let mut narrow = wide_limit();
        narrow.memory = 1024;
        assert_eq!(
            env.manager.ask_task(&narrow).await.unwrap_err(),
            Error::NoTaskMatchLimit
        );
        // wide limit serves it
        assert!(env.manager.ask_task(&wide_limit()).await.is_ok());
    }

    #[tokio::test]
    async fn test_pick_up_task_weighted_distribution() {
        let env = test_env(test_config());
        let mut tasks: Vec<Task> = (0..100u64)
            .map(|i| {
                Task::GcObject(GcObjectTask::new(
                    TaskPriority::Low,
                    i * 100,
                    i * 100 + 99,
                    300,
                ))
            })
            .collect();
        tasks.push(Task::ReplicatePiece(replicate_task(3, 64)));

        let samples = 2000usize;
        let mut high_hits = 0usize;
        for _ in 0..samples {
            let picked = env.manager.pick_up_task(tasks.clone()).unwrap();
            if picked.priority() == TaskPriority::High {
                high_hits += 1;
            }
        }
        let expected = TaskPriority::High.weight() as f64
            / (TaskPriority::High.weight() as f64 + 100.0 * TaskPriority::Low.weight() as f64);
        let observed = high_hits as f64 / samples as f64;
        assert!(
            (observed - expected).abs() < 0.05,
            "observed {} expected {}",
            observed,
            expected
        );
    }

    #[tokio::test]
    async fn test_begin_task_dedups_across_upload_pipeline() {
        let env = test_env(test_config());
        let upload = UploadObjectTask::new(object(5, 32), StorageParams::default(), 60);
        env.manager
            .begin_task(Task::UploadObject(upload.clone()))
            .await
            .unwrap();
        assert_eq!(
            env.db.upload_progress(5).unwrap().task_state,
            TaskState::UploadObjectDoing
        );
        assert_eq!(
            env.manager
                .begin_task(Task::UploadObject(upload))
                .await
                .unwrap_err(),
            Error::TaskRepeated
        );

        // an object already replicating blocks a new upload as well
        env.manager
            .push_for_test(Task::ReplicatePiece(replicate_task(6, 32)))
            .unwrap();
        let upload = UploadObjectTask::new(object(6, 32), StorageParams::default(), 60);
        assert_eq!(
            env.manager
                .begin_task(Task::UploadObject(upload))
                .await
                .unwrap_err(),
            Error::TaskRepeated
        );
    }

    #[tokio::test]
    async fn test_report_replicate_success_creates_seal_task() {
        let env = test_env(test_config());
        env.manager
            .push_for_test(Task::ReplicatePiece(replicate_task(7, 32)))
            .unwrap();
        let mut task = env.manager.ask_task(&wide_limit()).await.unwrap();
        if let Task::ReplicatePiece(t) = &mut task {
            t.secondary_addresses = vec!["0xa".to_string(), "0xb".to_string()];
            t.secondary_signatures = vec![vec![1], vec![2]];
        }
        env.manager.report_task(task).await.unwrap();

        assert_eq!(
            env.db.upload_progress(7).unwrap().task_state,
            TaskState::SealObjectDoing
        );
        let seal = env.manager.ask_task(&wide_limit()).await.unwrap();
        match seal {
            Task::SealObject(t) => {
                assert_eq!(t.secondary_addresses, vec!["0xa", "0xb"]);
                assert_eq!(t.secondary_signatures, vec![vec![1], vec![2]]);
            }
            other => panic!("expected seal task, got {}", other.info()),
        }
    }

    #[tokio::test]
    async fn test_report_combined_replicate_seal_completes() {
        let env = test_env(test_config());
        env.manager
            .push_for_test(Task::ReplicatePiece(replicate_task(8, 32)))
            .unwrap();
        let mut task = env.manager.ask_task(&wide_limit()).await.unwrap();
        if let Task::ReplicatePiece(t) = &mut task {
            t.sealed = true;
        }
        env.manager.report_task(task).await.unwrap();
        assert_eq!(
            env.db.upload_progress(8).unwrap().task_state,
            TaskState::SealObjectDone
        );
        // no seal task is produced
        assert_eq!(
            env.manager.ask_task(&wide_limit()).await.unwrap_err(),
            Error::NoTaskMatchLimit
        );
        assert!(!env.manager.task_uploading(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_seal_failure_keeps_task_then_rejects() {
        let env = test_env(test_config());
        let seal = SealObjectTask::new(
            object(9, 32),
            StorageParams::default(),
            TaskPriority::High,
            vec!["0xa".to_string()],
            vec![vec![1]],
            SEAL_OBJECT_TASK_TIMEOUT,
            SEAL_MAX_RETRY,
        );
        env.manager.push_for_test(Task::SealObject(seal)).unwrap();
        let mut task = env.manager.ask_task(&wide_limit()).await.unwrap();
        task.set_error(Some(Error::Unsealed));
        env.manager.report_task(task.clone()).await.unwrap();
        // still queued for a later retry
        assert!(env.manager.task_uploading(9));
        assert!(env.db.upload_progress(9).is_none());

        // exhausted retries: terminal error plus reject-unseal on chain
        task.header_mut().retry = SEAL_MAX_RETRY + 1;
        env.manager.report_task(task).await.unwrap();
        assert!(!env.manager.task_uploading(9));
        assert_eq!(
            env.db.upload_progress(9).unwrap().task_state,
            TaskState::SealObjectError
        );
        assert_eq!(env.consensus.reject_submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_report_unknown_task_is_canceled() {
        let env = test_env(test_config());
        let gc = GcObjectTask::new(TaskPriority::Low, 0, 99, 300);
        assert_eq!(
            env.manager.report_task(Task::GcObject(gc)).await.unwrap_err(),
            Error::CanceledTask
        );
    }

    #[tokio::test]
    async fn test_report_gc_progress_then_finish() {
        let env = test_env(test_config());
        let gc = GcObjectTask::new(TaskPriority::Low, 100, 199, 300);
        let key = gc.key();
        env.db
            .insert_gc_object_progress(&GcObjectMeta {
                task_key: key.clone(),
                start_block_height: 100,
                end_block_height: 199,
                current_block_height: 100,
                last_deleted_object_id: 0,
            })
            .await
            .unwrap();
        env.manager.push_for_test(Task::GcObject(gc.clone())).unwrap();

        let mut progress = gc.clone();
        progress.set_gc_object_progress(150, 9);
        env.manager
            .report_task(Task::GcObject(progress))
            .await
            .unwrap();
        let row = env.db.gc_object_progress(&key).unwrap();
        assert_eq!(row.current_block_height, 150);
        assert_eq!(row.last_deleted_object_id, 9);

        let mut done = gc;
        done.set_gc_object_progress(200, 12);
        env.manager.report_task(Task::GcObject(done)).await.unwrap();
        assert!(env.db.gc_object_progress(&key).is_none());
        assert_eq!(
            env.manager.ask_task(&wide_limit()).await.unwrap_err(),
            Error::NoTaskMatchLimit
        );
    }

    #[tokio::test]
    async fn test_generate_gc_object_task_advances_height() {
        let env = test_env(test_config());
        env.consensus.height.store(300, Ordering::SeqCst);
        env.manager.generate_gc_object_task().await;
        assert_eq!(env.manager.gc_block_height(), 100);
        assert!(env
            .db
            .gc_object_progress("GCObject-start:0-end:99")
            .is_some());
        let task = env.manager.ask_task(&wide_limit()).await.unwrap();
        assert!(matches!(task, Task::GcObject(_)));
    }

    #[tokio::test]
    async fn test_generate_gc_object_task_waits_for_safe_distance() {
        let env = test_env(test_config());
        // end (99) + safe distance (5) > height
        env.consensus.height.store(100, Ordering::SeqCst);
        env.manager.generate_gc_object_task().await;
        assert_eq!(env.manager.gc_block_height(), 0);
        assert!(env.db.gc_object_progress("GCObject-start:0-end:99").is_none());
    }

    #[tokio::test]
    async fn test_load_task_from_db() {
        let mut config = test_config();
        config.enable_load_task = true;
        let env = test_env(config);

        env.consensus.insert_object(object(21, 64));
        env.consensus.insert_object(object(22, 64));
        env.db
            .update_upload_progress(&UploadObjectMeta {
                object_id: 21,
                task_state: TaskState::UploadObjectDone,
                ..Default::default()
            })
            .await
            .unwrap();
        env.db
            .update_upload_progress(&UploadObjectMeta {
                object_id: 22,
                task_state: TaskState::ReplicateObjectDone,
                secondary_addresses: vec!["0xa".to_string()],
                secondary_signatures: vec![vec![7]],
                ..Default::default()
            })
            .await
            .unwrap();
        env.db
            .insert_gc_object_progress(&GcObjectMeta {
                task_key: "GCObject-start:1000-end:1099".to_string(),
                start_block_height: 1000,
                end_block_height: 1099,
                current_block_height: 1050,
                last_deleted_object_id: 77,
            })
            .await
            .unwrap();

        env.manager.load_task_from_db().await.unwrap();
        assert!(env.manager.task_uploading(21));
        assert!(env.manager.task_uploading(22));
        assert_eq!(env.manager.gc_block_height(), 1100);
        assert_eq!(env.manager.uploading_object_number(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discontinue_buckets_submits_with_reason() {
        let env = test_env(test_config());
        let mut buckets = Vec::new();
        for i in 0..2 {
            buckets.push(sp_core::types::Bucket {
                bucket_info: sp_core::types::BucketInfo {
                    id: i,
                    bucket_name: format!("old-bucket-{}", i),
                    ..Default::default()
                },
            });
        }
        *env.metadata.expired_buckets.lock().unwrap() = buckets;
        env.manager.discontinue_buckets().await;
        let submissions = env.consensus.discontinue_submissions.lock().unwrap();
        assert_eq!(submissions.len(), 2);
        assert!(submissions.iter().all(|m| m.reason == DISCONTINUE_BUCKET_REASON));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_unseal_object_confirms_absence() {
        let env = test_env(test_config());
        // object is not on chain at all, the listener reads that as rejected
        env.manager.reject_unseal_object(&object(31, 32)).await.unwrap();
        assert_eq!(env.consensus.reject_submissions.lock().unwrap().len(), 1);
    }
}
