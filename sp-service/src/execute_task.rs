//! Per-task state machines run by the executor workers.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use common::checksum::{generate_checksum, generate_integrity_checksum};
use common::piece_key::{ec_piece_key, segment_piece_count, segment_piece_key, segment_piece_size};
use common::redundancy::{decode_raw_segment, encode_raw_segment};

use sp_core::client::{Metadata, SpApiClient};
use sp_core::consensus::Consensus;
use sp_core::error::{Error, Result};
use sp_core::piece_store::PieceStore;
use sp_core::spdb::{
    SpDb, EXECUTOR_BEGIN_CONFIRM_SEAL, EXECUTOR_BEGIN_SEAL_TX, EXECUTOR_END_CONFIRM_SEAL,
    EXECUTOR_END_SEAL_TX,
};
use sp_core::task::{
    get_timestamp, GcMetaTask, GcObjectTask, GcZombiePieceTask, ReceivePieceTask,
    RecoverPieceTask, ReplicatePieceTask, SealObjectTask, Task, TaskHeader,
};
use sp_core::types::{MsgSealObject, ObjectInfo, ObjectStatus, RedundancyType};

use crate::executor::{Executor, EXECUTOR_SERVICE_NAME};
use crate::metrics;

const RECEIVE_CONFIRM_TIMEOUT: i64 = 120;

impl Executor {
    /// Replicates every segment of the object to its secondaries, collects
    /// their seal signatures, then immediately attempts the seal itself. A
    /// successful combined run marks the task sealed so the manager never
    /// creates a separate seal task.
    pub async fn handle_replicate_piece_task(&self, task: &mut ReplicatePieceTask) {
        let object = task.object_info.clone();
        let params = task.storage_params.clone();
        let secondaries = object.secondary_sp_addresses.clone();
        if secondaries.is_empty() {
            log::error!("failed to replicate object {}, no secondary sp", object.id);
            task.header.set_error(Some(Error::DanglingTask));
            return;
        }
        let data_shards = params.redundant_data_chunk_num as usize;
        let parity_shards = params.redundant_parity_chunk_num as usize;
        if object.redundancy_type == RedundancyType::Ec
            && secondaries.len() != data_shards + parity_shards
        {
            task.header.set_error(Some(Error::ReplicateIdxOutOfBounds));
            return;
        }
        let endpoints = match self.get_object_secondary_endpoints(&object).await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                task.header.set_error(Some(err));
                return;
            }
        };

        let segment_count = segment_piece_count(object.payload_size, params.max_segment_size);
        let mut segment_checksums = Vec::with_capacity(segment_count as usize);
        for segment_idx in 0..segment_count {
            let segment_data = match self
                .piece_store
                .get_piece(&segment_piece_key(object.id, segment_idx))
                .await
            {
                Ok(data) => data,
                Err(err) => {
                    task.header.set_error(Some(err));
                    return;
                }
            };
            segment_checksums.push(generate_checksum(&segment_data));
            let pieces = match object.redundancy_type {
                RedundancyType::Ec => {
                    match encode_raw_segment(&segment_data, data_shards, parity_shards) {
                        Ok(pieces) => pieces,
                        Err(err) => {
                            log::error!(
                                "failed to encode segment {} of object {}: {}",
                                segment_idx,
                                object.id,
                                err
                            );
                            task.header.set_error(Some(Error::ReplicateEncode(err.to_string())));
                            return;
                        }
                    }
                }
                RedundancyType::Replica => vec![segment_data; secondaries.len()],
            };
            for (replicate_idx, endpoint) in endpoints.iter().enumerate() {
                let piece = &pieces[replicate_idx];
                let receive_task = ReceivePieceTask {
                    header: TaskHeader::new(task.header.priority, RECEIVE_CONFIRM_TIMEOUT, 0),
                    object_info: object.clone(),
                    storage_params: params.clone(),
                    replicate_idx: replicate_idx as u32,
                    piece_idx: segment_idx as i32,
                    piece_size: piece.len() as i64,
                    piece_checksum: generate_checksum(piece),
                    signature: Vec::new(),
                    sealed: false,
                };
                if let Err(err) = self.api.replicate_piece(endpoint, &receive_task, piece).await {
                    log::error!(
                        "failed to replicate piece {} of object {} to {}: {}",
                        segment_idx,
                        object.id,
                        endpoint,
                        err
                    );
                    task.header.set_error(Some(err));
                    return;
                }
            }
        }

        // the stored payload must still match the integrity hash the user
        // declared at creation before this SP vouches for it on chain
        if let Some(expected) = object.checksums.first() {
            let integrity_checksum = generate_integrity_checksum(&segment_checksums);
            if expected != &integrity_checksum {
                log::error!(
                    "integrity hash mismatch for object {}, expected {}, actual {}",
                    object.id,
                    hex::encode(expected),
                    hex::encode(&integrity_checksum)
                );
                task.header.set_error(Some(Error::InvalidIntegrity));
                return;
            }
        }

        let mut secondary_signatures = Vec::with_capacity(secondaries.len());
        for (replicate_idx, endpoint) in endpoints.iter().enumerate() {
            let done_task = ReceivePieceTask {
                header: TaskHeader::new(task.header.priority, RECEIVE_CONFIRM_TIMEOUT, 0),
                object_info: object.clone(),
                storage_params: params.clone(),
                replicate_idx: replicate_idx as u32,
                piece_idx: -1,
                ..Default::default()
            };
            match self.api.done_replicate_piece(endpoint, &done_task).await {
                Ok(signature) => secondary_signatures.push(signature),
                Err(err) => {
                    log::error!(
                        "failed to confirm replicate of object {} on {}: {}",
                        object.id,
                        endpoint,
                        err
                    );
                    task.header.set_error(Some(err));
                    return;
                }
            }
        }
        task.secondary_addresses = secondaries.clone();
        task.secondary_signatures = secondary_signatures.clone();

        let seal_msg = MsgSealObject {
            operator: self.operator_address.clone(),
            bucket_name: object.bucket_name.clone(),
            object_name: object.object_name.clone(),
            secondary_sp_addresses: secondaries,
            secondary_sp_signatures: secondary_signatures,
        };
        match self
            .seal_object(&object, task.header.max_retry, task.header.create_time, &seal_msg)
            .await
        {
            Ok(()) => task.sealed = true,
            Err(err) => {
                // the replicate itself succeeded; the manager will fall back
                // to a dedicated seal task
                log::error!(
                    "failed to combine seal object {} after replicate: {}",
                    object.id,
                    err
                );
            }
        }
    }

    pub async fn handle_seal_object_task(&self, task: &mut SealObjectTask) {
        let seal_msg = MsgSealObject {
            operator: self.operator_address.clone(),
            bucket_name: task.object_info.bucket_name.clone(),
            object_name: task.object_info.object_name.clone(),
            secondary_sp_addresses: task.secondary_addresses.clone(),
            secondary_sp_signatures: task.secondary_signatures.clone(),
        };
        let result = self
            .seal_object(
                &task.object_info,
                task.header.max_retry,
                task.header.create_time,
                &seal_msg,
            )
            .await;
        task.header.set_error(result.err());
        log::debug!(
            "finish to handle seal object task, error {:?}",
            task.header.error
        );
    }

    async fn seal_object(
        &self,
        object: &ObjectInfo,
        max_retry: i64,
        create_time: i64,
        seal_msg: &MsgSealObject,
    ) -> Result<()> {
        for retry in 0..=max_retry {
            let _ = self
                .db
                .insert_upload_event(object.id, EXECUTOR_BEGIN_SEAL_TX, "")
                .await;
            match self.consensus.submit_seal_object(seal_msg).await {
                Err(err) => {
                    log::error!(
                        "failed to seal object {}, retry {}, max_retry {}: {}",
                        object.id,
                        retry,
                        max_retry,
                        err
                    );
                    let _ = self
                        .db
                        .insert_upload_event(object.id, EXECUTOR_END_SEAL_TX, &err.to_string())
                        .await;
                    sleep(Duration::from_secs(self.listen_seal_retry_timeout)).await;
                }
                Ok(()) => {
                    let _ = self
                        .db
                        .insert_upload_event(object.id, EXECUTOR_END_SEAL_TX, "")
                        .await;
                    break;
                }
            }
        }
        // the signer submits asynchronously, the seal may land even when
        // every submit errored; listen regardless
        let result = self.listen_seal_object(object).await;
        if result.is_ok() {
            metrics::UPLOAD_STAGE_TIME_HISTOGRAM
                .with_label_values(&["upload_replicate_seal_total"])
                .observe((get_timestamp() - create_time) as f64);
        }
        result
    }

    pub(crate) async fn listen_seal_object(&self, object: &ObjectInfo) -> Result<()> {
        let mut result = Ok(());
        for retry in 0..self.max_listen_seal_retry {
            let _ = self
                .db
                .insert_upload_event(object.id, EXECUTOR_BEGIN_CONFIRM_SEAL, "")
                .await;
            match self
                .consensus
                .listen_object_seal(object.id, self.listen_seal_timeout_height)
                .await
            {
                Ok(true) => {
                    let _ = self
                        .db
                        .insert_upload_event(object.id, EXECUTOR_END_CONFIRM_SEAL, "sealed")
                        .await;
                    return Ok(());
                }
                Ok(false) | Err(Error::SealTimeout) => {
                    let _ = self
                        .db
                        .insert_upload_event(object.id, EXECUTOR_END_CONFIRM_SEAL, "unsealed")
                        .await;
                    log::error!(
                        "failed to seal object {} on chain, retry {}, max_retry {}",
                        object.id,
                        retry,
                        self.max_listen_seal_retry
                    );
                    result = Err(Error::Unsealed);
                }
                Err(err) => {
                    let _ = self
                        .db
                        .insert_upload_event(
                            object.id,
                            EXECUTOR_END_CONFIRM_SEAL,
                            &format!("err:{}", err),
                        )
                        .await;
                    log::error!(
                        "failed to listen object seal {}, retry {}, max_retry {}: {}",
                        object.id,
                        retry,
                        self.max_listen_seal_retry,
                        err
                    );
                    result = Err(err);
                    sleep(Duration::from_secs(self.listen_seal_retry_timeout)).await;
                }
            }
        }
        result
    }

    /// Confirms an object this SP received pieces for actually sealed with
    /// this SP in the expected secondary slot; otherwise defensively drops
    /// every piece and integrity row kept for it.
    pub async fn handle_receive_piece_task(&self, task: &mut ReceivePieceTask) {
        if self.listen_seal_object(&task.object_info).await.is_ok() {
            task.sealed = true;
        }
        tracing::debug!(
            "finish to listen seal object for receive piece task, begin to check secondary sp"
        );

        let on_chain_object = match self
            .consensus
            .query_object_info(&task.object_info.bucket_name, &task.object_info.object_name)
            .await
        {
            Ok(object) => object,
            Err(err) => {
                log::error!("failed to get object info: {}", err);
                task.header.set_error(Some(err));
                return;
            }
        };
        if on_chain_object.object_status != ObjectStatus::Sealed {
            log::error!("failed to confirm receive task, object is unsealed");
            task.header.set_error(Some(Error::Unsealed));
            return;
        }
        // whatever the secondary check below says, the manager must be able
        // to retire the task
        task.sealed = true;
        let replicate_idx = task.replicate_idx as usize;
        if replicate_idx >= on_chain_object.secondary_sp_addresses.len() {
            log::error!(
                "failed to confirm receive task, replicate idx {} out of bounds {}",
                replicate_idx,
                on_chain_object.secondary_sp_addresses.len()
            );
            task.header.set_error(Some(Error::ReplicateIdxOutOfBounds));
            return;
        }
        if on_chain_object.secondary_sp_addresses[replicate_idx] != self.operator_address {
            log::error!(
                "failed to confirm receive task, secondary sp mismatch, expect {}, current {}",
                on_chain_object.secondary_sp_addresses[replicate_idx],
                self.operator_address
            );
            task.header.set_error(Some(Error::SecondaryMismatch));
            if let Err(err) = self.db.delete_object_integrity(task.object_info.id).await {
                log::error!("failed to delete integrity: {}", err);
            }
            if let Err(err) = self
                .db
                .delete_all_replicate_piece_checksums(task.object_info.id, task.replicate_idx)
                .await
            {
                log::error!("failed to delete piece checksums: {}", err);
            }
            let segment_count = segment_piece_count(
                on_chain_object.payload_size,
                task.storage_params.max_segment_size,
            );
            for segment_idx in 0..segment_count {
                let piece_key = match task.object_info.redundancy_type {
                    RedundancyType::Ec => {
                        ec_piece_key(on_chain_object.id, segment_idx, task.replicate_idx)
                    }
                    RedundancyType::Replica => segment_piece_key(on_chain_object.id, segment_idx),
                };
                if let Err(err) = self.piece_store.delete_piece(&piece_key).await {
                    log::error!("failed to delete piece data {}: {}", piece_key, err);
                }
            }
            return;
        }
        log::debug!("succeed to handle confirm receive piece task");
    }

    /// Walks the deleted-object list of the task's block range and reclaims
    /// every piece this SP stored for them. Progress is reported after each
    /// object; a cancel answer stops the walk immediately. Piece-store delete
    /// errors are tolerated, a lost delete is a space leak, not corruption.
    pub async fn handle_gc_object_task(&self, task: &mut GcObjectTask) {
        let (waiting_gc_objects, response_end_block_id) = match self
            .metadata
            .list_deleted_objects_by_block_number_range(
                &self.operator_address,
                task.start_block_number,
                task.end_block_number,
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                log::error!("failed to query deleted object list: {}", err);
                task.header.set_error(Some(err));
                return;
            }
        };
        if response_end_block_id < task.start_block_number
            || response_end_block_id < task.end_block_number
        {
            // the metadata index trails the chain, retry the same range later
            log::info!(
                "metadata is not latest, response_end_block_id {}, task {}",
                response_end_block_id,
                task.key()
            );
            return;
        }
        if waiting_gc_objects.is_empty() {
            task.set_gc_object_progress(task.end_block_number + 1, task.last_deleted_object_id);
            return;
        }

        let mut gc_object_number = 0u64;
        for deleted in &waiting_gc_objects {
            let object_info = &deleted.object_info;
            let storage_params = match self
                .consensus
                .query_storage_params_by_timestamp(object_info.create_at)
                .await
            {
                Ok(params) => params,
                Err(err) => {
                    log::error!("failed to query storage params: {}", err);
                    task.header.set_error(Some(err));
                    return;
                }
            };
            let current_gc_block_id = deleted.delete_at;
            let current_gc_object_id = object_info.id;
            if current_gc_block_id < task.current_block_number {
                // a prior run already reclaimed this object
                log::info!(
                    "skip gc object {}, task_current_gc_block_id {}",
                    current_gc_object_id,
                    task.current_block_number
                );
                continue;
            }
            let segment_count =
                segment_piece_count(object_info.payload_size, storage_params.max_segment_size);
            for segment_idx in 0..segment_count {
                let piece_key = segment_piece_key(current_gc_object_id, segment_idx);
                if let Err(err) = self.piece_store.delete_piece(&piece_key).await {
                    log::debug!("failed to delete primary piece {}: {}", piece_key, err);
                }
            }
            for (replicate_idx, address) in object_info.secondary_sp_addresses.iter().enumerate() {
                if address != &self.operator_address {
                    continue;
                }
                for segment_idx in 0..segment_count {
                    let piece_key = match object_info.redundancy_type {
                        RedundancyType::Replica => {
                            segment_piece_key(current_gc_object_id, segment_idx)
                        }
                        RedundancyType::Ec => ec_piece_key(
                            current_gc_object_id,
                            segment_idx,
                            replicate_idx as u32,
                        ),
                    };
                    if let Err(err) = self.piece_store.delete_piece(&piece_key).await {
                        log::debug!("failed to delete secondary piece {}: {}", piece_key, err);
                    }
                }
            }
            if let Err(err) = self.db.delete_object_integrity(current_gc_object_id).await {
                log::debug!(
                    "failed to delete object integrity meta {}: {}",
                    current_gc_object_id,
                    err
                );
            }
            task.set_gc_object_progress(current_gc_block_id, current_gc_object_id);
            metrics::GC_OBJECT_COUNTER
                .with_label_values(&[EXECUTOR_SERVICE_NAME])
                .inc();
            if self.report_gc_progress(task).await {
                log::error!("gc object task has been canceled, task {}", task.key());
                return;
            }
            gc_object_number += 1;
            log::debug!(
                "succeed to gc object {}, deleted_at_block_id {}",
                current_gc_object_id,
                current_gc_block_id
            );
        }
        log::debug!(
            "gc object task {} reclaimed {} objects",
            task.key(),
            gc_object_number
        );
        task.set_gc_object_progress(task.end_block_number + 1, task.last_deleted_object_id);
    }

    /// Pushes the gc progress to the manager; true means the task was
    /// canceled and the handler must stop.
    async fn report_gc_progress(&self, task: &GcObjectTask) -> bool {
        let report = self.manager.report_task(Task::GcObject(task.clone())).await;
        log::debug!("gc object task report progress {}, result {:?}", task.key(), report);
        matches!(report, Err(Error::CanceledTask))
    }

    pub async fn handle_gc_zombie_piece_task(&self, _task: &mut GcZombiePieceTask) {
        log::warn!("gc zombie piece future support");
    }

    pub async fn handle_gc_meta_task(&self, _task: &mut GcMetaTask) {
        log::warn!("gc meta future support");
    }

    /// Rebuilds a lost piece. A secondary (`ec_idx >= 0`) refetches its own
    /// chunk from the primary; the primary (`ec_idx == -1`) fans out to the
    /// secondaries and erasure-decodes the segment from the first
    /// `data_shards` answers.
    pub async fn handle_recover_piece_task(self: &Arc<Self>, task: &mut RecoverPieceTask) {
        let data_shards = task.storage_params.redundant_data_chunk_num;
        let parity_shards = task.storage_params.redundant_parity_chunk_num;
        let max_segment_size = task.storage_params.max_segment_size;
        let ec_piece_count = data_shards + parity_shards;

        if task.object_info.redundancy_type != RedundancyType::Ec {
            task.header.set_error(Some(Error::RecoveryRedundancyType));
            return;
        }
        if task.ec_idx < -1 || task.ec_idx >= ec_piece_count as i32 {
            task.header.set_error(Some(Error::RecoveryPieceIndex));
            return;
        }

        if task.ec_idx >= 0 {
            // this SP is the secondary, recover its own chunk from the primary
            let endpoint = match self
                .get_object_primary_sp_endpoint(&task.object_info.bucket_name)
                .await
            {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    task.header.set_error(Some(err));
                    return;
                }
            };
            let piece_data = match self.do_recovery_piece(task, &endpoint).await {
                Ok(data) => data,
                Err(err) => {
                    task.header.set_error(Some(err));
                    return;
                }
            };
            if let Err(err) = self
                .check_recovery_checksum(task, &generate_checksum(&piece_data))
                .await
            {
                task.header.set_error(Some(err));
                return;
            }
            let recovery_key =
                ec_piece_key(task.object_info.id, task.segment_idx, task.ec_idx as u32);
            if let Err(err) = self.piece_store.put_piece(&recovery_key, piece_data).await {
                log::error!("failed to write recovered piece {}: {}", recovery_key, err);
                task.header.set_error(Some(err));
                return;
            }
            log::debug!("secondary sp recovery successful, piece key {}", recovery_key);
            task.set_recover_done();
            return;
        }

        // this SP is the primary, recover the whole segment
        log::debug!("begin to recover primary sp segment");
        let endpoints = match self.get_object_secondary_endpoints(&task.object_info).await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                task.header.set_error(Some(err));
                return;
            }
        };
        if endpoints.len() < ec_piece_count as usize {
            task.header.set_error(Some(Error::RecoveryPieceNotEnough));
            return;
        }
        let segment_size = segment_piece_size(
            task.object_info.payload_size,
            task.segment_idx,
            max_segment_size,
        );

        // the channel buffers the full fan-out width so a late responder can
        // never block or write after the collector left
        let (piece_tx, mut piece_rx) = mpsc::channel(ec_piece_count as usize);
        for (ec_idx, endpoint) in endpoints.iter().take(ec_piece_count as usize).enumerate() {
            let executor = self.clone();
            let fetch_task = task.clone();
            let endpoint = endpoint.clone();
            let piece_tx = piece_tx.clone();
            tokio::spawn(async move {
                let result = executor.do_recovery_piece(&fetch_task, &endpoint).await;
                let _ = piece_tx.send((ec_idx, result.ok())).await;
            });
        }
        drop(piece_tx);

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; ec_piece_count as usize];
        let mut done_task_num = 0u32;
        let mut finished_task_num = 0u32;
        let mut downloaded_piece_size = 0usize;
        while let Some((ec_idx, piece)) = piece_rx.recv().await {
            finished_task_num += 1;
            if let Some(piece) = piece {
                downloaded_piece_size = piece.len();
                shards[ec_idx] = Some(piece);
                done_task_num += 1;
                // enough chunks to decode, do not wait for the stragglers
                if done_task_num >= data_shards {
                    break;
                }
            }
            if finished_task_num >= ec_piece_count {
                break;
            }
        }
        if done_task_num < data_shards {
            log::error!(
                "not enough pieces from secondaries, got {}, need {}",
                done_task_num,
                data_shards
            );
            task.header.set_error(Some(Error::RecoveryPieceNotEnough));
            return;
        }
        let ec_total_size = (downloaded_piece_size as u64 * data_shards as u64) as i64;
        if ec_total_size < segment_size || ec_total_size > segment_size + data_shards as i64 {
            log::error!("secondary piece data length error, total {}", ec_total_size);
            task.header.set_error(Some(Error::RecoveryPieceLength));
            return;
        }
        let recovered_segment = match decode_raw_segment(
            shards,
            segment_size,
            data_shards as usize,
            parity_shards as usize,
        ) {
            Ok(segment) => segment,
            Err(err) => {
                log::error!(
                    "ec decode error when recovering object {} segment {}: {}",
                    task.object_info.id,
                    task.segment_idx,
                    err
                );
                task.header.set_error(Some(Error::RecoveryDecode));
                return;
            }
        };
        if let Err(err) = self
            .check_recovery_checksum(task, &generate_checksum(&recovered_segment))
            .await
        {
            task.header.set_error(Some(err));
            return;
        }
        let recovery_key = segment_piece_key(task.object_info.id, task.segment_idx);
        if let Err(err) = self
            .piece_store
            .put_piece(&recovery_key, recovered_segment)
            .await
        {
            log::error!("failed to write recovered segment {}: {}", recovery_key, err);
            task.header.set_error(Some(err));
            return;
        }
        log::debug!("primary sp recovery successful, piece key {}", recovery_key);
        task.set_recover_done();
    }

    async fn check_recovery_checksum(
        &self,
        task: &RecoverPieceTask,
        recovery_checksum: &[u8],
    ) -> Result<()> {
        let integrity_meta = self
            .db
            .get_object_integrity(task.object_info.id)
            .await
            .map_err(|err| {
                log::error!(
                    "failed to load integrity meta of object {} when recovering: {}",
                    task.object_info.id,
                    err
                );
                err
            })?;
        let expected = integrity_meta
            .piece_checksum_list
            .get(task.segment_idx as usize)
            .ok_or(Error::RecoveryPieceChecksum)?;
        if expected != recovery_checksum {
            log::error!(
                "recovered data checksum mismatch for object {} segment {}, expected {}, actual {}",
                task.object_info.id,
                task.segment_idx,
                hex::encode(expected),
                hex::encode(recovery_checksum)
            );
            return Err(Error::RecoveryPieceChecksum);
        }
        Ok(())
    }

    /// Signs the recovery request and fetches one piece from a peer SP.
    async fn do_recovery_piece(&self, task: &RecoverPieceTask, endpoint: &str) -> Result<Vec<u8>> {
        let start = Instant::now();
        let result = async {
            let signature = self.api.sign_recovery_task(task).await?;
            let mut signed_task = task.clone();
            signed_task.signature = signature;
            self.api.get_piece(endpoint, &signed_task).await
        }
        .await;
        metrics::RECOVER_PIECE_TIME_HISTOGRAM
            .with_label_values(&[EXECUTOR_SERVICE_NAME])
            .observe(start.elapsed().as_secs_f64());
        match &result {
            Ok(data) => log::debug!(
                "succeed to fetch recovery piece from {}, object {}, segment {}, {} bytes",
                endpoint,
                task.object_info.id,
                task.segment_idx,
                data.len()
            ),
            Err(err) => log::error!(
                "failed to fetch recovery piece from {}, object {}, segment {}: {}",
                endpoint,
                task.object_info.id,
                task.segment_idx,
                err
            ),
        }
        result
    }

    /// Endpoint of every secondary of the object, in replicate-index order.
    /// Unknown addresses map to empty endpoints, the callers fail per piece.
    async fn get_object_secondary_endpoints(&self, object_info: &ObjectInfo) -> Result<Vec<String>> {
        let sp_list = self.consensus.list_sps().await?;
        Ok(object_info
            .secondary_sp_addresses
            .iter()
            .map(|address| {
                sp_list
                    .iter()
                    .find(|sp| &sp.operator_address == address)
                    .map(|sp| sp.endpoint.clone())
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn get_object_primary_sp_endpoint(&self, bucket_name: &str) -> Result<String> {
        let sp_list = self.consensus.list_sps().await?;
        let bucket_info = self.consensus.query_bucket_info(bucket_name).await?;
        sp_list
            .iter()
            .find(|sp| sp.operator_address == bucket_info.primary_sp_address)
            .map(|sp| sp.endpoint.clone())
            .ok_or(Error::PrimaryNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::test_utils::{test_config, test_env, wide_limit, TestEnv};
    use sp_core::piece_store::PieceStore;
    use sp_core::spdb::{IntegrityMeta, SpDb, TaskState};
    use sp_core::task::TaskPriority;
    use sp_core::types::{BucketInfo, DeletedObject, SpInfo, StorageParams};

    fn ec_params() -> StorageParams {
        StorageParams {
            max_segment_size: 32,
            redundant_data_chunk_num: 4,
            redundant_parity_chunk_num: 2,
            max_payload_size: 1024,
        }
    }

    fn ec_object(id: u64, payload_size: u64, secondaries: Vec<String>) -> ObjectInfo {
        ObjectInfo {
            id,
            bucket_name: format!("bucket-{}", id),
            object_name: format!("object-{}", id),
            payload_size,
            create_at: get_timestamp(),
            object_status: ObjectStatus::Created,
            redundancy_type: RedundancyType::Ec,
            secondary_sp_addresses: secondaries,
            ..Default::default()
        }
    }

    fn secondary_addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("0xsec{}", i)).collect()
    }

    fn register_sps(env: &TestEnv, addresses: &[String]) {
        let mut sp_list: Vec<SpInfo> = addresses
            .iter()
            .enumerate()
            .map(|(i, address)| SpInfo {
                id: i as u32 + 1,
                operator_address: address.clone(),
                endpoint: format!("http://{}", address.trim_start_matches("0x")),
                ..Default::default()
            })
            .collect();
        sp_list.push(SpInfo {
            id: 100,
            operator_address: "0xself".to_string(),
            endpoint: "http://self".to_string(),
            ..Default::default()
        });
        *env.consensus.sp_list.lock().unwrap() = sp_list;
    }

    async fn seed_segments(env: &TestEnv, object_id: u64, payload_size: u64, segment_size: u64) {
        let count = segment_piece_count(payload_size, segment_size);
        for idx in 0..count {
            let size = segment_piece_size(payload_size, idx, segment_size) as usize;
            let data = vec![(idx as u8).wrapping_add(1); size];
            env.piece_store
                .put_piece(&segment_piece_key(object_id, idx), data)
                .await
                .unwrap();
        }
    }

    /// Integrity hash the user would have declared over the payload that
    /// `seed_segments` stores.
    fn declared_integrity(payload_size: u64, segment_size: u64) -> Vec<u8> {
        let count = segment_piece_count(payload_size, segment_size);
        let checksums: Vec<Vec<u8>> = (0..count)
            .map(|idx| {
                let size = segment_piece_size(payload_size, idx, segment_size) as usize;
                generate_checksum(&vec![(idx as u8).wrapping_add(1); size])
            })
            .collect();
        generate_integrity_checksum(&checksums)
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicate_then_combined_seal_success() {
        let env = test_env(test_config());
        let secondaries = secondary_addresses(6);
        let mut object = ec_object(1, 64, secondaries.clone());
        object.checksums = vec![declared_integrity(64, 32)];
        env.consensus.insert_object(object.clone());
        // the chain reports the object sealed on the third status poll
        env.consensus.seal_after_polls(1, 3);
        register_sps(&env, &secondaries);
        seed_segments(&env, 1, 64, 32).await;

        let mut task = ReplicatePieceTask::new(object, ec_params(), TaskPriority::High, 60, 3);
        env.executor.handle_replicate_piece_task(&mut task).await;

        assert!(task.header.error.is_none(), "error: {:?}", task.header.error);
        assert!(task.sealed);
        assert_eq!(task.secondary_addresses, secondaries);
        assert_eq!(task.secondary_signatures.len(), 6);
        // 2 segments, 6 pieces each
        assert_eq!(env.api.replicated_count(), 12);
        assert_eq!(env.api.done_calls.lock().unwrap().len(), 6);
        let submissions = env.consensus.seal_submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].secondary_sp_addresses, secondaries);
        assert_eq!(submissions[0].operator, "0xself");
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicate_rejects_corrupted_payload() {
        let env = test_env(test_config());
        let secondaries = secondary_addresses(6);
        let mut object = ec_object(30, 64, secondaries.clone());
        // declared hash does not match what the piece store holds
        object.checksums = vec![vec![0xFF; 32]];
        env.consensus.insert_object(object.clone());
        register_sps(&env, &secondaries);
        seed_segments(&env, 30, 64, 32).await;

        let mut task = ReplicatePieceTask::new(object, ec_params(), TaskPriority::High, 60, 3);
        env.executor.handle_replicate_piece_task(&mut task).await;

        assert_eq!(task.header.error, Some(Error::InvalidIntegrity));
        assert!(!task.sealed);
        // the seal never happened; the unsealed copies are cleaned up by the
        // secondaries' own confirm tasks
        assert!(env.api.done_calls.lock().unwrap().is_empty());
        assert!(env.consensus.seal_submissions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_seal_object_task_times_out_as_unsealed() {
        let env = test_env(test_config());
        let object = ec_object(2, 32, secondary_addresses(6));
        // object exists but never reaches sealed status
        env.consensus.insert_object(object.clone());

        let mut task = SealObjectTask::new(
            object,
            ec_params(),
            TaskPriority::High,
            secondary_addresses(6),
            vec![vec![0]; 6],
            120,
            1,
        );
        env.executor.handle_seal_object_task(&mut task).await;
        assert_eq!(task.header.error, Some(Error::Unsealed));
        // the submit went through, only the confirmation failed
        assert!(!env.consensus.seal_submissions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_confirm_secondary_mismatch_cleans_up() {
        let env = test_env(test_config());
        let mut secondaries = secondary_addresses(6);
        secondaries[2] = "0xother".to_string();
        let mut object = ec_object(3, 48, secondaries);
        object.object_status = ObjectStatus::Sealed;
        env.consensus.insert_object(object.clone());

        let params = StorageParams {
            max_segment_size: 16,
            ..ec_params()
        };
        // the pieces this SP kept for slot 2, plus one unrelated piece
        for segment_idx in 0..3u32 {
            env.piece_store
                .put_piece(&ec_piece_key(3, segment_idx, 2), vec![9; 4])
                .await
                .unwrap();
        }
        env.piece_store
            .put_piece(&segment_piece_key(99, 0), vec![7; 4])
            .await
            .unwrap();
        env.db
            .set_object_integrity(&IntegrityMeta {
                object_id: 3,
                ..Default::default()
            })
            .await
            .unwrap();

        let mut task = ReceivePieceTask {
            header: TaskHeader::new(TaskPriority::Medium, 120, 0),
            object_info: object,
            storage_params: params,
            replicate_idx: 2,
            piece_idx: 0,
            piece_size: 4,
            ..Default::default()
        };
        env.executor.handle_receive_piece_task(&mut task).await;

        assert_eq!(task.header.error, Some(Error::SecondaryMismatch));
        // sealed regardless, so the manager can retire the task
        assert!(task.sealed);
        for segment_idx in 0..3u32 {
            assert!(!env
                .piece_store
                .has_piece(&ec_piece_key(3, segment_idx, 2))
                .await
                .unwrap());
        }
        assert!(env.piece_store.has_piece(&segment_piece_key(99, 0)).await.unwrap());
        assert!(env.db.get_object_integrity(3).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_confirm_matching_secondary_keeps_pieces() {
        let env = test_env(test_config());
        let mut secondaries = secondary_addresses(6);
        secondaries[1] = "0xself".to_string();
        let mut object = ec_object(4, 32, secondaries);
        object.object_status = ObjectStatus::Sealed;
        env.consensus.insert_object(object.clone());
        env.piece_store
            .put_piece(&ec_piece_key(4, 0, 1), vec![5; 8])
            .await
            .unwrap();

        let mut task = ReceivePieceTask {
            header: TaskHeader::new(TaskPriority::Medium, 120, 0),
            object_info: object,
            storage_params: ec_params(),
            replicate_idx: 1,
            ..Default::default()
        };
        env.executor.handle_receive_piece_task(&mut task).await;
        assert!(task.header.error.is_none());
        assert!(task.sealed);
        assert!(env.piece_store.has_piece(&ec_piece_key(4, 0, 1)).await.unwrap());
    }

    fn gc_task_in_queue(env: &TestEnv, start: u64, end: u64) -> GcObjectTask {
        let task = GcObjectTask::new(TaskPriority::Low, start, end, 300);
        env.manager
            .push_for_test(Task::GcObject(task.clone()))
            .unwrap();
        task
    }

    async fn seed_gc_world(env: &TestEnv) -> Vec<DeletedObject> {
        let params = StorageParams {
            max_segment_size: 16,
            ..ec_params()
        };
        *env.consensus.storage_params.lock().unwrap() = params;
        let mut deleted = Vec::new();
        for (i, delete_at) in [(0u64, 120u64), (1, 150), (2, 160), (3, 180)] {
            let object_id = 101 + i;
            let mut secondaries = secondary_addresses(6);
            if object_id == 103 {
                secondaries[0] = "0xself".to_string();
            }
            let object = ec_object(object_id, 32, secondaries);
            seed_segments(env, object_id, 32, 16).await;
            if object_id == 103 {
                for segment_idx in 0..2u32 {
                    env.piece_store
                        .put_piece(&ec_piece_key(103, segment_idx, 0), vec![3; 8])
                        .await
                        .unwrap();
                }
            }
            deleted.push(DeletedObject {
                object_info: object,
                delete_at,
            });
        }
        *env.metadata.deleted_objects.lock().unwrap() = deleted.clone();
        env.metadata.response_end_block.store(250, Ordering::SeqCst);
        deleted
    }

    #[tokio::test]
    async fn test_gc_object_happy_path() {
        let env = test_env(test_config());
        seed_gc_world(&env).await;
        let mut task = gc_task_in_queue(&env, 100, 199);
        let key = task.key();
        env.db
            .insert_gc_object_progress(&sp_core::spdb::GcObjectMeta {
                task_key: key.clone(),
                start_block_height: 100,
                end_block_height: 199,
                current_block_height: 100,
                last_deleted_object_id: 0,
            })
            .await
            .unwrap();

        env.executor.handle_gc_object_task(&mut task).await;

        assert!(task.header.error.is_none());
        assert_eq!(task.current_block_number, 200);
        assert_eq!(task.last_deleted_object_id, 104);
        for object_id in 101..=104u64 {
            for segment_idx in 0..2u32 {
                assert!(!env
                    .piece_store
                    .has_piece(&segment_piece_key(object_id, segment_idx))
                    .await
                    .unwrap());
            }
        }
        // our secondary chunks of object 103 are gone as well
        for segment_idx in 0..2u32 {
            assert!(!env
                .piece_store
                .has_piece(&ec_piece_key(103, segment_idx, 0))
                .await
                .unwrap());
        }
        // the in-loop progress reports reached the store
        let row = env.db.gc_object_progress(&key).unwrap();
        assert_eq!(row.current_block_height, 180);
        assert_eq!(row.last_deleted_object_id, 104);

        // the terminal report retires the task and clears the row
        env.manager
            .report_task(Task::GcObject(task))
            .await
            .unwrap();
        assert!(env.db.gc_object_progress(&key).is_none());
    }

    #[tokio::test]
    async fn test_gc_object_defers_on_metadata_lag() {
        let env = test_env(test_config());
        seed_gc_world(&env).await;
        env.metadata.response_end_block.store(150, Ordering::SeqCst);
        let mut task = gc_task_in_queue(&env, 100, 199);
        env.executor.handle_gc_object_task(&mut task).await;
        // no error, no progress: the same range is retried later
        assert!(task.header.error.is_none());
        assert_eq!(task.current_block_number, 100);
        assert!(env
            .piece_store
            .has_piece(&segment_piece_key(101, 0))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_gc_object_is_idempotent_over_current_block() {
        let env = test_env(test_config());
        seed_gc_world(&env).await;
        let mut task = gc_task_in_queue(&env, 100, 199);
        env.executor.handle_gc_object_task(&mut task).await;
        assert_eq!(task.current_block_number, 200);

        // re-seed the store; a second run over the same range must skip every
        // already-processed object and delete nothing
        seed_gc_world(&env).await;
        env.executor.handle_gc_object_task(&mut task).await;
        for object_id in 101..=104u64 {
            assert!(env
                .piece_store
                .has_piece(&segment_piece_key(object_id, 0))
                .await
                .unwrap());
        }
    }

    fn recovery_segment() -> Vec<u8> {
        (0..40u8).collect()
    }

    async fn seed_recovery_world(env: &TestEnv, object_id: u64) -> (ObjectInfo, StorageParams) {
        let params = StorageParams {
            max_segment_size: 40,
            redundant_data_chunk_num: 4,
            redundant_parity_chunk_num: 2,
            max_payload_size: 1024,
        };
        let secondaries = secondary_addresses(6);
        let object = ec_object(object_id, 40, secondaries.clone());
        env.consensus.insert_object(object.clone());
        register_sps(env, &secondaries);

        let shards = encode_raw_segment(&recovery_segment(), 4, 2).unwrap();
        for (idx, shard) in shards.iter().enumerate() {
            env.api
                .serve_piece(&format!("http://sec{}", idx), shard.clone());
        }
        env.db
            .set_object_integrity(&IntegrityMeta {
                object_id,
                piece_checksum_list: vec![generate_checksum(&recovery_segment())],
                ..Default::default()
            })
            .await
            .unwrap();
        (object, params)
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_primary_segment_from_secondaries() {
        let env = test_env(test_config());
        let (object, params) = seed_recovery_world(&env, 7).await;
        // two slow responders answer long after the quorum is reached
        env.api.delay("http://sec4", 50);
        env.api.delay("http://sec5", 50);

        let mut task = RecoverPieceTask::new(
            object,
            params,
            TaskPriority::Medium,
            0,
            -1,
            10,
            60,
            3,
        );
        env.executor.handle_recover_piece_task(&mut task).await;

        assert!(task.header.error.is_none(), "error: {:?}", task.header.error);
        assert!(task.recovered);
        let written = env.piece_store.get_piece(&segment_piece_key(7, 0)).await.unwrap();
        assert_eq!(written, recovery_segment());
        assert!(
            metrics::RECOVER_PIECE_TIME_HISTOGRAM
                .with_label_values(&[EXECUTOR_SERVICE_NAME])
                .get_sample_count()
                > 0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_own_chunk_from_primary() {
        let env = test_env(test_config());
        let (object, params) = seed_recovery_world(&env, 8).await;
        env.consensus.buckets.lock().unwrap().insert(
            object.bucket_name.clone(),
            BucketInfo {
                bucket_name: object.bucket_name.clone(),
                primary_sp_address: "0xprim".to_string(),
                ..Default::default()
            },
        );
        env.consensus.sp_list.lock().unwrap().push(SpInfo {
            id: 50,
            operator_address: "0xprim".to_string(),
            endpoint: "http://prim".to_string(),
            ..Default::default()
        });
        let shards = encode_raw_segment(&recovery_segment(), 4, 2).unwrap();
        env.api.serve_piece("http://prim", shards[2].clone());
        // the secondary's integrity row lists its own chunk checksums
        env.db
            .set_object_integrity(&IntegrityMeta {
                object_id: 8,
                piece_checksum_list: vec![generate_checksum(&shards[2])],
                ..Default::default()
            })
            .await
            .unwrap();

        let mut task =
            RecoverPieceTask::new(object, params, TaskPriority::Medium, 0, 2, 10, 60, 3);
        env.executor.handle_recover_piece_task(&mut task).await;

        assert!(task.header.error.is_none(), "error: {:?}", task.header.error);
        assert!(task.recovered);
        assert_eq!(
            env.piece_store.get_piece(&ec_piece_key(8, 0, 2)).await.unwrap(),
            shards[2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_rejects_replica_redundancy() {
        let env = test_env(test_config());
        let (mut object, params) = seed_recovery_world(&env, 9).await;
        object.redundancy_type = RedundancyType::Replica;
        let mut task =
            RecoverPieceTask::new(object, params, TaskPriority::Medium, 0, -1, 10, 60, 3);
        env.executor.handle_recover_piece_task(&mut task).await;
        assert_eq!(task.header.error, Some(Error::RecoveryRedundancyType));
        assert!(!task.recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_rejects_out_of_range_ec_index() {
        let env = test_env(test_config());
        let (object, params) = seed_recovery_world(&env, 10).await;
        let mut task =
            RecoverPieceTask::new(object, params, TaskPriority::Medium, 0, 6, 10, 60, 3);
        env.executor.handle_recover_piece_task(&mut task).await;
        assert_eq!(task.header.error, Some(Error::RecoveryPieceIndex));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_fails_without_quorum() {
        let env = test_env(test_config());
        let (object, params) = seed_recovery_world(&env, 11).await;
        // only three of the four required chunks are reachable
        let mut pieces = env.api.recovery_pieces.lock().unwrap();
        pieces.remove("http://sec0");
        pieces.remove("http://sec1");
        pieces.remove("http://sec5");
        drop(pieces);

        let mut task =
            RecoverPieceTask::new(object, params, TaskPriority::Medium, 0, -1, 10, 60, 3);
        env.executor.handle_recover_piece_task(&mut task).await;
        assert_eq!(task.header.error, Some(Error::RecoveryPieceNotEnough));
        assert!(!task.recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_detects_corrupted_piece() {
        let env = test_env(test_config());
        let (object, params) = seed_recovery_world(&env, 12).await;
        // all six endpoints serve garbage of the right length
        for idx in 0..6 {
            env.api
                .serve_piece(&format!("http://sec{}", idx), vec![0xAB; 10]);
        }
        let mut task =
            RecoverPieceTask::new(object, params, TaskPriority::Medium, 0, -1, 10, 60, 3);
        env.executor.handle_recover_piece_task(&mut task).await;
        assert_eq!(task.header.error, Some(Error::RecoveryPieceChecksum));
        assert!(!task.recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_ask_execute_report_cycle() {
        let env = test_env(test_config());
        let secondaries = secondary_addresses(6);
        let mut object = ec_object(20, 64, secondaries.clone());
        object.checksums = vec![declared_integrity(64, 32)];
        env.consensus.insert_object(object.clone());
        env.consensus.seal_after_polls(20, 2);
        register_sps(&env, &secondaries);
        seed_segments(&env, 20, 64, 32).await;

        env.manager
            .push_for_test(Task::ReplicatePiece(ReplicatePieceTask::new(
                object,
                ec_params(),
                TaskPriority::High,
                60,
                3,
            )))
            .unwrap();

        env.executor.ask_task().await.unwrap();

        // the combined replicate-and-seal completed and was reported back
        assert_eq!(
            env.db.upload_progress(20).unwrap().task_state,
            TaskState::SealObjectDone
        );
        assert!(!env.manager.task_uploading(20));
        assert_eq!(
            env.manager.ask_task(&wide_limit()).await.unwrap_err(),
            Error::NoTaskMatchLimit
        );
    }
}
