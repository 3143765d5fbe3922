//! The executor drives the worker pool: each worker asks the manager for a
//! task, reserves the task's estimated resources, runs the matching handler
//! and always reports the outcome before releasing the reservation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::time::{interval, sleep, Duration};

use sp_core::client::{Metadata, SpApiClient};
use sp_core::consensus::Consensus;
use sp_core::error::{Error, Result};
use sp_core::piece_store::PieceStore;
use sp_core::rcmgr::ResourceManager;
use sp_core::spdb::{SpDb, EXECUTOR_BEGIN_TASK, EXECUTOR_END_TASK};
use sp_core::task::Task;

use crate::config::RuntimeConfig;
use crate::manager::Manager;
use crate::metrics;

pub const EXECUTOR_SERVICE_NAME: &str = "executor";

/// Decrements an in-flight counter on every exit path.
pub(crate) struct CountGuard<'a>(pub &'a AtomicI64);

impl<'a> CountGuard<'a> {
    pub fn enter(counter: &'a AtomicI64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        CountGuard(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Executor {
    pub(crate) manager: Arc<Manager>,
    pub(crate) consensus: Arc<dyn Consensus>,
    pub(crate) piece_store: Arc<dyn PieceStore>,
    pub(crate) db: Arc<dyn SpDb>,
    pub(crate) api: Arc<dyn SpApiClient>,
    pub(crate) metadata: Arc<dyn Metadata>,
    pub(crate) scope: sp_core::rcmgr::ResourceScope,
    pub(crate) operator_address: String,

    pub(crate) max_execute_num: i64,
    pub(crate) ask_task_interval: u64,
    pub(crate) listen_seal_timeout_height: u32,
    pub(crate) listen_seal_retry_timeout: u64,
    pub(crate) max_listen_seal_retry: u32,
    statistics_output_interval: u64,

    executing_num: AtomicI64,
    doing_replicate_piece_task_cnt: AtomicI64,
    doing_seal_object_task_cnt: AtomicI64,
    doing_receive_piece_task_cnt: AtomicI64,
    doing_gc_object_task_cnt: AtomicI64,
    doing_gc_zombie_task_cnt: AtomicI64,
    doing_gc_meta_task_cnt: AtomicI64,
    doing_recovery_piece_task_cnt: AtomicI64,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &RuntimeConfig,
        rcmgr: &ResourceManager,
        manager: Arc<Manager>,
        consensus: Arc<dyn Consensus>,
        piece_store: Arc<dyn PieceStore>,
        db: Arc<dyn SpDb>,
        api: Arc<dyn SpApiClient>,
        metadata: Arc<dyn Metadata>,
    ) -> Self {
        rcmgr.set_service_limit(EXECUTOR_SERVICE_NAME, config.executor_limit());
        let scope = rcmgr.open_service(EXECUTOR_SERVICE_NAME);
        Executor {
            manager,
            consensus,
            piece_store,
            db,
            api,
            metadata,
            scope,
            operator_address: config.operator_address.clone(),
            max_execute_num: config.max_execute_num,
            ask_task_interval: config.ask_task_interval.max(1),
            listen_seal_timeout_height: config.listen_seal_timeout_height,
            listen_seal_retry_timeout: config.listen_seal_retry_timeout,
            max_listen_seal_retry: config.max_listen_seal_retry,
            statistics_output_interval: config.statistics_output_interval,
            executing_num: AtomicI64::new(0),
            doing_replicate_piece_task_cnt: AtomicI64::new(0),
            doing_seal_object_task_cnt: AtomicI64::new(0),
            doing_receive_piece_task_cnt: AtomicI64::new(0),
            doing_gc_object_task_cnt: AtomicI64::new(0),
            doing_gc_zombie_task_cnt: AtomicI64::new(0),
            doing_gc_meta_task_cnt: AtomicI64::new(0),
            doing_recovery_piece_task_cnt: AtomicI64::new(0),
        }
    }

    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.max_execute_num {
            let executor = self.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(err) = executor.ask_task().await {
                        if !err.is_omitted() {
                            log::error!("failed to ask task: {}", err);
                        }
                        let sleep_ms =
                            rand::thread_rng().gen_range(1..=executor.ask_task_interval);
                        sleep(Duration::from_millis(sleep_ms)).await;
                    }
                }
            });
        }
        let executor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(executor.statistics_output_interval));
            loop {
                ticker.tick().await;
                log::info!("{}", executor.statistics());
            }
        });
    }

    /// One ask-reserve-execute-report-release cycle.
    pub async fn ask_task(self: &Arc<Self>) -> Result<()> {
        let _executing = CountGuard::enter(&self.executing_num);
        let limit = self.scope.remaining_resource();
        metrics::REMAINING_RESOURCE_GAUGE
            .with_label_values(&[EXECUTOR_SERVICE_NAME, "memory"])
            .set(limit.memory as f64);
        metrics::REMAINING_RESOURCE_GAUGE
            .with_label_values(&[EXECUTOR_SERVICE_NAME, "task_total"])
            .set(limit.num_tasks_total as f64);
        metrics::REMAINING_RESOURCE_GAUGE
            .with_label_values(&[EXECUTOR_SERVICE_NAME, "task_high"])
            .set(limit.num_tasks_high as f64);
        metrics::REMAINING_RESOURCE_GAUGE
            .with_label_values(&[EXECUTOR_SERVICE_NAME, "task_medium"])
            .set(limit.num_tasks_medium as f64);
        metrics::REMAINING_RESOURCE_GAUGE
            .with_label_values(&[EXECUTOR_SERVICE_NAME, "task_low"])
            .set(limit.num_tasks_low as f64);

        let mut task = self.manager.ask_task(&limit).await?;
        let mut span = self.scope.begin_span();
        if let Err(err) = span.reserve_resources(&task.estimate_limit()) {
            log::error!(
                "failed to reserve resource for task {}: {}",
                task.info(),
                err
            );
            return Err(err);
        }
        metrics::RUNNING_TASK_GAUGE
            .with_label_values(&[EXECUTOR_SERVICE_NAME])
            .set(self.executing_num.load(Ordering::SeqCst) as f64);

        self.dispatch(&mut task).await;
        if let Err(err) = self.manager.report_task(task).await {
            if err == Error::CanceledTask {
                log::info!("task report answered with cancel");
            } else {
                log::error!("failed to report task: {}", err);
            }
        }
        span.done();
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, task: &mut Task) {
        match task {
            Task::ReplicatePiece(t) => {
                metrics::EXECUTOR_TASK_COUNTER
                    .with_label_values(&["replicate_piece"])
                    .inc();
                let _doing = CountGuard::enter(&self.doing_replicate_piece_task_cnt);
                metrics::UPLOAD_STAGE_TIME_HISTOGRAM
                    .with_label_values(&["schedule_replicate"])
                    .observe((sp_core::task::get_timestamp() - t.header.create_time) as f64);
                let object_id = t.object_info.id;
                let key = t.key();
                let _ = self
                    .db
                    .insert_upload_event(object_id, EXECUTOR_BEGIN_TASK, &key)
                    .await;
                self.handle_replicate_piece_task(t).await;
                let detail = match &t.header.error {
                    Some(err) => format!("{}:{}", key, err),
                    None => key,
                };
                let _ = self
                    .db
                    .insert_upload_event(object_id, EXECUTOR_END_TASK, &detail)
                    .await;
            }
            Task::SealObject(t) => {
                metrics::EXECUTOR_TASK_COUNTER
                    .with_label_values(&["seal_object"])
                    .inc();
                let _doing = CountGuard::enter(&self.doing_seal_object_task_cnt);
                let object_id = t.object_info.id;
                let key = t.key();
                let _ = self
                    .db
                    .insert_upload_event(object_id, EXECUTOR_BEGIN_TASK, &key)
                    .await;
                self.handle_seal_object_task(t).await;
                let detail = match &t.header.error {
                    Some(err) => format!("{}:{}", key, err),
                    None => key,
                };
                let _ = self
                    .db
                    .insert_upload_event(object_id, EXECUTOR_END_TASK, &detail)
                    .await;
            }
            Task::ReceivePiece(t) => {
                metrics::EXECUTOR_TASK_COUNTER
                    .with_label_values(&["receive_piece"])
                    .inc();
                let _doing = CountGuard::enter(&self.doing_receive_piece_task_cnt);
                self.handle_receive_piece_task(t).await;
            }
            Task::GcObject(t) => {
                metrics::EXECUTOR_TASK_COUNTER
                    .with_label_values(&["gc_object"])
                    .inc();
                let _doing = CountGuard::enter(&self.doing_gc_object_task_cnt);
                self.handle_gc_object_task(t).await;
            }
            Task::GcZombiePiece(t) => {
                metrics::EXECUTOR_TASK_COUNTER
                    .with_label_values(&["gc_zombie"])
                    .inc();
                let _doing = CountGuard::enter(&self.doing_gc_zombie_task_cnt);
                self.handle_gc_zombie_piece_task(t).await;
            }
            Task::GcMeta(t) => {
                metrics::EXECUTOR_TASK_COUNTER
                    .with_label_values(&["gc_meta"])
                    .inc();
                let _doing = CountGuard::enter(&self.doing_gc_meta_task_cnt);
                self.handle_gc_meta_task(t).await;
            }
            Task::RecoverPiece(t) => {
                metrics::EXECUTOR_TASK_COUNTER
                    .with_label_values(&["recover_piece"])
                    .inc();
                let _doing = CountGuard::enter(&self.doing_recovery_piece_task_cnt);
                self.handle_recover_piece_task(t).await;
            }
            _ => {
                log::error!("unsupported task type {}", task.info());
                task.set_error(Some(Error::TypeMismatch));
            }
        }
        tracing::debug!("finish to handle task {}", task.info());
    }

    pub fn statistics(&self) -> String {
        format!(
            "maxAsk[{}], asking[{}], replicate[{}], seal[{}], receive[{}], gcObject[{}], gcZombie[{}], gcMeta[{}], recovery[{}]",
            self.max_execute_num,
            self.executing_num.load(Ordering::SeqCst),
            self.doing_replicate_piece_task_cnt.load(Ordering::SeqCst),
            self.doing_seal_object_task_cnt.load(Ordering::SeqCst),
            self.doing_receive_piece_task_cnt.load(Ordering::SeqCst),
            self.doing_gc_object_task_cnt.load(Ordering::SeqCst),
            self.doing_gc_zombie_task_cnt.load(Ordering::SeqCst),
            self.doing_gc_meta_task_cnt.load(Ordering::SeqCst),
            self.doing_recovery_piece_task_cnt.load(Ordering::SeqCst),
        )
    }
}
