use lazy_static::lazy_static;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();
    pub static ref TASK_QUEUE_SIZE_GAUGE: GaugeVec = GaugeVec::new(
        Opts::new("task_queue_size", "task number resident per queue"),
        &["queue"]
    )
    .unwrap();
    pub static ref GC_BLOCK_NUMBER_GAUGE: GaugeVec = GaugeVec::new(
        Opts::new("gc_block_number", "next block height to garbage collect"),
        &["module"]
    )
    .unwrap();
    pub static ref GC_OBJECT_COUNTER: CounterVec = CounterVec::new(
        Opts::new("gc_object_total", "objects garbage collected"),
        &["module"]
    )
    .unwrap();
    pub static ref SEAL_OBJECT_FAILED_COUNTER: CounterVec = CounterVec::new(
        Opts::new("seal_object_failed_total", "objects that failed to seal"),
        &["module"]
    )
    .unwrap();
    pub static ref EXECUTOR_TASK_COUNTER: CounterVec = CounterVec::new(
        Opts::new("executor_task_total", "tasks dispatched to handlers"),
        &["task_type"]
    )
    .unwrap();
    pub static ref RUNNING_TASK_GAUGE: GaugeVec = GaugeVec::new(
        Opts::new("running_task_num", "tasks currently executing"),
        &["module"]
    )
    .unwrap();
    pub static ref REMAINING_RESOURCE_GAUGE: GaugeVec = GaugeVec::new(
        Opts::new("remaining_resource", "free capacity of the executor scope"),
        &["module", "kind"]
    )
    .unwrap();
    pub static ref CHAIN_HISTOGRAM: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chain_access_cost", "chain query latency in seconds"),
        &["method"]
    )
    .unwrap();
    pub static ref RECOVER_PIECE_TIME_HISTOGRAM: HistogramVec = HistogramVec::new(
        HistogramOpts::new("recover_piece_cost", "piece recovery latency in seconds"),
        &["module"]
    )
    .unwrap();
    pub static ref UPLOAD_STAGE_TIME_HISTOGRAM: HistogramVec = HistogramVec::new(
        HistogramOpts::new("upload_stage_cost", "upload pipeline stage latency in seconds"),
        &["stage"]
    )
    .unwrap();
}

pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(TASK_QUEUE_SIZE_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(GC_BLOCK_NUMBER_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(GC_OBJECT_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SEAL_OBJECT_FAILED_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(EXECUTOR_TASK_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RUNNING_TASK_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(REMAINING_RESOURCE_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(CHAIN_HISTOGRAM.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RECOVER_PIECE_TIME_HISTOGRAM.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(UPLOAD_STAGE_TIME_HISTOGRAM.clone()));
}
