use std::sync::Arc;

use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};

use sp_core::client::Metadata;
use sp_core::consensus::{Consensus, NullConsensus};
use sp_core::piece_store::MemPieceStore;
use sp_core::rcmgr::ResourceManager;
use sp_core::spdb::SpDb;

use sp_service::config::RuntimeConfig;
use sp_service::database::Database;
use sp_service::executor::Executor;
use sp_service::manager::Manager;
use sp_service::metrics;

use async_trait::async_trait;
use sp_core::error::Result as SpResult;
use sp_core::task::{ReceivePieceTask, RecoverPieceTask};
use sp_core::types::{Bucket, DeletedObject};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/config.toml"))]
    config: String,
}

/// Placeholder peer-SP client; the deployment wires the HTTP/gRPC transport.
struct NullSpApiClient;

#[async_trait]
impl sp_core::client::SpApiClient for NullSpApiClient {
    async fn replicate_piece(
        &self,
        _endpoint: &str,
        _task: &ReceivePieceTask,
        _data: &[u8],
    ) -> SpResult<()> {
        Ok(())
    }
    async fn done_replicate_piece(
        &self,
        _endpoint: &str,
        _task: &ReceivePieceTask,
    ) -> SpResult<Vec<u8>> {
        Ok(Vec::new())
    }
    async fn get_piece(&self, _endpoint: &str, _task: &RecoverPieceTask) -> SpResult<Vec<u8>> {
        Ok(Vec::new())
    }
    async fn sign_recovery_task(&self, _task: &RecoverPieceTask) -> SpResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Placeholder metadata index; the deployment wires the indexer client.
struct NullMetadata;

#[async_trait]
impl Metadata for NullMetadata {
    async fn list_deleted_objects_by_block_number_range(
        &self,
        _operator_address: &str,
        _start_block: u64,
        _end_block: u64,
    ) -> SpResult<(Vec<DeletedObject>, u64)> {
        Ok((Vec::new(), 0))
    }
    async fn list_expired_buckets_by_sp(
        &self,
        _create_at: i64,
        _operator_address: &str,
        _limit: i64,
    ) -> SpResult<Vec<Bucket>> {
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let runtime_config = match RuntimeConfig::from_toml(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("failed to read config {}: {}, using defaults", args.config, err);
            RuntimeConfig::new()
        }
    };

    let database = Database::new(&runtime_config.database_url)?;
    database.ensure_schema().await?;
    let db: Arc<dyn SpDb> = Arc::new(database);

    // chain, piece-store and peer transports are deployment-provided; the
    // stubs below bring the control plane up without them
    log::warn!("running with null chain/piece-store backends, wire real ones for production");
    let consensus: Arc<dyn Consensus> = Arc::new(NullConsensus);
    let piece_store = Arc::new(MemPieceStore::new());
    let api: Arc<dyn sp_core::client::SpApiClient> = Arc::new(NullSpApiClient);
    let metadata: Arc<dyn Metadata> = Arc::new(NullMetadata);

    let rcmgr = ResourceManager::new(runtime_config.executor_limit());
    let manager = Arc::new(Manager::new(
        &runtime_config,
        consensus.clone(),
        db.clone(),
        metadata.clone(),
    ));
    manager.start().await?;
    let executor = Arc::new(Executor::new(
        &runtime_config,
        &rcmgr,
        manager.clone(),
        consensus,
        piece_store,
        db,
        api,
        metadata,
    ));
    executor.start();

    metrics::init_registry();
    let metrics_addr = runtime_config.metrics_addr.as_str().parse()?;
    let make_svc = make_service_fn(move |_| {
        let registry = metrics::REGISTRY_INSTANCE.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let encoder = TextEncoder::new();
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();
                    Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                }
            }))
        }
    });
    let metrics_server = hyper::Server::bind(&metrics_addr).serve(make_svc);

    log::info!(
        "storage provider node started, operator {}, metrics on {}",
        manager.operator_address(),
        runtime_config.metrics_addr
    );

    metrics_server.await?;
    Ok(())
}
