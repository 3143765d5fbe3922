//! Contracts for the node's outward calls: piece exchange with peer SPs and
//! the metadata index. Transports (HTTP/gRPC) are deployment-provided.

use async_trait::async_trait;

use crate::error::Result;
use crate::task::{ReceivePieceTask, RecoverPieceTask};
use crate::types::{Bucket, DeletedObject};

/// Peer-SP API consumed by the executor.
#[async_trait]
pub trait SpApiClient: Send + Sync {
    /// Sends one piece copy to the secondary at `endpoint`.
    async fn replicate_piece(
        &self,
        endpoint: &str,
        task: &ReceivePieceTask,
        data: &[u8],
    ) -> Result<()>;

    /// Tells the secondary the copy stream is complete; returns its seal
    /// signature over the integrity hash.
    async fn done_replicate_piece(&self, endpoint: &str, task: &ReceivePieceTask)
        -> Result<Vec<u8>>;

    /// Fetches one piece for recovery from the SP at `endpoint`.
    async fn get_piece(&self, endpoint: &str, task: &RecoverPieceTask) -> Result<Vec<u8>>;

    /// Signs the recovery request with this SP's operator key so the remote
    /// side can verify the asker.
    async fn sign_recovery_task(&self, task: &RecoverPieceTask) -> Result<Vec<u8>>;
}

/// Metadata index consumed by the garbage-collection and discontinuation
/// loops. The index trails the chain; responses carry the block height they
/// are current to.
#[async_trait]
pub trait Metadata: Send + Sync {
    /// Objects deleted on chain inside `[start, end]`, plus the block the
    /// index has actually processed up to.
    async fn list_deleted_objects_by_block_number_range(
        &self,
        operator_address: &str,
        start_block: u64,
        end_block: u64,
    ) -> Result<(Vec<DeletedObject>, u64)>;

    /// Buckets created before `create_at` served by this SP, up to `limit`.
    async fn list_expired_buckets_by_sp(
        &self,
        create_at: i64,
        operator_address: &str,
        limit: i64,
    ) -> Result<Vec<Bucket>>;
}
