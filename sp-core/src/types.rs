//! Chain data types consumed by the control plane. These mirror the on-chain
//! records the node queries; only the fields the scheduler and workers read
//! are carried.

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStatus {
    #[default]
    Created,
    Sealed,
    Discontinued,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedundancyType {
    #[default]
    Ec,
    Replica,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: u64,
    pub bucket_name: String,
    pub object_name: String,
    pub owner: String,
    pub payload_size: u64,
    /// Unix seconds of object creation; resolves the storage params snapshot.
    pub create_at: i64,
    pub object_status: ObjectStatus,
    pub redundancy_type: RedundancyType,
    pub secondary_sp_addresses: Vec<String>,
    /// Integrity hashes declared at object creation; index 0 belongs to the
    /// primary SP, the workers verify stored payload against it.
    pub checksums: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub id: u64,
    pub bucket_name: String,
    pub owner: String,
    pub primary_sp_address: String,
    pub create_at: i64,
}

/// Listing element of the metadata bucket queries.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub bucket_info: BucketInfo,
}

/// Versioned storage params resolved at object create time. Tasks snapshot
/// these at creation and never re-query them during execution; params may
/// change on chain while a task is in flight.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageParams {
    pub max_segment_size: u64,
    pub redundant_data_chunk_num: u32,
    pub redundant_parity_chunk_num: u32,
    pub max_payload_size: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpInfo {
    pub id: u32,
    pub operator_address: String,
    pub funding_address: String,
    pub approval_address: String,
    pub endpoint: String,
    pub moniker: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub operator_address: String,
    pub bonded_tokens: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub account: String,
    pub static_balance: i64,
    pub netflow_rate: i64,
    pub settle_timestamp: i64,
}

/// An object the chain deleted inside a block range, as listed by the
/// metadata service for garbage collection.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedObject {
    pub object_info: ObjectInfo,
    pub delete_at: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCreateBucket {
    pub creator: String,
    pub bucket_name: String,
    pub primary_sp_address: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCreateObject {
    pub creator: String,
    pub bucket_name: String,
    pub object_name: String,
    pub payload_size: u64,
    pub checksums: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSealObject {
    pub operator: String,
    pub bucket_name: String,
    pub object_name: String,
    pub secondary_sp_addresses: Vec<String>,
    pub secondary_sp_signatures: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRejectSealObject {
    pub bucket_name: String,
    pub object_name: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgDiscontinueBucket {
    pub bucket_name: String,
    pub reason: String,
}
