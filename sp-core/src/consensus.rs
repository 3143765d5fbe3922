//! Chain-access contract. Implementations may read from a validator, a full
//! node or an off-chain indexer; the control plane only depends on this
//! trait. The seal/reject listeners are provided methods built on the
//! object query, polling once per expected block.

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use crate::error::{Error, Result};
use crate::types::{
    BucketInfo, MsgDiscontinueBucket, MsgRejectSealObject, MsgSealObject, ObjectInfo,
    ObjectStatus, SpInfo, StorageParams, StreamRecord, ValidatorInfo,
};

/// Expected seconds between produced blocks; the listeners poll on this
/// cadence.
pub const EXPECTED_OUTPUT_BLOCK_INTERNAL: u64 = 2;

#[async_trait]
pub trait Consensus: Send + Sync {
    /// Current stable block height.
    async fn current_height(&self) -> Result<u64>;
    async fn has_account(&self, account: &str) -> Result<bool>;
    async fn list_sps(&self) -> Result<Vec<SpInfo>>;
    async fn list_bonded_validators(&self) -> Result<Vec<ValidatorInfo>>;

    async fn query_storage_params(&self) -> Result<StorageParams>;
    /// Storage params as of a block create time; object-bound tasks resolve
    /// their snapshot through this.
    async fn query_storage_params_by_timestamp(&self, timestamp: i64) -> Result<StorageParams>;

    async fn query_bucket_info(&self, bucket: &str) -> Result<BucketInfo>;
    async fn query_object_info(&self, bucket: &str, object: &str) -> Result<ObjectInfo>;
    async fn query_object_info_by_id(&self, object_id: u64) -> Result<ObjectInfo>;
    async fn query_bucket_info_and_object_info(
        &self,
        bucket: &str,
        object: &str,
    ) -> Result<(BucketInfo, ObjectInfo)> {
        let bucket_info = self.query_bucket_info(bucket).await?;
        let object_info = self.query_object_info(bucket, object).await?;
        Ok((bucket_info, object_info))
    }

    async fn query_payment_stream_record(&self, account: &str) -> Result<StreamRecord>;

    async fn verify_get_object_permission(
        &self,
        account: &str,
        bucket: &str,
        object: &str,
    ) -> Result<bool>;
    /// Put permission is checked against the bucket only; object-name gating
    /// happens at object creation.
    async fn verify_put_object_permission(&self, account: &str, bucket: &str) -> Result<bool>;

    async fn submit_seal_object(&self, msg: &MsgSealObject) -> Result<()>;
    async fn submit_reject_seal_object(&self, msg: &MsgRejectSealObject) -> Result<()>;
    async fn submit_discontinue_bucket(&self, msg: &MsgDiscontinueBucket) -> Result<()>;

    /// Polls the object once per expected block until it shows up sealed.
    /// Transient query errors are retried silently; the budget is
    /// `timeout_height` polls.
    async fn listen_object_seal(&self, object_id: u64, timeout_height: u32) -> Result<bool> {
        let mut last_err: Option<Error> = None;
        for _ in 0..timeout_height {
            match self.query_object_info_by_id(object_id).await {
                Err(err) => {
                    last_err = Some(err);
                    sleep(Duration::from_secs(EXPECTED_OUTPUT_BLOCK_INTERNAL)).await;
                    continue;
                }
                Ok(object_info) => {
                    last_err = None;
                    if object_info.object_status == ObjectStatus::Sealed {
                        tracing::debug!(object_id, "object sealed on chain");
                        return Ok(true);
                    }
                }
            }
            sleep(Duration::from_secs(EXPECTED_OUTPUT_BLOCK_INTERNAL)).await;
        }
        match last_err {
            None => {
                tracing::error!(object_id, "wait seal object timeout");
                Err(Error::SealTimeout)
            }
            Some(err) => {
                tracing::error!(object_id, error = %err, "failed to listen seal object");
                Err(err)
            }
        }
    }

    /// Detects rejection as the object disappearing from chain state; the
    /// `NoSuchObject` query error is the evidence.
    async fn listen_reject_unseal_object(
        &self,
        object_id: u64,
        timeout_height: u32,
    ) -> Result<bool> {
        let mut last_err: Option<Error> = None;
        for _ in 0..timeout_height {
            match self.query_object_info_by_id(object_id).await {
                Err(Error::NoSuchObject) => return Ok(true),
                Err(err) => last_err = Some(err),
                Ok(_) => last_err = None,
            }
            sleep(Duration::from_secs(EXPECTED_OUTPUT_BLOCK_INTERNAL)).await;
        }
        match last_err {
            None => {
                tracing::error!(object_id, "wait reject unseal object timeout");
                Err(Error::RejectUnsealTimeout)
            }
            Some(err) => {
                tracing::error!(object_id, error = %err, "failed to listen reject unseal object");
                Err(err)
            }
        }
    }
}

/// Chainless stub; wires the node for bring-up and tests.
#[derive(Debug, Default)]
pub struct NullConsensus;

#[async_trait]
impl Consensus for NullConsensus {
    async fn current_height(&self) -> Result<u64> {
        Ok(0)
    }
    async fn has_account(&self, _account: &str) -> Result<bool> {
        Ok(false)
    }
    async fn list_sps(&self) -> Result<Vec<SpInfo>> {
        Ok(Vec::new())
    }
    async fn list_bonded_validators(&self) -> Result<Vec<ValidatorInfo>> {
        Ok(Vec::new())
    }
    async fn query_storage_params(&self) -> Result<StorageParams> {
        Ok(StorageParams::default())
    }
    async fn query_storage_params_by_timestamp(&self, _timestamp: i64) -> Result<StorageParams> {
        Ok(StorageParams::default())
    }
    async fn query_bucket_info(&self, _bucket: &str) -> Result<BucketInfo> {
        Ok(BucketInfo::default())
    }
    async fn query_object_info(&self, _bucket: &str, _object: &str) -> Result<ObjectInfo> {
        Ok(ObjectInfo::default())
    }
    async fn query_object_info_by_id(&self, _object_id: u64) -> Result<ObjectInfo> {
        Ok(ObjectInfo::default())
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
        Ok(false)
    }
    async fn verify_put_object_permission(&self, _account: &str, _bucket: &str) -> Result<bool> {
        Ok(false)
    }
    async fn submit_seal_object(&self, _msg: &MsgSealObject) -> Result<()> {
        Ok(())
    }
    async fn submit_reject_seal_object(&self, _msg: &MsgRejectSealObject) -> Result<()> {
        Ok(())
    }
    async fn submit_discontinue_bucket(&self, _msg: &MsgDiscontinueBucket) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedChain {
        responses: Mutex<VecDeque<Result<ObjectInfo>>>,
    }

    impl ScriptedChain {
        fn new(responses: Vec<Result<ObjectInfo>>) -> Self {
            ScriptedChain {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl Consensus for ScriptedChain {
        async fn current_height(&self) -> Result<u64> {
            Ok(0)
        }
        async fn has_account(&self, _a: &str) -> Result<bool> {
            Ok(true)
        }
        async fn list_sps(&self) -> Result<Vec<SpInfo>> {
            Ok(Vec::new())
        }
        async fn list_bonded_validators(&self) -> Result<Vec<ValidatorInfo>> {
            Ok(Vec::new())
        }
        async fn query_storage_params(&self) -> Result<StorageParams> {
            Ok(StorageParams::default())
        }
        async fn query_storage_params_by_timestamp(&self, _t: i64) -> Result<StorageParams> {
            Ok(StorageParams::default())
        }
        async fn query_bucket_info(&self, _b: &str) -> Result<BucketInfo> {
            Ok(BucketInfo::default())
        }
        async fn query_object_info(&self, _b: &str, _o: &str) -> Result<ObjectInfo> {
            Ok(ObjectInfo::default())
        }
        async fn query_object_info_by_id(&self, _id: u64) -> Result<ObjectInfo> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(Error::NoSuchObject))
        }
        async fn query_payment_stream_record(&self, _a: &str) -> Result<StreamRecord> {
            Ok(StreamRecord::default())
        }
        async fn verify_get_object_permission(
            &self,
            _a: &str,
            _b: &str,
            _o: &str,
        ) -> Result<bool> {
            Ok(true)
        }
        async fn verify_put_object_permission(&self, _a: &str, _b: &str) -> Result<bool> {
            Ok(true)
        }
        async fn submit_seal_object(&self, _m: &MsgSealObject) -> Result<()> {
            Ok(())
        }
        async fn submit_reject_seal_object(&self, _m: &MsgRejectSealObject) -> Result<()> {
            Ok(())
        }
        async fn submit_discontinue_bucket(&self, _m: &MsgDiscontinueBucket) -> Result<()> {
            Ok(())
        }
    }

    fn created() -> Result<ObjectInfo> {
        Ok(ObjectInfo {
            object_status: ObjectStatus::Created,
            ..Default::default()
        })
    }

    fn sealed() -> Result<ObjectInfo> {
        Ok(ObjectInfo {
            object_status: ObjectStatus::Sealed,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_object_seal_succeeds_on_later_poll() {
        let chain = ScriptedChain::new(vec![created(), created(), sealed()]);
        assert!(chain.listen_object_seal(1, 10).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_object_seal_times_out() {
        let chain = ScriptedChain::new(vec![created(), created(), created()]);
        assert_eq!(chain.listen_object_seal(1, 3).await.unwrap_err(), Error::SealTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_object_seal_retries_transient_errors() {
        let chain = ScriptedChain::new(vec![
            Err(Error::Chain("connection reset".into())),
            created(),
            sealed(),
        ]);
        assert!(chain.listen_object_seal(1, 10).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_reject_unseal_detects_absence() {
        let chain = ScriptedChain::new(vec![created(), Err(Error::NoSuchObject)]);
        assert!(chain.listen_reject_unseal_object(1, 10).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_reject_unseal_times_out() {
        let chain = ScriptedChain::new(vec![created(), created()]);
        assert_eq!(
            chain.listen_reject_unseal_object(1, 2).await.unwrap_err(),
            Error::RejectUnsealTimeout
        );
    }
}
