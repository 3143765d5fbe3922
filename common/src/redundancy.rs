//! Erasure coding of object segments over GF(2^8). A segment is split into
//! `data_shards` equal chunks (zero padded) and extended with `parity_shards`
//! parity chunks; any `data_shards` surviving chunks reconstruct the segment.

use anyhow::{anyhow, Context};
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Splits a raw segment into data + parity EC pieces.
pub fn encode_raw_segment(
    segment: &[u8],
    data_shards: usize,
    parity_shards: usize,
) -> anyhow::Result<Vec<Vec<u8>>> {
    if data_shards == 0 {
        return Err(anyhow!("data shard number must be positive"));
    }
    let shard_len = segment.len().div_ceil(data_shards);
    let mut shards: Vec<Vec<u8>> = vec![vec![0u8; shard_len]; data_shards + parity_shards];
    for (i, shard) in shards.iter_mut().take(data_shards).enumerate() {
        let start = i * shard_len;
        let end = std::cmp::min(start + shard_len, segment.len());
        if start < segment.len() {
            shard[..(end - start)].copy_from_slice(&segment[start..end]);
        }
    }
    let rs = ReedSolomon::new(data_shards, parity_shards).context("init erasure codec")?;
    rs.encode(&mut shards).context("encode segment")?;
    Ok(shards)
}

/// Reconstructs a raw segment from at least `data_shards` surviving pieces.
/// Missing pieces are passed as `None`; `segment_size` trims the zero padding
/// the encoder appended to the tail shard.
pub fn decode_raw_segment(
    mut shards: Vec<Option<Vec<u8>>>,
    segment_size: i64,
    data_shards: usize,
    parity_shards: usize,
) -> anyhow::Result<Vec<u8>> {
    if shards.len() != data_shards + parity_shards {
        return Err(anyhow!(
            "expect {} shards, got {}",
            data_shards + parity_shards,
            shards.len()
        ));
    }
    let rs = ReedSolomon::new(data_shards, parity_shards).context("init erasure codec")?;
    rs.reconstruct(&mut shards).context("reconstruct segment")?;
    let mut segment = Vec::with_capacity(segment_size as usize);
    for shard in shards.into_iter().take(data_shards) {
        let shard = shard.ok_or_else(|| anyhow!("reconstructed shard missing"))?;
        segment.extend_from_slice(&shard);
    }
    segment.truncate(segment_size as usize);
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::generate_checksum;

    #[test]
    fn test_decode_with_minimum_shards() {
        let segment: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let shards = encode_raw_segment(&segment, 4, 2).unwrap();
        assert_eq!(shards.len(), 6);

        // drop two shards, decoder must still reassemble the payload
        let mut surviving: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        surviving[1] = None;
        surviving[4] = None;
        let decoded = decode_raw_segment(surviving, segment.len() as i64, 4, 2).unwrap();
        assert_eq!(decoded, segment);
        assert_eq!(generate_checksum(&decoded), generate_checksum(&segment));
    }

    #[test]
    fn test_decode_not_enough_shards() {
        let segment = vec![7u8; 64];
        let shards = encode_raw_segment(&segment, 4, 2).unwrap();
        let mut surviving: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for idx in [0, 2, 5] {
            surviving[idx] = None;
        }
        assert!(decode_raw_segment(surviving, 64, 4, 2).is_err());
    }

    #[test]
    fn test_shard_count_mismatch() {
        let shards = vec![Some(vec![0u8; 8]); 5];
        assert!(decode_raw_segment(shards, 8, 4, 2).is_err());
    }
}
