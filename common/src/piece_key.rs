//! Stable piece-key encoding for the external object store. The encoding is
//! part of the on-disk contract between SPs and must never change.

/// Returns the store key of a primary segment piece.
pub fn segment_piece_key(object_id: u64, segment_idx: u32) -> String {
    format!("s{}_s{}", object_id, segment_idx)
}

/// Returns the store key of an erasure-coded piece held by a secondary SP.
pub fn ec_piece_key(object_id: u64, segment_idx: u32, replicate_idx: u32) -> String {
    format!("e{}_s{}_p{}", object_id, segment_idx, replicate_idx)
}

/// Returns how many segments an object payload splits into.
pub fn segment_piece_count(payload_size: u64, max_segment_size: u64) -> u32 {
    if payload_size == 0 || max_segment_size == 0 {
        return 0;
    }
    payload_size.div_ceil(max_segment_size) as u32
}

/// Returns the byte size of one segment; the tail segment may be short.
pub fn segment_piece_size(payload_size: u64, segment_idx: u32, max_segment_size: u64) -> i64 {
    let count = segment_piece_count(payload_size, max_segment_size);
    if segment_idx >= count {
        return 0;
    }
    if segment_idx == count - 1 {
        (payload_size - max_segment_size * (count as u64 - 1)) as i64
    } else {
        max_segment_size as i64
    }
}

/// Returns the byte size of one EC piece derived from the segment size.
pub fn ec_piece_size(
    payload_size: u64,
    segment_idx: u32,
    max_segment_size: u64,
    data_chunk_num: u32,
) -> i64 {
    let segment_size = segment_piece_size(payload_size, segment_idx, max_segment_size);
    if data_chunk_num == 0 {
        return 0;
    }
    (segment_size as u64).div_ceil(data_chunk_num as u64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_key_encoding() {
        assert_eq!(segment_piece_key(7, 0), "s7_s0");
        assert_eq!(ec_piece_key(7, 3, 2), "e7_s3_p2");
    }

    #[test]
    fn test_segment_piece_count() {
        assert_eq!(segment_piece_count(0, 16), 0);
        assert_eq!(segment_piece_count(16, 16), 1);
        assert_eq!(segment_piece_count(17, 16), 2);
        assert_eq!(segment_piece_count(48, 16), 3);
    }

    #[test]
    fn test_segment_piece_size_tail() {
        assert_eq!(segment_piece_size(40, 0, 16), 16);
        assert_eq!(segment_piece_size(40, 1, 16), 16);
        assert_eq!(segment_piece_size(40, 2, 16), 8);
        assert_eq!(segment_piece_size(40, 3, 16), 0);
    }
}
