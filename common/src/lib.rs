pub mod checksum;
pub mod piece_key;
pub mod redundancy;
