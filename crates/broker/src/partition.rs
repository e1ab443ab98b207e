//! Key-to-partition routing and group partition assignment.

/// Partition for `key` among `partitions`.
///
/// CRC-32 keeps the mapping stable across processes and releases; equal keys
/// always map to the same partition.
pub fn partition_for(key: &[u8], partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    crc32fast::hash(key) % partitions
}

/// Stream name backing one partition of a topic.
pub fn stream_key(topic: &str, partition: u32) -> String {
    format!("{}:{}", topic, partition)
}

/// Partitions owned by `member_index` under round-robin assignment.
pub fn assigned_partitions(partitions: u32, member_index: u32, member_count: u32) -> Vec<u32> {
    let members = member_count.max(1);
    (0..partitions).filter(|p| p % members == member_index).collect()
}
