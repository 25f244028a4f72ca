// ==== Work manager metrics ====
/// Counter for records registered into the shard and commit queues
pub const WORK_REGISTERED: &str = "parallel_consumer_work_registered_total";

/// Counter for records dropped at registration because they were already
/// completed before the last commit (replay suppression)
pub const WORK_SKIPPED_PREVIOUSLY_COMPLETED: &str =
    "parallel_consumer_work_skipped_previously_completed_total";

/// Counter for work containers handed out to workers
pub const WORK_TAKEN: &str = "parallel_consumer_work_taken_total";

/// Counter for successfully processed records
pub const WORK_SUCCEEDED: &str = "parallel_consumer_work_succeeded_total";

/// Counter for failed records entering retry backoff
pub const WORK_FAILED: &str = "parallel_consumer_work_failed_total";

/// Gauge for records currently in flight
pub const WORK_IN_FLIGHT: &str = "parallel_consumer_work_in_flight";

/// Gauge for the number of active processing shards
pub const SHARDS_ACTIVE: &str = "parallel_consumer_shards_active";

/// Gauge for records staged but not yet committed
pub const WORK_AWAITING_COMMIT: &str = "parallel_consumer_work_awaiting_commit";

// ==== Offset codec metrics ====
/// Histogram for the base64 size of each partition's metadata payload
pub const OFFSET_METADATA_PAYLOAD_CHARS: &str =
    "parallel_consumer_offset_metadata_payload_chars";

/// Counter for commit rounds where all metadata was stripped for exceeding
/// the broker-side size limit
pub const OFFSET_METADATA_STRIPPED: &str = "parallel_consumer_offset_metadata_stripped_total";

/// Counter for partitions committed without metadata because no encoding
/// could represent the window
pub const OFFSET_ENCODING_UNSUPPORTED: &str =
    "parallel_consumer_offset_encoding_unsupported_total";

/// Counter for offset metadata that failed to decode on assignment
pub const OFFSET_DECODE_FAILURES: &str = "parallel_consumer_offset_decode_failures_total";

// ==== Rebalance metrics ====
/// Counter for partitions whose tracked state was dropped on revoke or loss
pub const PARTITIONS_REMOVED: &str = "parallel_consumer_partitions_removed_total";
