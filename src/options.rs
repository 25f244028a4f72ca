use std::time::Duration;

use crate::encodings::OffsetEncoding;

/// How strictly processing order is preserved, which doubles as the shard
/// key selection: `Unordered` and `Partition` shard by partition, `Key`
/// shards by the record key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingOrder {
    /// No ordering within a partition; everything eligible in a shard can
    /// be in flight at once.
    #[default]
    Unordered,
    /// At most one record per partition in flight at a time.
    Partition,
    /// At most one record per key in flight at a time.
    Key,
}

/// Configuration for the work manager.
#[derive(Debug, Clone)]
pub struct WorkManagerOptions {
    pub ordering: ProcessingOrder,

    /// Soft cap on concurrently staged work; also drives the throttle
    /// threshold via `loading_factor`.
    pub max_queue: usize,

    /// Hard cap on records registered but not yet committed. Protects
    /// against runaway memory when one partition stalls.
    pub max_beyond_base: usize,

    /// Multiplier applied to `max_queue` in the throttle check. The
    /// consumer already pipelines, so we don't need to pipeline much
    /// ourselves on top.
    pub loading_factor: usize,

    /// Base delay before a failed record becomes takeable again. Doubles
    /// per attempt up to `max_retry_delay`.
    pub retry_delay: Duration,

    pub max_retry_delay: Duration,

    /// Forces one offset encoding instead of picking the smallest.
    /// Testing only.
    pub forced_codec: Option<OffsetEncoding>,
}

impl Default for WorkManagerOptions {
    fn default() -> Self {
        Self {
            ordering: ProcessingOrder::default(),
            max_queue: 1_000,
            max_beyond_base: 10_000,
            loading_factor: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            forced_codec: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = WorkManagerOptions::default();
        assert_eq!(options.ordering, ProcessingOrder::Unordered);
        assert_eq!(options.loading_factor, 3);
        assert!(options.max_beyond_base >= options.max_queue);
        assert!(options.forced_codec.is_none());
    }
}
