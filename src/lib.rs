//! Work manager and offset-map codec for a parallel Kafka consumer.
//!
//! The work manager is a sharded, offset-managed, order-controlled, delayed
//! work queue: the broker poller pushes record batches in, worker threads
//! pull work out via [`WorkManager::take_work`] and report back with
//! [`WorkManager::success`] / [`WorkManager::failed`], and the committer
//! pulls a per-partition commit map from
//! [`WorkManager::completed_eligible_offsets`].
//!
//! Because records complete in arbitrary order, the commit map carries the
//! set of still-incomplete offsets encoded into the commit metadata field,
//! so that crash recovery does not replay records that already succeeded.
//! The codec family lives in [`encodings`] and [`offset_codec`].

pub mod clock;
pub mod encodings;
pub mod errors;
pub mod inbox;
pub mod metrics_const;
pub mod offset_codec;
pub mod options;
pub mod shard;
pub mod types;
pub mod work_container;
pub mod work_manager;

pub use clock::{ManualClock, MonotonicClock, SystemClock};
pub use encodings::OffsetEncoding;
pub use errors::OffsetCodecError;
pub use offset_codec::OffsetMapCodec;
pub use options::{ProcessingOrder, WorkManagerOptions};
pub use types::{OffsetCommit, Partition, PartitionAssignment};
pub use work_container::{WorkContainer, WorkState};
pub use work_manager::{WorkManager, WorkManagerStats};
