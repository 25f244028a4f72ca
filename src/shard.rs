//! Shard keys and the fair traversal order over them.
//!
//! A shard is the unit of parallelism: ordering holds within a shard and
//! nowhere else. The key is the partition in `Unordered` and `Partition`
//! ordering, and the record key in `Key` ordering.

use rdkafka::message::OwnedMessage;
use rdkafka::Message;

use crate::options::ProcessingOrder;
use crate::types::Partition;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShardKey {
    Partition(Partition),
    /// The record key, `None` for keyless records (which all share one
    /// shard in `Key` ordering).
    MessageKey(Option<Vec<u8>>),
}

impl ShardKey {
    pub fn for_message(message: &OwnedMessage, ordering: ProcessingOrder) -> Self {
        match ordering {
            ProcessingOrder::Key => ShardKey::MessageKey(message.key().map(<[u8]>::to_vec)),
            ProcessingOrder::Partition | ProcessingOrder::Unordered => {
                ShardKey::Partition(Partition::from_message(message))
            }
        }
    }
}

/// Sort `keys` and rotate them so traversal starts at `resume` (or the
/// first key ordered at or after it, if the resume shard has since been
/// removed) and wraps around exactly once. Keys created after the
/// snapshot was taken are simply not in the rotation; they get their
/// turn on the next traversal.
pub(crate) fn looping_rotation(mut keys: Vec<ShardKey>, resume: Option<&ShardKey>) -> Vec<ShardKey> {
    keys.sort_unstable();
    if keys.is_empty() {
        return keys;
    }
    if let Some(resume) = resume {
        let start = keys.partition_point(|key| key < resume) % keys.len();
        keys.rotate_left(start);
    }
    keys
}
