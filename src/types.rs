use std::fmt;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn from_message(message: &OwnedMessage) -> Self {
        Self::new(message.topic().to_string(), message.partition())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Committed state of a partition handed to us on assignment: the offset
/// the broker will resume from, plus whatever metadata rode along with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    partition: Partition,
    committed_offset: i64,
    metadata: Option<String>,
}

impl PartitionAssignment {
    pub fn new(partition: Partition, committed_offset: i64, metadata: Option<String>) -> Self {
        Self {
            partition,
            committed_offset,
            metadata,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn committed_offset(&self) -> i64 {
        self.committed_offset
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }
}

/// One partition's entry in the commit map: the offset to commit (the next
/// offset the consumer expects to read) and the optional encoded
/// incomplete-offsets payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommit {
    offset: i64,
    metadata: Option<String>,
}

impl OffsetCommit {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: None,
        }
    }

    pub fn with_metadata(offset: i64, metadata: String) -> Self {
        Self {
            offset,
            metadata: Some(metadata),
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    pub(crate) fn strip_metadata(&mut self) {
        self.metadata = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_display() {
        let partition = Partition::new("events".to_string(), 7);
        assert_eq!(partition.to_string(), "events:7");
    }

    #[test]
    fn test_offset_commit_strip_metadata() {
        let mut commit = OffsetCommit::with_metadata(42, "payload".to_string());
        assert_eq!(commit.offset(), 42);
        assert_eq!(commit.metadata(), Some("payload"));

        commit.strip_metadata();
        assert_eq!(commit.offset(), 42);
        assert_eq!(commit.metadata(), None);
    }
}
