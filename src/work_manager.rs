//! Sharded, offset-managed, order-controlled, delayed work queue.
//!
//! The broker poller pushes record batches into the inbox; the control
//! loop drains them into per-shard queues (for handing work out) and
//! per-partition commit queues (for deciding what is committable). Worker
//! threads report results back concurrently with `success` / `failed`.
//! The commit planner scans the commit queues for the highest
//! contiguously-succeeded offset per partition and encodes whatever is
//! still incomplete beyond it into the commit metadata payload, so a
//! restart does not replay work that already succeeded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{MonotonicClock, SystemClock};
use crate::inbox::WorkInbox;
use crate::metrics_const::{
    OFFSET_DECODE_FAILURES, OFFSET_ENCODING_UNSUPPORTED, OFFSET_METADATA_PAYLOAD_CHARS,
    OFFSET_METADATA_STRIPPED, PARTITIONS_REMOVED, SHARDS_ACTIVE, WORK_AWAITING_COMMIT,
    WORK_FAILED, WORK_IN_FLIGHT, WORK_REGISTERED, WORK_SKIPPED_PREVIOUSLY_COMPLETED,
    WORK_SUCCEEDED, WORK_TAKEN,
};
use crate::offset_codec::{OffsetMapCodec, MAX_METADATA_SIZE};
use crate::options::{ProcessingOrder, WorkManagerOptions};
use crate::shard::{looping_rotation, ShardKey};
use crate::types::{OffsetCommit, Partition, PartitionAssignment};
use crate::work_container::{WorkContainer, WorkState};

const MISSING_HIGH_WATER_MARK: i64 = -1;

type OffsetQueue = BTreeMap<i64, Arc<WorkContainer>>;

pub type SuccessListener = Box<dyn Fn(&Arc<WorkContainer>) + Send + Sync>;

pub struct WorkManager {
    options: WorkManagerOptions,
    codec: OffsetMapCodec,
    clock: Arc<dyn MonotonicClock>,

    inbox: WorkInbox,

    /// Queue of work per unique shard key.
    shards: DashMap<ShardKey, OffsetQueue>,

    /// Every registered record per partition, kept until its offset falls
    /// at or below a successful commit. Offsets are not guaranteed to
    /// advance one by one, so commit eligibility has to be computed from
    /// the recorded set rather than assumed.
    commit_queues: DashMap<Partition, OffsetQueue>,

    /// Offsets at or beyond the committed base which were saved as not
    /// yet complete. Restored from commit metadata on assignment, pruned
    /// when a commit succeeds.
    incomplete_offsets: DashMap<Partition, BTreeSet<i64>>,

    /// Highest offset ever observed per partition.
    high_water_marks: DashMap<Partition, AtomicI64>,

    /// Where the fair traversal resumes, to prevent shard starvation when
    /// one call cannot visit everything.
    resume_point: Mutex<Option<ShardKey>>,

    in_flight: AtomicUsize,

    /// Set whenever work completes successfully, so the committer can
    /// skip no-op commit rounds.
    dirty: AtomicBool,

    success_listeners: RwLock<Vec<SuccessListener>>,
}

impl WorkManager {
    pub fn new(options: WorkManagerOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: WorkManagerOptions, clock: Arc<dyn MonotonicClock>) -> Self {
        let codec = OffsetMapCodec::with_forced_encoding(options.forced_codec);
        Self {
            options,
            codec,
            clock,
            inbox: WorkInbox::new(),
            shards: DashMap::new(),
            commit_queues: DashMap::new(),
            incomplete_offsets: DashMap::new(),
            high_water_marks: DashMap::new(),
            resume_point: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            success_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &WorkManagerOptions {
        &self.options
    }

    /// Listener invoked after each successful completion. Registered once
    /// at setup, before workers start reporting.
    pub fn add_success_listener(
        &self,
        listener: impl Fn(&Arc<WorkContainer>) + Send + Sync + 'static,
    ) {
        self.success_listeners.write().push(Box::new(listener));
    }

    // ==== Registration ====

    /// Append a polled batch. Safe to call from the poller thread while
    /// the control loop is working.
    pub fn register_work(&self, records: Vec<OwnedMessage>) {
        self.inbox.push(records);
    }

    /// Drain the inbox into the shard and commit queues. Called from the
    /// control loop before every take-work pass; exposed for control
    /// loops that want to drain eagerly.
    pub fn drain_inbox(&self) {
        for batch in self.inbox.drain() {
            debug!("Registering {} records of work", batch.len());
            for message in batch {
                self.register_message(message);
            }
        }
    }

    fn register_message(&self, message: OwnedMessage) {
        let partition = Partition::from_message(&message);
        let offset = message.offset();

        if self.is_previously_processed(&partition, offset) {
            trace!(
                partition = %partition,
                offset,
                "Record previously processed, skipping"
            );
            metrics::counter!(
                WORK_SKIPPED_PREVIOUSLY_COMPLETED,
                "topic" => partition.topic().to_string()
            )
            .increment(1);
            return;
        }

        let shard_key = ShardKey::for_message(&message, self.options.ordering);
        let container = Arc::new(WorkContainer::new(message));

        self.raise_high_water_mark(&partition, offset);
        self.shards
            .entry(shard_key)
            .or_default()
            .insert(offset, container.clone());
        self.commit_queues
            .entry(partition.clone())
            .or_default()
            .insert(offset, container);

        metrics::counter!(WORK_REGISTERED, "topic" => partition.topic().to_string()).increment(1);
    }

    /// A record at or below the high water mark which is not saved as
    /// incomplete is already tracked (or completed before the last
    /// commit). Admitting it again would insert a fresh container over
    /// one a worker may still hold, so only offsets strictly above the
    /// watermark count as new work.
    fn is_previously_processed(&self, partition: &Partition, offset: i64) -> bool {
        if let Some(incomplete) = self.incomplete_offsets.get(partition) {
            if incomplete.contains(&offset) {
                return false;
            }
        }
        offset <= self.high_water_mark(partition)
    }

    pub fn high_water_mark(&self, partition: &Partition) -> i64 {
        self.high_water_marks
            .get(partition)
            .map(|hwm| hwm.load(Ordering::SeqCst))
            .unwrap_or(MISSING_HIGH_WATER_MARK)
    }

    fn raise_high_water_mark(&self, partition: &Partition, offset: i64) {
        self.high_water_marks
            .entry(partition.clone())
            .or_insert_with(|| AtomicI64::new(MISSING_HIGH_WATER_MARK))
            .fetch_max(offset, Ordering::SeqCst);
    }

    // ==== Take work ====

    /// Depth-first work retrieval with a fair, resumable traversal over
    /// the shards: each call begins at the shard where the previous call
    /// left off and wraps around at most once, so a busy early shard
    /// cannot starve the rest.
    pub fn take_work(&self, requested_max: usize) -> Vec<Arc<WorkContainer>> {
        self.drain_inbox();

        let cap = requested_max
            .min(self.options.max_queue)
            .min(self.options.max_beyond_base);
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        if cap <= in_flight {
            return Vec::new();
        }
        let budget = cap - in_flight;

        let now = self.clock.now();
        let mut taken: Vec<Arc<WorkContainer>> = Vec::new();

        let keys: Vec<ShardKey> = self.shards.iter().map(|entry| entry.key().clone()).collect();
        let resume = self.resume_point.lock().clone();
        let rotation = looping_rotation(keys, resume.as_ref());

        for key in rotation {
            if taken.len() >= budget {
                debug!(
                    "Work taken is now over max, stopping (saving iteration resume point {:?})",
                    key
                );
                *self.resume_point.lock() = Some(key);
                break;
            }

            let Some(shard) = self.shards.get(&key) else {
                // Shard emptied and removed since the key snapshot.
                continue;
            };

            for container in shard.values() {
                if taken.len() >= budget {
                    break;
                }

                if container.is_takeable(now) {
                    trace!(offset = container.offset(), "Taking work");
                    container.take_as_work();
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    taken.push(container.clone());
                } else {
                    trace!(
                        offset = container.offset(),
                        "Work still delayed or in flight, can't take"
                    );
                }

                match self.options.ordering {
                    // No ordering to preserve, check the next record.
                    ProcessingOrder::Unordered => continue,
                    // Nothing more can leave this shard until its head is
                    // finished.
                    ProcessingOrder::Partition | ProcessingOrder::Key => break,
                }
            }
        }

        debug!("Got {} records of work", taken.len());
        metrics::counter!(WORK_TAKEN).increment(taken.len() as u64);
        metrics::gauge!(WORK_IN_FLIGHT).set(self.in_flight.load(Ordering::SeqCst) as f64);

        taken
    }

    // ==== Completion ====

    /// Record a successful completion and release the container from its
    /// processing shard. It stays in the commit queue until a commit
    /// covers it. Idempotent: a duplicate report, or a report arriving
    /// after the partition was revoked, is a no-op.
    pub fn success(&self, container: &Arc<WorkContainer>) {
        trace!(
            offset = container.offset(),
            partition = %container.partition(),
            "Work success, removing from processing shard queue"
        );

        let was_in_flight = container.succeed();
        if was_in_flight {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.dirty.store(true, Ordering::SeqCst);

        let key = ShardKey::for_message(container.message(), self.options.ordering);
        let mut shard_emptied = false;
        if let Some(mut shard) = self.shards.get_mut(&key) {
            shard.remove(&container.offset());
            shard_emptied = shard.is_empty();
        } else {
            trace!("Shard already removed (partition revoked), nothing to clean up");
        }

        // In KEY ordering the shard key is a message key we may never see
        // again, so empty shards are garbage collected. The re-check under
        // the removal guard covers a concurrent registration.
        if shard_emptied && self.options.ordering == ProcessingOrder::Key {
            if self.shards.remove_if(&key, |_, queue| queue.is_empty()).is_some() {
                debug!("Removed empty shard (key: {:?})", key);
            }
        }

        metrics::counter!(WORK_SUCCEEDED).increment(1);
        metrics::gauge!(WORK_IN_FLIGHT).set(self.in_flight.load(Ordering::SeqCst) as f64);

        let listeners = self.success_listeners.read();
        for listener in listeners.iter() {
            listener(container);
        }
    }

    /// Record a failed attempt. The container stays in its shard and
    /// becomes takeable again once its retry delay elapses.
    pub fn failed(&self, container: &Arc<WorkContainer>) {
        let now = self.clock.now();
        let was_in_flight = container.fail(
            now,
            self.options.retry_delay,
            self.options.max_retry_delay,
        );
        if was_in_flight {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        debug!(
            offset = container.offset(),
            partition = %container.partition(),
            attempts = container.attempts(),
            "Work failed, returning to shard with backoff"
        );
        metrics::counter!(WORK_FAILED).increment(1);
        metrics::gauge!(WORK_IN_FLIGHT).set(self.in_flight.load(Ordering::SeqCst) as f64);
    }

    // ==== Commit planning ====

    /// Scan the commit queues for in-order work that has completed.
    ///
    /// For each partition this finds the highest contiguously-succeeded
    /// offset and emits `offset + 1`; anything incomplete beyond it is
    /// encoded into the entry's metadata payload so recovery can skip
    /// completed work. When nothing below the first gap has succeeded,
    /// the smallest incomplete offset is emitted so the metadata still
    /// has a valid anchor.
    ///
    /// With `remove = true` the succeeded prefix is dropped from the
    /// queues and the dirty flag is reset.
    pub fn completed_eligible_offsets(&self, remove: bool) -> HashMap<Partition, OffsetCommit> {
        trace!("Scanning for in order in-flight work that has completed");
        if remove {
            self.dirty.store(false, Ordering::SeqCst);
        }

        let mut offsets_to_send: HashMap<Partition, OffsetCommit> = HashMap::new();
        let mut total_metadata_chars = 0usize;
        let mut scanned = 0usize;
        let mut removed = 0usize;

        for mut entry in self.commit_queues.iter_mut() {
            let partition = entry.key().clone();
            let queue = entry.value_mut();
            scanned += queue.len();

            let mut commit_candidate: Option<i64> = None;
            let mut incompletes: BTreeSet<i64> = BTreeSet::new();
            // Once the scan crosses the first gap, later successes can no
            // longer move the commit offset; they are represented by
            // their absence from the incomplete set instead.
            let mut past_low_water = false;

            for (&offset, container) in queue.iter() {
                match container.state() {
                    WorkState::Succeeded if !past_low_water => {
                        commit_candidate = Some(offset);
                    }
                    WorkState::Succeeded => {}
                    WorkState::Pending | WorkState::Failed => {
                        past_low_water = true;
                        incompletes.insert(offset);
                    }
                }
            }

            let commit_offset = match (commit_candidate, incompletes.first()) {
                (Some(candidate), _) => candidate + 1,
                (None, Some(&lowest_incomplete)) => lowest_incomplete,
                (None, None) => continue,
            };

            let mut commit = OffsetCommit::new(commit_offset);
            if !incompletes.is_empty() {
                let next_expected = self.high_water_mark(&partition) + 1;
                match self
                    .codec
                    .make_metadata_payload(commit_offset, next_expected, &incompletes)
                {
                    Ok(payload) => {
                        total_metadata_chars += payload.len();
                        metrics::histogram!(OFFSET_METADATA_PAYLOAD_CHARS)
                            .record(payload.len() as f64);
                        commit = OffsetCommit::with_metadata(commit_offset, payload);
                    }
                    Err(err) => {
                        warn!(
                            partition = %partition,
                            "No encodings could be used to encode the offset map, \
                             committing without metadata (messages may be replayed on rebalance): {err}"
                        );
                        metrics::counter!(OFFSET_ENCODING_UNSUPPORTED).increment(1);
                    }
                }
            }

            if remove {
                if let Some(candidate) = commit_candidate {
                    let remaining = queue.split_off(&(candidate + 1));
                    removed += queue.len();
                    *queue = remaining;
                }
            }

            offsets_to_send.insert(partition, commit);
        }

        if total_metadata_chars > MAX_METADATA_SIZE {
            warn!(
                "Offset map data too large (size: {total_metadata_chars}, max: {MAX_METADATA_SIZE}) \
                 to fit in metadata payload - stripping offset map out"
            );
            metrics::counter!(OFFSET_METADATA_STRIPPED).increment(1);
            for commit in offsets_to_send.values_mut() {
                commit.strip_metadata();
            }
        }

        debug!(
            "Scan finished, {} entries scanned, {} completed offsets removed, coalesced to {} offset(s) to be committed",
            scanned,
            removed,
            offsets_to_send.len()
        );
        metrics::gauge!(WORK_AWAITING_COMMIT).set(self.partition_work_remaining_count() as f64);

        offsets_to_send
    }

    /// Whether a commit round would send anything. Expensive: runs a full
    /// non-destructive scan.
    pub fn has_committable_offsets(&self) -> bool {
        !self.completed_eligible_offsets(false).is_empty()
    }

    /// A commit was accepted by the broker: the low water mark rises, so
    /// restored incomplete offsets below it no longer need tracking.
    pub fn on_offset_commit_success(&self, committed: &HashMap<Partition, OffsetCommit>) {
        for (partition, commit) in committed {
            if let Some(mut incomplete) = self.incomplete_offsets.get_mut(partition) {
                let low_water = commit.offset();
                incomplete.retain(|&offset| offset >= low_water);
            }
        }
    }

    // ==== Throttling & accounting ====

    /// Whether the broker poller should stop fetching for now.
    pub fn should_throttle(&self) -> bool {
        self.is_sufficiently_loaded()
    }

    fn is_sufficiently_loaded(&self) -> bool {
        let remaining = self.partition_work_remaining_count();
        let loaded_enough = remaining > self.options.max_queue * self.options.loading_factor;
        let over_max_uncommitted = remaining > self.options.max_beyond_base;
        if loaded_enough || over_max_uncommitted {
            debug!(
                loaded_enough,
                over_max_uncommitted, "Sufficiently loaded, poller should throttle"
            );
        }
        loaded_enough || over_max_uncommitted
    }

    /// Records registered but not yet removed by a commit.
    pub fn partition_work_remaining_count(&self) -> usize {
        self.commit_queues
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    /// Records still waiting in shards to be processed (or reprocessed).
    pub fn shard_work_remaining_count(&self) -> usize {
        self.shards.iter().map(|entry| entry.value().len()).sum()
    }

    /// Shard work plus anything still sitting in the inbox.
    pub fn work_remaining_count(&self) -> usize {
        self.shard_work_remaining_count() + self.inbox.pending_count()
    }

    pub fn is_work_awaiting_processing(&self) -> bool {
        self.shard_work_remaining_count() > 0 || !self.inbox.is_empty()
    }

    pub fn is_work_awaiting_commit(&self) -> bool {
        self.commit_queues
            .iter()
            .any(|entry| !entry.value().is_empty())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn has_work_in_flight(&self) -> bool {
        self.in_flight_count() != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn is_clean(&self) -> bool {
        !self.is_dirty()
    }

    /// Look up the live container for a record, if it is still queued.
    pub fn work_container_for(&self, message: &OwnedMessage) -> Option<Arc<WorkContainer>> {
        let key = ShardKey::for_message(message, self.options.ordering);
        self.shards
            .get(&key)
            .and_then(|shard| shard.get(&message.offset()).cloned())
    }

    pub fn stats(&self) -> WorkManagerStats {
        WorkManagerStats {
            in_flight: self.in_flight_count(),
            awaiting_processing: self.work_remaining_count(),
            awaiting_commit: self.partition_work_remaining_count(),
            shard_count: self.shards.len(),
        }
    }

    // ==== Rebalance ====

    /// Restore tracked state for newly assigned partitions from their
    /// committed offset and metadata. A metadata payload that cannot be
    /// decoded drops that partition's incomplete set: everything past the
    /// bare committed offset gets replayed, which is safe.
    pub fn on_partitions_assigned(&self, assignments: &[PartitionAssignment]) {
        debug!("Partitions assigned: {:?}", assignments);
        for assignment in assignments {
            let partition = assignment.partition();
            let base = assignment.committed_offset();

            // The committed offset is the next offset to read, so the
            // highest offset seen is one below it. Registration and the
            // metadata restore raise it from there.
            self.high_water_marks
                .insert(partition.clone(), AtomicI64::new(base - 1));

            let restored = match assignment.metadata() {
                Some(payload) if !payload.is_empty() => {
                    match self.codec.decode_metadata_payload(base, payload) {
                        Ok((next_expected, incomplete)) => {
                            info!(
                                partition = %partition,
                                base,
                                next_expected,
                                incomplete = incomplete.len(),
                                "Restored incomplete offsets from commit metadata"
                            );
                            self.raise_high_water_mark(partition, next_expected - 1);
                            incomplete
                        }
                        Err(err) => {
                            error!(
                                partition = %partition,
                                "Error decoding offsets from assigned partition, dropping offset \
                                 map (will replay previously completed messages): {err}"
                            );
                            metrics::counter!(OFFSET_DECODE_FAILURES).increment(1);
                            BTreeSet::new()
                        }
                    }
                }
                _ => BTreeSet::new(),
            };
            self.incomplete_offsets.insert(partition.clone(), restored);
        }
    }

    /// Drop all tracked state for revoked partitions. In-flight work on
    /// them is discarded without waiting for its workers; their eventual
    /// `success` / `failed` calls are tolerated as no-ops.
    pub fn on_partitions_revoked(&self, partitions: &[Partition]) {
        debug!("Partitions revoked: {:?}", partitions);
        self.reset_offset_map_and_remove_work(partitions);
    }

    /// Same cleanup as a revoke, but the group already moved on.
    pub fn on_partitions_lost(&self, partitions: &[Partition]) {
        warn!("Partitions have been lost");
        debug!("Lost partitions: {:?}", partitions);
        self.reset_offset_map_and_remove_work(partitions);
    }

    fn reset_offset_map_and_remove_work(&self, partitions: &[Partition]) {
        for partition in partitions {
            self.incomplete_offsets.remove(partition);
            self.high_water_marks.remove(partition);
            if let Some((_, queue)) = self.commit_queues.remove(partition) {
                self.remove_shard_entries_for(partition, queue);
            } else {
                trace!("Removing empty commit queue");
            }
            metrics::counter!(
                PARTITIONS_REMOVED,
                "topic" => partition.topic().to_string()
            )
            .increment(1);
        }
        metrics::gauge!(SHARDS_ACTIVE).set(self.shards.len() as f64);
    }

    /// Remove the revoked partition's containers from the shard map. In
    /// partition-keyed orderings the shard is the partition, so it goes
    /// wholesale; in KEY ordering each container's shard entry is erased
    /// individually, and shards left empty are dropped. A key shard that
    /// still holds work from other partitions survives.
    fn remove_shard_entries_for(&self, partition: &Partition, queue: OffsetQueue) {
        match self.options.ordering {
            ProcessingOrder::Partition | ProcessingOrder::Unordered => {
                self.shards.remove(&ShardKey::Partition(partition.clone()));
            }
            ProcessingOrder::Key => {
                for container in queue.values() {
                    let key = ShardKey::for_message(container.message(), ProcessingOrder::Key);
                    let mut shard_emptied = false;
                    if let Some(mut shard) = self.shards.get_mut(&key) {
                        shard.remove(&container.offset());
                        shard_emptied = shard.is_empty();
                    }
                    if shard_emptied {
                        self.shards.remove_if(&key, |_, shard| shard.is_empty());
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkManagerStats {
    pub in_flight: usize,
    pub awaiting_processing: usize,
    pub awaiting_commit: usize,
    pub shard_count: usize,
}

impl WorkManagerStats {
    pub fn publish_metrics(&self) {
        metrics::gauge!(WORK_IN_FLIGHT).set(self.in_flight as f64);
        metrics::gauge!(WORK_AWAITING_COMMIT).set(self.awaiting_commit as f64);
        metrics::gauge!(SHARDS_ACTIVE).set(self.shard_count as f64);
    }
}

impl fmt::Display for WorkManagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in_flight: {}, awaiting_processing: {}, awaiting_commit: {}, shards: {}",
            self.in_flight, self.awaiting_processing, self.awaiting_commit, self.shard_count
        )
    }
}
