//! Per-range consensus groups.
//!
//! Each range runs one consensus group across its replicas: a leader
//! appends commands to a replicated log, followers acknowledge, and a
//! quorum advances the commit index. Committed entries are handed to the
//! owning replica's apply loop in log order; the group itself never
//! touches MVCC state.
//!
//! Log entries and hard state (term, vote, commit) persist under the
//! range-local keys, so a restarted store rebuilds groups from the engine.
//! Leadership is explicit: the bootstrap path and the store campaign when
//! a range needs a leader, and a deposed leader's uncommitted proposals
//! are handed back for re-proposal.

use crate::api::data::{RangeId, ReplicaDescriptor, ReplicaId, StoreId};
use crate::core::error::{Error, Result};
use crate::storage::engine::{Engine, WriteBatch};
use crate::storage::keys;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Persisted consensus state for one replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: Option<ReplicaId>,
    pub commit: u64,
}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// Encoded range command; opaque to the consensus layer.
    pub command: Vec<u8>,
}

/// State transferred to a follower too far behind the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeSnapshot {
    pub range_id: RangeId,
    pub last_index: u64,
    pub last_term: u64,
    /// Raw engine records covering the range (data span plus range-local
    /// keys), as collected by the leader's replica.
    pub pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Messages exchanged between replicas of one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    Append {
        term: u64,
        leader: ReplicaDescriptor,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit: u64,
    },
    AppendResp {
        term: u64,
        success: bool,
        match_index: u64,
    },
    Vote {
        term: u64,
        candidate: ReplicaDescriptor,
        last_index: u64,
        last_term: u64,
    },
    VoteResp {
        term: u64,
        granted: bool,
    },
    Snapshot {
        term: u64,
        leader: ReplicaDescriptor,
        snapshot: RangeSnapshot,
    },
}

/// A routed message between two replicas of a range.
#[derive(Debug, Clone)]
pub struct RaftEnvelope {
    pub range_id: RangeId,
    pub from: ReplicaDescriptor,
    pub to: ReplicaDescriptor,
    pub message: RaftMessage,
}

/// Transport delivering envelopes to peer stores.
pub trait RaftTransport: Send + Sync {
    fn send(&self, envelope: RaftEnvelope);
}

/// In-process transport: a registry of per-store channels.
#[derive(Default)]
pub struct LocalTransport {
    routes: parking_lot::RwLock<HashMap<StoreId, mpsc::UnboundedSender<RaftEnvelope>>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a store's inbound channel.
    pub fn listen(&self, store_id: StoreId) -> mpsc::UnboundedReceiver<RaftEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().insert(store_id, tx);
        rx
    }

    /// Drop a store's route (it stops receiving).
    pub fn disconnect(&self, store_id: StoreId) {
        self.routes.write().remove(&store_id);
    }
}

impl RaftTransport for LocalTransport {
    fn send(&self, envelope: RaftEnvelope) {
        let routes = self.routes.read();
        if let Some(tx) = routes.get(&envelope.to.store_id) {
            // A closed receiver means the peer store is gone; the leader
            // will keep retrying through normal append traffic.
            let _ = tx.send(envelope);
        }
    }
}

/// Events surfaced to the owning replica.
#[derive(Debug)]
pub enum RaftEvent {
    /// Entries committed in log order; apply exactly once.
    Committed(Vec<LogEntry>),
    /// This (leader) replica must send a snapshot to the named follower.
    SnapshotNeeded(ReplicaDescriptor),
    /// A snapshot was accepted; the replica must install the contained
    /// engine records and reset its applied index.
    InstallSnapshot(RangeSnapshot),
    /// Commands whose log slots were lost to another leader; the pipeline
    /// re-proposes them.
    Reproposal(Vec<Vec<u8>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

struct PeerProgress {
    next_index: u64,
    match_index: u64,
}

struct GroupState {
    role: Role,
    hard: HardState,
    leader: Option<ReplicaDescriptor>,
    peers: Vec<ReplicaDescriptor>,
    progress: HashMap<ReplicaId, PeerProgress>,
    votes: u32,

    /// In-memory log mirror; `first_index` is the index of `entries[0]`.
    entries: Vec<LogEntry>,
    first_index: u64,

    /// Last index handed to the apply channel.
    delivered: u64,
}

impl GroupState {
    fn last_index(&self) -> u64 {
        self.first_index + self.entries.len() as u64 - 1
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        Some(self.entries[(index - self.first_index) as usize].term)
    }

    fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        if index < self.first_index {
            return Vec::new();
        }
        self.entries[(index - self.first_index) as usize..].to_vec()
    }

    fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }
}

/// One replica's view of its range's consensus group.
pub struct RaftGroup {
    range_id: RangeId,
    this: ReplicaDescriptor,
    engine: Arc<dyn Engine>,
    transport: Arc<dyn RaftTransport>,
    events_tx: mpsc::UnboundedSender<RaftEvent>,
    state: Mutex<GroupState>,
}

impl RaftGroup {
    /// Create a group, recovering hard state and log from the engine.
    pub fn new(
        range_id: RangeId,
        this: ReplicaDescriptor,
        peers: Vec<ReplicaDescriptor>,
        engine: Arc<dyn Engine>,
        transport: Arc<dyn RaftTransport>,
        applied_index: u64,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RaftEvent>)> {
        let hard: HardState = match engine.get(&keys::range_hard_state_key(range_id))? {
            Some(raw) => bincode::deserialize(&raw)
                .map_err(|e| Error::internal(format!("decode hard state: {}", e)))?,
            None => HardState::default(),
        };

        let log_prefix = keys::range_log_prefix(range_id);
        let mut entries = Vec::new();
        for (_, raw) in engine.scan(&log_prefix, &keys::prefix_end(&log_prefix), 0)? {
            let entry: LogEntry = bincode::deserialize(&raw)
                .map_err(|e| Error::internal(format!("decode log entry: {}", e)))?;
            entries.push(entry);
        }
        let first_index = entries.first().map(|e| e.index).unwrap_or(applied_index + 1);

        let progress = peers
            .iter()
            .map(|p| {
                (
                    p.replica_id,
                    PeerProgress {
                        next_index: 1,
                        match_index: 0,
                    },
                )
            })
            .collect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let group = Self {
            range_id,
            this,
            engine,
            transport,
            events_tx,
            state: Mutex::new(GroupState {
                role: Role::Follower,
                hard,
                leader: None,
                peers,
                progress,
                votes: 0,
                entries,
                first_index,
                // Committed-but-unapplied entries re-deliver on startup;
                // the applied index makes re-application a no-op.
                delivered: applied_index,
            }),
        };
        Ok((group, events_rx))
    }

    /// The replica this group belongs to.
    pub fn replica(&self) -> ReplicaDescriptor {
        self.this
    }

    /// The current known leader, if any.
    pub fn leader(&self) -> Option<ReplicaDescriptor> {
        self.state.lock().leader
    }

    /// Whether this replica currently leads the group.
    pub fn is_leader(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    /// Current term.
    pub fn term(&self) -> u64 {
        self.state.lock().hard.term
    }

    /// Replace the peer set after a replica change.
    pub fn set_peers(&self, peers: Vec<ReplicaDescriptor>) {
        let mut state = self.state.lock();
        for p in &peers {
            // A brand-new peer starts from the beginning of the log; if
            // the log has been truncated past that point, the next append
            // attempt triggers a snapshot instead.
            state.progress.entry(p.replica_id).or_insert(PeerProgress {
                next_index: 1,
                match_index: 0,
            });
        }
        state
            .progress
            .retain(|id, _| peers.iter().any(|p| p.replica_id == *id));
        state.peers = peers;
    }

    /// Start an election for this replica.
    pub fn campaign(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.hard.term += 1;
        state.hard.vote = Some(self.this.replica_id);
        state.role = Role::Candidate;
        state.votes = 1;
        state.leader = None;
        self.persist_hard(&state)?;

        if state.votes as usize >= state.quorum() {
            self.become_leader(&mut state);
            return Ok(());
        }
        let (term, last_index) = (state.hard.term, state.last_index());
        let last_term = state.term_at(last_index).unwrap_or(0);
        for peer in state.peers.clone() {
            if peer.replica_id == self.this.replica_id {
                continue;
            }
            self.transport.send(RaftEnvelope {
                range_id: self.range_id,
                from: self.this,
                to: peer,
                message: RaftMessage::Vote {
                    term,
                    candidate: self.this,
                    last_index,
                    last_term,
                },
            });
        }
        Ok(())
    }

    /// Propose a command. Returns the log index it was appended at.
    pub fn propose(&self, command: Vec<u8>) -> Result<u64> {
        let mut state = self.state.lock();
        if state.role != Role::Leader {
            return Err(Error::NotLeader {
                replica: Some(self.this),
                leader: state.leader,
            });
        }
        let index = state.last_index() + 1;
        let entry = LogEntry {
            index,
            term: state.hard.term,
            command,
        };
        self.persist_entries(std::slice::from_ref(&entry))?;
        state.entries.push(entry);
        self.replicate(&mut state)?;
        Ok(index)
    }

    /// Handle one inbound message.
    pub fn step(&self, from: ReplicaDescriptor, message: RaftMessage) -> Result<()> {
        let mut state = self.state.lock();
        match message {
            RaftMessage::Vote {
                term,
                candidate,
                last_index,
                last_term,
            } => {
                if term > state.hard.term {
                    self.become_follower(&mut state, term, None)?;
                }
                let our_last = state.last_index();
                let our_last_term = state.term_at(our_last).unwrap_or(0);
                let up_to_date =
                    (last_term, last_index) >= (our_last_term, our_last);
                let granted = term == state.hard.term
                    && up_to_date
                    && state
                        .hard
                        .vote
                        .map(|v| v == candidate.replica_id)
                        .unwrap_or(true);
                if granted && state.hard.vote.is_none() {
                    state.hard.vote = Some(candidate.replica_id);
                    self.persist_hard(&state)?;
                }
                self.send(from, RaftMessage::VoteResp { term: state.hard.term, granted });
            }
            RaftMessage::VoteResp { term, granted } => {
                if term > state.hard.term {
                    self.become_follower(&mut state, term, None)?;
                } else if state.role == Role::Candidate && term == state.hard.term && granted {
                    state.votes += 1;
                    if state.votes as usize >= state.quorum() {
                        self.become_leader(&mut state);
                    }
                }
            }
            RaftMessage::Append {
                term,
                leader,
                prev_index,
                prev_term,
                entries,
                commit,
            } => {
                if term < state.hard.term {
                    self.send(
                        from,
                        RaftMessage::AppendResp {
                            term: state.hard.term,
                            success: false,
                            match_index: 0,
                        },
                    );
                    return Ok(());
                }
                self.become_follower(&mut state, term, Some(leader))?;

                let matches = match state.term_at(prev_index) {
                    Some(t) => t == prev_term,
                    // A prev_index below our truncation floor is covered
                    // by the snapshot we installed.
                    None => prev_index < state.first_index,
                };
                if !matches {
                    let match_hint = state.last_index();
                    self.send(
                        from,
                        RaftMessage::AppendResp {
                            term: state.hard.term,
                            success: false,
                            match_index: match_hint,
                        },
                    );
                    return Ok(());
                }

                if !entries.is_empty() {
                    self.append_entries(&mut state, entries)?;
                }
                let new_commit = commit.min(state.last_index());
                if new_commit > state.hard.commit {
                    state.hard.commit = new_commit;
                    self.persist_hard(&state)?;
                    self.deliver_committed(&mut state);
                }
                let match_index = state.last_index();
                self.send(
                    from,
                    RaftMessage::AppendResp {
                        term: state.hard.term,
                        success: true,
                        match_index,
                    },
                );
            }
            RaftMessage::AppendResp {
                term,
                success,
                match_index,
            } => {
                if term > state.hard.term {
                    self.become_follower(&mut state, term, None)?;
                    return Ok(());
                }
                if state.role != Role::Leader || term != state.hard.term {
                    return Ok(());
                }
                if success {
                    if let Some(p) = state.progress.get_mut(&from.replica_id) {
                        p.match_index = p.match_index.max(match_index);
                        p.next_index = p.match_index + 1;
                    }
                    self.advance_commit(&mut state)?;
                } else {
                    let first = state.first_index;
                    let needs_snapshot = {
                        let p = state.progress.get_mut(&from.replica_id);
                        match p {
                            Some(p) => {
                                p.next_index = (match_index + 1).min(p.next_index.saturating_sub(1)).max(1);
                                p.next_index < first
                            }
                            None => false,
                        }
                    };
                    if needs_snapshot {
                        let _ = self.events_tx.send(RaftEvent::SnapshotNeeded(from));
                    } else {
                        self.send_append_to(&state, from)?;
                    }
                }
            }
            RaftMessage::Snapshot {
                term,
                leader,
                snapshot,
            } => {
                if term < state.hard.term {
                    return Ok(());
                }
                self.become_follower(&mut state, term, Some(leader))?;
                if snapshot.last_index <= state.hard.commit {
                    return Ok(());
                }
                state.first_index = snapshot.last_index + 1;
                state.entries.clear();
                state.hard.commit = snapshot.last_index;
                state.delivered = snapshot.last_index;
                self.persist_hard(&state)?;
                let match_index = snapshot.last_index;
                let _ = self.events_tx.send(RaftEvent::InstallSnapshot(snapshot));
                self.send(
                    from,
                    RaftMessage::AppendResp {
                        term: state.hard.term,
                        success: true,
                        match_index,
                    },
                );
            }
        }
        Ok(())
    }

    /// Truncate the log below `index` (exclusive). Applied state up to the
    /// truncation point must already be durable.
    pub fn truncate_log(&self, index: u64) -> Result<()> {
        let mut state = self.state.lock();
        if index <= state.first_index {
            return Ok(());
        }
        let cut = index.min(state.hard.commit + 1);
        let mut batch = WriteBatch::new();
        for i in state.first_index..cut {
            batch.delete(keys::range_log_entry_key(self.range_id, i));
        }
        self.engine.write(batch)?;
        let drain_count = (cut - state.first_index) as usize;
        state.entries.drain(..drain_count);
        state.first_index = cut;
        Ok(())
    }

    /// Build the metadata half of a snapshot at the current commit point.
    /// The caller supplies the engine records.
    pub fn snapshot_meta(&self) -> (u64, u64) {
        let state = self.state.lock();
        let last = state.hard.commit;
        (last, state.term_at(last).unwrap_or(0))
    }

    /// Send an assembled snapshot to a follower.
    pub fn send_snapshot(&self, to: ReplicaDescriptor, snapshot: RangeSnapshot) {
        let state = self.state.lock();
        self.transport.send(RaftEnvelope {
            range_id: self.range_id,
            from: self.this,
            to,
            message: RaftMessage::Snapshot {
                term: state.hard.term,
                leader: self.this,
                snapshot,
            },
        });
    }

    // --- internals -------------------------------------------------------

    fn send(&self, to: ReplicaDescriptor, message: RaftMessage) {
        self.transport.send(RaftEnvelope {
            range_id: self.range_id,
            from: self.this,
            to,
            message,
        });
    }

    fn persist_hard(&self, state: &GroupState) -> Result<()> {
        let raw = bincode::serialize(&state.hard)
            .map_err(|e| Error::internal(format!("encode hard state: {}", e)))?;
        self.engine
            .put(&keys::range_hard_state_key(self.range_id), raw)
    }

    fn persist_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut batch = WriteBatch::new();
        for entry in entries {
            let raw = bincode::serialize(entry)
                .map_err(|e| Error::internal(format!("encode log entry: {}", e)))?;
            batch.put(keys::range_log_entry_key(self.range_id, entry.index), raw);
        }
        self.engine.write(batch)
    }

    fn become_follower(
        &self,
        state: &mut GroupState,
        term: u64,
        leader: Option<ReplicaDescriptor>,
    ) -> Result<()> {
        let was_leader = state.role == Role::Leader;
        if term > state.hard.term {
            state.hard.term = term;
            state.hard.vote = None;
            self.persist_hard(state)?;
        }
        state.role = Role::Follower;
        if leader.is_some() {
            state.leader = leader;
        }
        if was_leader {
            // Any uncommitted tail may be overwritten by the new leader;
            // hand the commands back for re-proposal through it.
            let pending: Vec<Vec<u8>> = state
                .entries_from(state.hard.commit + 1)
                .into_iter()
                .map(|e| e.command)
                .collect();
            if !pending.is_empty() {
                let _ = self.events_tx.send(RaftEvent::Reproposal(pending));
            }
        }
        Ok(())
    }

    fn become_leader(&self, state: &mut GroupState) {
        debug!(range_id = %self.range_id, replica = %self.this, term = state.hard.term, "became leader");
        state.role = Role::Leader;
        state.leader = Some(self.this);
        let next = state.last_index() + 1;
        for p in state.progress.values_mut() {
            p.next_index = next;
            p.match_index = 0;
        }
        if let Err(e) = self.replicate(state) {
            warn!(range_id = %self.range_id, error = %e, "initial replication failed");
        }
    }

    fn replicate(&self, state: &mut GroupState) -> Result<()> {
        // Single-replica groups commit immediately.
        if state.peers.len() <= 1 {
            return self.advance_commit(state);
        }
        for peer in state.peers.clone() {
            if peer.replica_id == self.this.replica_id {
                continue;
            }
            self.send_append_to(state, peer)?;
        }
        Ok(())
    }

    fn send_append_to(&self, state: &GroupState, peer: ReplicaDescriptor) -> Result<()> {
        let Some(progress) = state.progress.get(&peer.replica_id) else {
            return Ok(());
        };
        if progress.next_index < state.first_index {
            let _ = self.events_tx.send(RaftEvent::SnapshotNeeded(peer));
            return Ok(());
        }
        let prev_index = progress.next_index - 1;
        let prev_term = state.term_at(prev_index).unwrap_or(0);
        self.send(
            peer,
            RaftMessage::Append {
                term: state.hard.term,
                leader: self.this,
                prev_index,
                prev_term,
                entries: state.entries_from(progress.next_index),
                commit: state.hard.commit,
            },
        );
        Ok(())
    }

    fn append_entries(&self, state: &mut GroupState, entries: Vec<LogEntry>) -> Result<()> {
        let mut fresh = Vec::new();
        for entry in entries {
            match state.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    // Conflict: drop our tail from this index.
                    let keep = (entry.index - state.first_index) as usize;
                    let mut batch = WriteBatch::new();
                    for stale in &state.entries[keep..] {
                        batch.delete(keys::range_log_entry_key(self.range_id, stale.index));
                    }
                    self.engine.write(batch)?;
                    state.entries.truncate(keep);
                    fresh.push(entry);
                }
                None => fresh.push(entry),
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        self.persist_entries(&fresh)?;
        state.entries.extend(fresh);
        Ok(())
    }

    fn advance_commit(&self, state: &mut GroupState) -> Result<()> {
        let last = state.last_index();
        let mut new_commit = state.hard.commit;
        for candidate in (state.hard.commit + 1)..=last {
            // Only entries from the current term commit by counting.
            if state.term_at(candidate) != Some(state.hard.term) {
                continue;
            }
            let mut acks = 1; // self
            for peer in &state.peers {
                if peer.replica_id == self.this.replica_id {
                    continue;
                }
                if let Some(p) = state.progress.get(&peer.replica_id) {
                    if p.match_index >= candidate {
                        acks += 1;
                    }
                }
            }
            if acks >= state.quorum() {
                new_commit = candidate;
            }
        }
        if new_commit > state.hard.commit {
            state.hard.commit = new_commit;
            self.persist_hard(state)?;
            self.deliver_committed(state);
            // Propagate the new commit index to followers promptly.
            for peer in state.peers.clone() {
                if peer.replica_id != self.this.replica_id {
                    self.send_append_to(state, peer)?;
                }
            }
        }
        Ok(())
    }

    fn deliver_committed(&self, state: &mut GroupState) {
        if state.hard.commit <= state.delivered {
            return;
        }
        let from = (state.delivered + 1).max(state.first_index);
        let to = state.hard.commit;
        if from > to {
            state.delivered = to;
            return;
        }
        let batch: Vec<LogEntry> = (from..=to)
            .filter_map(|i| {
                state
                    .entries
                    .get((i - state.first_index) as usize)
                    .cloned()
            })
            .collect();
        state.delivered = to;
        if !batch.is_empty() {
            let _ = self.events_tx.send(RaftEvent::Committed(batch));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::data::NodeId;
    use crate::storage::engine::MemEngine;

    fn replica(id: u32) -> ReplicaDescriptor {
        ReplicaDescriptor {
            node_id: NodeId(id),
            store_id: StoreId(id),
            replica_id: ReplicaId(id),
        }
    }

    struct Cluster {
        groups: Vec<Arc<RaftGroup>>,
        events: Vec<mpsc::UnboundedReceiver<RaftEvent>>,
        inboxes: Vec<mpsc::UnboundedReceiver<RaftEnvelope>>,
    }

    impl Cluster {
        fn new(n: u32) -> Self {
            let transport = LocalTransport::new();
            let peers: Vec<_> = (1..=n).map(replica).collect();
            let mut groups = Vec::new();
            let mut events = Vec::new();
            let mut inboxes = Vec::new();
            for i in 1..=n {
                let engine = MemEngine::new();
                inboxes.push(transport.listen(StoreId(i)));
                let (group, rx) = RaftGroup::new(
                    RangeId(1),
                    replica(i),
                    peers.clone(),
                    engine,
                    transport.clone(),
                    0,
                )
                .unwrap();
                groups.push(Arc::new(group));
                events.push(rx);
            }
            Self {
                groups,
                events,
                inboxes,
            }
        }

        /// Deliver all in-flight messages until the cluster is quiet.
        fn pump(&mut self) {
            loop {
                let mut progressed = false;
                for (i, inbox) in self.inboxes.iter_mut().enumerate() {
                    while let Ok(envelope) = inbox.try_recv() {
                        progressed = true;
                        self.groups[i]
                            .step(envelope.from, envelope.message)
                            .unwrap();
                    }
                }
                if !progressed {
                    break;
                }
            }
        }

        fn committed(&mut self, i: usize) -> Vec<LogEntry> {
            let mut out = Vec::new();
            while let Ok(event) = self.events[i].try_recv() {
                if let RaftEvent::Committed(entries) = event {
                    out.extend(entries);
                }
            }
            out
        }
    }

    #[test]
    fn single_replica_commits_immediately() {
        let mut cluster = Cluster::new(1);
        cluster.groups[0].campaign().unwrap();
        assert!(cluster.groups[0].is_leader());
        let index = cluster.groups[0].propose(b"cmd".to_vec()).unwrap();
        assert_eq!(index, 1);
        let committed = cluster.committed(0);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].command, b"cmd");
    }

    #[test]
    fn three_replicas_replicate_and_commit() {
        let mut cluster = Cluster::new(3);
        cluster.groups[0].campaign().unwrap();
        cluster.pump();
        assert!(cluster.groups[0].is_leader());

        cluster.groups[0].propose(b"a".to_vec()).unwrap();
        cluster.groups[0].propose(b"b".to_vec()).unwrap();
        cluster.pump();

        for i in 0..3 {
            let committed = cluster.committed(i);
            assert_eq!(
                committed.iter().map(|e| e.command.clone()).collect::<Vec<_>>(),
                vec![b"a".to_vec(), b"b".to_vec()],
                "replica {} saw all commits in order",
                i
            );
        }
    }

    #[test]
    fn followers_reject_non_leader_proposals() {
        let mut cluster = Cluster::new(3);
        cluster.groups[0].campaign().unwrap();
        cluster.pump();
        let err = cluster.groups[1].propose(b"x".to_vec()).unwrap_err();
        assert!(matches!(err, Error::NotLeader { .. }));
    }

    #[test]
    fn quorum_survives_one_lost_replica() {
        let mut cluster = Cluster::new(3);
        cluster.groups[0].campaign().unwrap();
        cluster.pump();

        // Replica 3 stops receiving.
        cluster.inboxes[2].close();

        cluster.groups[0].propose(b"still-works".to_vec()).unwrap();
        cluster.pump();
        let committed = cluster.committed(0);
        assert_eq!(committed.len(), 1, "two of three replicas form a quorum");
    }

    #[test]
    fn higher_term_deposes_leader_and_reproposes() {
        let mut cluster = Cluster::new(3);
        cluster.groups[0].campaign().unwrap();
        cluster.pump();

        // Leader appends an entry that never replicates (peers cut off).
        cluster.inboxes[1].close();
        cluster.inboxes[2].close();
        cluster.groups[0].propose(b"stranded".to_vec()).unwrap();

        // A competing election at a higher term reaches the old leader.
        cluster.groups[0]
            .step(
                replica(2),
                RaftMessage::Vote {
                    term: 99,
                    candidate: replica(2),
                    last_index: 10,
                    last_term: 98,
                },
            )
            .unwrap();

        assert!(!cluster.groups[0].is_leader());
        let mut reproposals = Vec::new();
        while let Ok(event) = cluster.events[0].try_recv() {
            if let RaftEvent::Reproposal(cmds) = event {
                reproposals.extend(cmds);
            }
        }
        assert_eq!(reproposals, vec![b"stranded".to_vec()]);
    }

    #[test]
    fn log_truncation_keeps_committed_tail() {
        let mut cluster = Cluster::new(1);
        cluster.groups[0].campaign().unwrap();
        for i in 0..5 {
            cluster.groups[0].propose(vec![i]).unwrap();
        }
        cluster.groups[0].truncate_log(4).unwrap();
        let (last, _) = cluster.groups[0].snapshot_meta();
        assert_eq!(last, 5);
        // Truncation below the floor is a no-op.
        cluster.groups[0].truncate_log(2).unwrap();
    }
}
