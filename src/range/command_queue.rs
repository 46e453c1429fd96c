//! Per-range command serialization.
//!
//! The command queue orders commands whose key spans overlap: a command
//! entering execution waits for every conflicting command added before it
//! to finish. Two commands conflict iff their spans overlap and at least
//! one of them writes; reads run concurrently with reads.
//!
//! Callers hold the queue lock only to register or remove commands; the
//! returned barrier is awaited outside the lock.

use crate::api::data::Key;
use crate::storage::keys;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Handle for a registered command; passed back to [`CommandQueue::remove`].
#[derive(Debug)]
pub struct CmdHandle(u64);

struct Cmd {
    start: Key,
    end: Key,
    read_only: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

/// Pending barrier returned by [`CommandQueue::get_wait`]. Completes once
/// every conflicting prior command has been removed.
pub struct Barrier {
    receivers: Vec<oneshot::Receiver<()>>,
}

impl Barrier {
    /// Wait for all conflicting commands to finish.
    pub async fn wait(self) {
        for rx in self.receivers {
            // A dropped sender means the command was removed (or the
            // queue cleared); either way the conflict is gone.
            let _ = rx.await;
        }
    }

    /// Whether the barrier has nothing to wait on.
    pub fn is_clear(&self) -> bool {
        self.receivers.is_empty()
    }
}

/// Interval structure serializing overlapping commands on one range.
#[derive(Default)]
pub struct CommandQueue {
    next_id: u64,
    cmds: HashMap<u64, Cmd>,
}

fn normalize_span(start: &[u8], end: &[u8]) -> (Key, Key) {
    if end.is_empty() {
        (start.to_vec(), keys::next_key(start))
    } else {
        (start.to_vec(), end.to_vec())
    }
}

fn overlaps(a_start: &[u8], a_end: &[u8], b_start: &[u8], b_end: &[u8]) -> bool {
    a_start < b_end && b_start < a_end
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command over `[start, end)` (point span when `end` is
    /// empty). The command stays registered until [`Self::remove`].
    pub fn add(&mut self, start: &[u8], end: &[u8], read_only: bool) -> CmdHandle {
        let (start, end) = normalize_span(start, end);
        let id = self.next_id;
        self.next_id += 1;
        self.cmds.insert(
            id,
            Cmd {
                start,
                end,
                read_only,
                waiters: Vec::new(),
            },
        );
        CmdHandle(id)
    }

    /// Register a barrier over `[start, end)` that completes once all
    /// conflicting commands registered before this call are removed.
    pub fn get_wait(&mut self, start: &[u8], end: &[u8], read_only: bool) -> Barrier {
        let (start, end) = normalize_span(start, end);
        let mut receivers = Vec::new();
        for cmd in self.cmds.values_mut() {
            if read_only && cmd.read_only {
                continue;
            }
            if overlaps(&start, &end, &cmd.start, &cmd.end) {
                let (tx, rx) = oneshot::channel();
                cmd.waiters.push(tx);
                receivers.push(rx);
            }
        }
        Barrier { receivers }
    }

    /// Finalize a command, releasing barriers waiting on it.
    pub fn remove(&mut self, handle: CmdHandle) {
        if let Some(cmd) = self.cmds.remove(&handle.0) {
            for waiter in cmd.waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// Release all barriers and forget all commands.
    pub fn clear(&mut self) {
        for (_, cmd) in self.cmds.drain() {
            for waiter in cmd.waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    /// Whether no commands are registered.
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn finished_within(barrier: Barrier, wait: Duration) -> bool {
        tokio::time::timeout(wait, barrier.wait()).await.is_ok()
    }

    #[tokio::test]
    async fn no_wait_without_conflicts() {
        let mut cq = CommandQueue::new();
        let b = cq.get_wait(b"a", b"", false);
        assert!(b.is_clear());
        let b = cq.get_wait(b"a", b"b", false);
        assert!(b.is_clear());
    }

    #[tokio::test]
    async fn waits_for_overlapping_write() {
        let mut cq = CommandQueue::new();
        let wk = cq.add(b"a", b"", false);
        let barrier = cq.get_wait(b"a", b"", false);
        assert!(!barrier.is_clear());

        let wait = tokio::spawn(barrier.wait());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!wait.is_finished(), "barrier released with command outstanding");

        cq.remove(wk);
        tokio::time::timeout(Duration::from_millis(100), wait)
            .await
            .expect("barrier released after removal")
            .unwrap();
    }

    #[tokio::test]
    async fn reads_do_not_conflict_with_reads() {
        let mut cq = CommandQueue::new();
        let _wk = cq.add(b"a", b"", true);
        let b = cq.get_wait(b"a", b"", true);
        assert!(b.is_clear());
        // A writer still conflicts with the registered read.
        let b = cq.get_wait(b"a", b"", false);
        assert!(!b.is_clear());
    }

    #[tokio::test]
    async fn waits_for_all_overlapping_commands() {
        let mut cq = CommandQueue::new();
        let wk1 = cq.add(b"a", b"", false);
        let wk2 = cq.add(b"b", b"c", false);
        let wk3 = cq.add(b"0", b"d", false);
        let barrier = cq.get_wait(b"a", b"cc", false);

        let wait = tokio::spawn(barrier.wait());
        cq.remove(wk1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!wait.is_finished(), "two commands still outstanding");
        cq.remove(wk2);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!wait.is_finished(), "one command still outstanding");
        cq.remove(wk3);
        tokio::time::timeout(Duration::from_millis(100), wait)
            .await
            .expect("all commands removed")
            .unwrap();
    }

    #[tokio::test]
    async fn disjoint_spans_do_not_wait() {
        let mut cq = CommandQueue::new();
        let _wk = cq.add(b"a", b"c", false);
        // [c, d) does not overlap [a, c).
        let b = cq.get_wait(b"c", b"d", false);
        assert!(b.is_clear());
        let b = cq.get_wait(b"b", b"", false);
        assert!(!b.is_clear());
    }

    #[tokio::test]
    async fn clear_releases_everything() {
        let mut cq = CommandQueue::new();
        let _wk1 = cq.add(b"a", b"", false);
        let _wk2 = cq.add(b"b", b"", false);
        let barrier = cq.get_wait(b"a", b"c", false);
        cq.clear();
        assert!(finished_within(barrier, Duration::from_millis(100)).await);
        assert!(cq.is_empty());
    }
}
