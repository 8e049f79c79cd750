//! FIFO hand-off gate.
//!
//! Both the folder mutex and the deferred-call queue are one of these: a
//! single holder plus a queue of named waiters. Releasing never runs the next
//! waiter inline; it only completes the waiter's channel, so the waiter
//! resumes on its own task's next poll.

use std::collections::VecDeque;

use tokio::sync::oneshot;

pub(crate) type GateId = u64;

#[derive(Debug, Default)]
pub(crate) struct FifoGate {
    next_id: GateId,
    held_by: Option<(GateId, &'static str)>,
    waiters: VecDeque<(GateId, &'static str, oneshot::Sender<()>)>,
}

impl FifoGate {
    /// Take the gate right away if it is free, nobody is queued and the
    /// caller is not `blocked`; otherwise queue up and return a receiver that
    /// fires when the gate is handed over.
    pub fn acquire(
        &mut self,
        name: &'static str,
        blocked: bool,
    ) -> (GateId, Option<oneshot::Receiver<()>>) {
        let id = self.next_id;
        self.next_id += 1;

        if self.held_by.is_none() && self.waiters.is_empty() && !blocked {
            self.held_by = Some((id, name));
            return (id, None);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back((id, name, tx));
        (id, Some(rx))
    }

    /// Give up `id`, whether it holds the gate or is still queued. Returns
    /// true if it was the holder.
    pub fn abandon(&mut self, id: GateId) -> bool {
        if matches!(self.held_by, Some((holder, _)) if holder == id) {
            self.held_by = None;
            return true;
        }
        self.waiters.retain(|(waiter, _, _)| *waiter != id);
        false
    }

    /// Hand a free gate to the oldest live waiter.
    pub fn grant_next(&mut self) -> Option<&'static str> {
        if self.held_by.is_some() {
            return None;
        }
        while let Some((id, name, tx)) = self.waiters.pop_front() {
            // A waiter whose caller went away is skipped.
            if tx.send(()).is_ok() {
                self.held_by = Some((id, name));
                return Some(name);
            }
        }
        None
    }

    pub fn holder(&self) -> Option<&'static str> {
        self.held_by.map(|(_, name)| name)
    }

    pub fn queued(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_idle(&self) -> bool {
        self.held_by.is_none() && self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_is_fifo() {
        let mut gate = FifoGate::default();
        let (a, rx) = gate.acquire("a", false);
        assert!(rx.is_none());
        assert_eq!(gate.holder(), Some("a"));

        let (_, rx_b) = gate.acquire("b", false);
        let (_, rx_c) = gate.acquire("c", false);
        assert_eq!(gate.queued(), 2);

        // Nothing is handed over while a holds it.
        assert_eq!(gate.grant_next(), None);

        assert!(gate.abandon(a));
        assert_eq!(gate.grant_next(), Some("b"));
        assert!(rx_b.unwrap().await.is_ok());
        assert_eq!(gate.holder(), Some("b"));
        assert!(!gate.is_idle());
        drop(rx_c);
    }

    #[test]
    fn test_dead_waiters_are_skipped() {
        let mut gate = FifoGate::default();
        let (a, _) = gate.acquire("a", false);
        let (_, rx_b) = gate.acquire("b", false);
        let (_, _rx_c) = gate.acquire("c", false);
        drop(rx_b);

        gate.abandon(a);
        assert_eq!(gate.grant_next(), Some("c"));
    }

    #[test]
    fn test_blocked_acquire_queues_on_free_gate() {
        let mut gate = FifoGate::default();
        let (id, rx) = gate.acquire("deferred", true);
        assert!(rx.is_some());
        assert_eq!(gate.holder(), None);

        // Abandoning a queued waiter just drops it.
        assert!(!gate.abandon(id));
        assert!(gate.is_idle());
    }
}
