//! Timer Service (§4.8).
//!
//! A single shared scheduler backed by a binary heap of pending timers.
//! Fires are delivered as messages on an mpsc channel rather than via
//! callback closures, keeping the firing path non-blocking and letting
//! owners (call tasks, the registrar reaper) react on their own mailbox.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

pub type TimerId = u64;

#[derive(Debug, Clone)]
pub enum TimerOwner {
    Call(String),
    Lease(String),
    Transaction(String),
}

#[derive(Debug, Clone)]
pub struct TimerFired {
    pub timer_id: TimerId,
    pub owner: TimerOwner,
}

struct PendingTimer {
    due: Instant,
    timer_id: TimerId,
    owner: TimerOwner,
}

impl PartialEq for PendingTimer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for PendingTimer {}
impl Ord for PendingTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so the heap is a min-heap on due time.
        other.due.cmp(&self.due)
    }
}
impl PartialOrd for PendingTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum Command {
    Schedule {
        due: Instant,
        owner: TimerOwner,
        reply: oneshot::Sender<TimerId>,
    },
    Cancel(TimerId),
}

/// Handle used by components to schedule and cancel timers. Cloning is
/// cheap; the actual heap lives in the worker task owned by `run`.
#[derive(Clone)]
pub struct TimerService {
    commands: mpsc::UnboundedSender<Command>,
}

impl TimerService {
    /// Spawns the worker task and returns a handle plus the channel on
    /// which fired timers are delivered.
    pub fn spawn(resolution: Duration) -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();

        tokio::spawn(run(commands_rx, fired_tx, resolution));

        (
            Self {
                commands: commands_tx,
            },
            fired_rx,
        )
    }

    pub async fn schedule_in(&self, delay: Duration, owner: TimerOwner) -> TimerId {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Schedule {
            due: Instant::now() + delay,
            owner,
            reply,
        });
        rx.await.unwrap_or(0)
    }

    pub fn cancel(&self, timer_id: TimerId) {
        let _ = self.commands.send(Command::Cancel(timer_id));
    }
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<Command>,
    fired: mpsc::UnboundedSender<TimerFired>,
    resolution: Duration,
) {
    let mut heap: BinaryHeap<PendingTimer> = BinaryHeap::new();
    let mut cancelled: HashSet<TimerId> = HashSet::new();
    let mut next_id: TimerId = 1;
    let mut tick = tokio::time::interval(resolution);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Schedule { due, owner, reply }) => {
                        let timer_id = next_id;
                        next_id += 1;
                        heap.push(PendingTimer { due, timer_id, owner });
                        let _ = reply.send(timer_id);
                    }
                    Some(Command::Cancel(timer_id)) => {
                        cancelled.insert(timer_id);
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                while let Some(top) = heap.peek() {
                    if top.due > now {
                        break;
                    }
                    let timer = heap.pop().unwrap();
                    if cancelled.remove(&timer.timer_id) {
                        trace!(timer_id = timer.timer_id, "timer cancelled before fire");
                        continue;
                    }
                    let _ = fired.send(TimerFired {
                        timer_id: timer.timer_id,
                        owner: timer.owner,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timer_fires_after_delay() {
        let (service, mut fired) = TimerService::spawn(Duration::from_millis(10));
        let id = service
            .schedule_in(Duration::from_millis(20), TimerOwner::Call("call-1".to_string()))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(1), fired.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.timer_id, id);
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let (service, mut fired) = TimerService::spawn(Duration::from_millis(10));
        let id = service
            .schedule_in(Duration::from_millis(30), TimerOwner::Call("call-2".to_string()))
            .await;
        service.cancel(id);

        let result = tokio::time::timeout(Duration::from_millis(100), fired.recv()).await;
        assert!(result.is_err(), "cancelled timer must not fire");
    }

    #[tokio::test]
    async fn test_firing_is_single_shot() {
        let (service, mut fired) = TimerService::spawn(Duration::from_millis(5));
        service
            .schedule_in(Duration::from_millis(10), TimerOwner::Lease("1001".to_string()))
            .await;

        let _first = tokio::time::timeout(Duration::from_secs(1), fired.recv())
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), fired.recv()).await;
        assert!(second.is_err(), "a single-shot timer must not fire twice");
    }
}
