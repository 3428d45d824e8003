use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::providers::ExecutionStore;
use crate::{now_ms, TimerEntry};

/// Commands accepted by the timer service. Entries are persisted by the
/// engine *before* an Arm command is sent; the service only orders and
/// delivers wakes.
#[derive(Debug, Clone)]
pub enum TimerCommand {
    Arm(TimerEntry),
    Cancel { execution_id: String },
}

/// Delivered to the engine dispatcher when a timer fires. The engine removes
/// the persisted row after it has recorded the resume, so a crash between
/// fire and record replays the timer instead of losing the wake.
#[derive(Debug, Clone)]
pub struct WakeUp {
    pub execution_id: String,
    pub resume_step_index: usize,
}

/// Durable timer service.
///
/// On startup it reloads every pending timer from the store and re-arms it;
/// entries already past due fire immediately in `fire_at_ms` order, oldest
/// first. At most one entry per execution is kept; arming again replaces
/// the previous entry (the engine persists the replacement first).
pub struct TimerService {
    store: Arc<dyn ExecutionStore>,
    rx: tokio::sync::mpsc::UnboundedReceiver<TimerCommand>,
    wake_tx: tokio::sync::mpsc::UnboundedSender<WakeUp>,
    // execution_id -> entry; heap may hold stale keys, validated on pop.
    entries: HashMap<String, TimerEntry>,
    min_heap: BinaryHeap<Reverse<(u64, String)>>,
}

impl TimerService {
    pub fn start(
        store: Arc<dyn ExecutionStore>,
        wake_tx: tokio::sync::mpsc::UnboundedSender<WakeUp>,
    ) -> (tokio::task::JoinHandle<()>, tokio::sync::mpsc::UnboundedSender<TimerCommand>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<TimerCommand>();
        let mut svc = TimerService {
            store,
            rx,
            wake_tx,
            entries: HashMap::new(),
            min_heap: BinaryHeap::new(),
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        self.reload_pending().await;
        loop {
            // Drain queued commands
            while let Ok(cmd) = self.rx.try_recv() {
                self.apply(cmd);
            }

            // Fire due timers, oldest first
            let now = now_ms();
            let mut due: Vec<TimerEntry> = Vec::new();
            while let Some(Reverse((ts, key))) = self.min_heap.peek().cloned() {
                if ts > now {
                    break;
                }
                let _ = self.min_heap.pop();
                // Stale heap entries (cancelled or re-armed) are skipped.
                let current = self.entries.get(&key).map(|e| e.fire_at_ms);
                if current == Some(ts) {
                    if let Some(entry) = self.entries.remove(&key) {
                        due.push(entry);
                    }
                }
            }
            for entry in due.drain(..) {
                debug!(execution = %entry.execution_id, fire_at_ms = entry.fire_at_ms, "timer fired");
                let _ = self.wake_tx.send(WakeUp {
                    execution_id: entry.execution_id,
                    resume_step_index: entry.resume_step_index,
                });
            }

            // Wait for the next deadline or the next command
            if let Some(Reverse((next_ts, _))) = self.min_heap.peek().cloned() {
                let dur_ms = next_ts.saturating_sub(now_ms()).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(dur_ms)) => {}
                    maybe = self.rx.recv() => {
                        match maybe {
                            Some(cmd) => self.apply(cmd),
                            None => return,
                        }
                    }
                }
            } else {
                // No armed timers; block on the next command.
                match self.rx.recv().await {
                    Some(cmd) => self.apply(cmd),
                    None => return,
                }
            }
        }
    }

    async fn reload_pending(&mut self) {
        match self.store.load_pending_timers().await {
            Ok(timers) => {
                let count = timers.len();
                for entry in timers {
                    self.insert(entry);
                }
                if count > 0 {
                    debug!(count, "re-armed pending timers from store");
                }
            }
            Err(e) => warn!(error = %e, "failed to reload pending timers"),
        }
    }

    fn apply(&mut self, cmd: TimerCommand) {
        match cmd {
            TimerCommand::Arm(entry) => {
                if let Some(prev) = self.entries.get(&entry.execution_id) {
                    // One timer per execution; replacement is engine-driven.
                    warn!(execution = %entry.execution_id, prev_fire_at = prev.fire_at_ms, "replacing armed timer");
                }
                self.insert(entry);
            }
            TimerCommand::Cancel { execution_id } => {
                self.entries.remove(&execution_id);
            }
        }
    }

    fn insert(&mut self, entry: TimerEntry) {
        self.min_heap
            .push(Reverse((entry.fire_at_ms, entry.execution_id.clone())));
        self.entries.insert(entry.execution_id.clone(), entry);
    }
}
