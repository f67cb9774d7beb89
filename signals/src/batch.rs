use crate::broadcast::{Broadcast, BroadcastId};
use std::cell::RefCell;
use std::collections::HashSet;

struct BatchState {
    depth: usize,
    // Broadcasts to flush when the outermost batch exits, deduplicated by id
    // so multiple writes to one cell notify once.
    pending: Vec<Broadcast>,
    seen: HashSet<BroadcastId>,
}

// While the flush is sending broadcasts, observers that would re-run (effects)
// enqueue themselves here instead, deduplicated by observer id, so a
// dependent of several written cells still runs exactly once per batch.
#[derive(Default)]
struct FlushQueue {
    seen: HashSet<usize>,
    queue: Vec<Box<dyn FnOnce()>>,
}

thread_local! {
    static CURRENT_BATCH: RefCell<Option<BatchState>> = const { RefCell::new(None) };
    static FLUSH_QUEUE: RefCell<Option<FlushQueue>> = const { RefCell::new(None) };
}

/// Group writes so that dependents are notified at most once, after `f`
/// returns. Values are visible immediately; only notification is deferred.
/// Batches nest: flushing happens when the outermost batch exits.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    CURRENT_BATCH.with(|cell| {
        let mut state = cell.borrow_mut();
        match state.as_mut() {
            Some(state) => state.depth += 1,
            None => *state = Some(BatchState { depth: 1, pending: Vec::new(), seen: HashSet::new() }),
        }
    });

    let result = f();

    let flush = CURRENT_BATCH.with(|cell| {
        let mut state = cell.borrow_mut();
        let inner = state.as_mut().expect("batch state missing at exit");
        inner.depth -= 1;
        if inner.depth == 0 { state.take().map(|s| s.pending) } else { None }
    });

    // Flushed with no batch state active, so a listener that writes a signal
    // notifies synchronously rather than re-entering this batch. Two phases:
    // send every deferred broadcast (effects defer into the flush queue),
    // then run each deferred dependent once.
    if let Some(pending) = flush {
        FLUSH_QUEUE.with(|cell| *cell.borrow_mut() = Some(FlushQueue::default()));
        for broadcast in pending {
            broadcast.send(());
        }
        let queued = FLUSH_QUEUE.with(|cell| cell.borrow_mut().take()).map(|q| q.queue).unwrap_or_default();
        for trigger in queued {
            trigger();
        }
    }

    result
}

/// Defer a dependent's re-run to the end of the current flush, deduplicated
/// by observer id. Runs `trigger` synchronously when no flush is active.
pub(crate) fn run_or_defer(observer_id: usize, trigger: Box<dyn FnOnce()>) {
    let immediate = FLUSH_QUEUE.with(|cell| {
        let mut state = cell.borrow_mut();
        match state.as_mut() {
            Some(queue) => {
                if queue.seen.insert(observer_id) {
                    queue.queue.push(trigger);
                    None
                } else {
                    None
                }
            }
            None => Some(trigger),
        }
    });
    if let Some(trigger) = immediate {
        trigger();
    }
}

/// Defer a notification to the end of the current batch. Returns false when no
/// batch is active and the caller should send synchronously.
pub(crate) fn defer(broadcast: &Broadcast) -> bool {
    CURRENT_BATCH.with(|cell| {
        let mut state = cell.borrow_mut();
        match state.as_mut() {
            Some(state) => {
                if state.seen.insert(broadcast.id()) {
                    state.pending.push(broadcast.clone());
                }
                true
            }
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Mut, Peek};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn single_notification_per_batch() {
        let a = Mut::new(0);
        let count = Arc::new(AtomicUsize::new(0));

        let _guard = {
            use crate::porcelain::Subscribe;
            let count = count.clone();
            a.read().subscribe(move |_: i32| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        batch(|| {
            a.set(1);
            a.set(2);
            a.set(3);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(a.peek(), 3);
    }

    #[test]
    fn nested_batches_flush_once() {
        let a = Mut::new(0);
        let count = Arc::new(AtomicUsize::new(0));

        let _guard = {
            use crate::porcelain::Subscribe;
            let count = count.clone();
            a.read().subscribe(move |_: i32| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        batch(|| {
            a.set(1);
            batch(|| {
                a.set(2);
            });
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
