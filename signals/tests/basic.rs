use prism_signals::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn calculated_consistent_after_batch() {
    let a = Mut::new(1);
    let b = Mut::new(2);

    let sum = Calculated::new({
        let a = a.read();
        let b = b.read();
        move || a.get() + b.get()
    });

    batch(|| {
        a.set(10);
        b.set(20);
        a.set(11);
    });

    // After any completed batch the cached value equals the pure function of
    // the dependencies' current values.
    assert_eq!(sum.get(), 31);
}

#[test]
fn batch_collapses_writes_per_dependent() {
    let a = Mut::new(0);
    let b = Mut::new(0);
    let runs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    let _effect = Effect::new({
        let a = a.read();
        let b = b.read();
        let runs = runs.clone();
        let seen = seen.clone();
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().push((a.get(), b.get()));
        }
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    batch(|| {
        a.set(1);
        a.set(2);
        b.set(3);
    });

    // One re-run for the whole batch, observing the final values.
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(seen.lock().unwrap().last(), Some(&(2, 3)));
}

#[test]
fn effect_disposal_is_idempotent() {
    let a = Mut::new(0);
    let runs = Arc::new(AtomicUsize::new(0));

    let effect = Effect::new({
        let a = a.read();
        let runs = runs.clone();
        move || {
            let _ = a.get();
            runs.fetch_add(1, Ordering::SeqCst);
        }
    });

    effect.dispose();
    effect.dispose(); // safe on an already-disposed handle
    a.set(1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn subscription_channel_delivery() {
    let (tx, rx) = std::sync::mpsc::channel::<i32>();
    let signal = Mut::new(1);
    let _guard = signal.read().subscribe(tx);

    signal.set(2);
    signal.set(3);

    assert_eq!(rx.try_recv().unwrap(), 2);
    assert_eq!(rx.try_recv().unwrap(), 3);
    assert!(rx.try_recv().is_err());
}
