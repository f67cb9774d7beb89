/*!
A reactive signals library for prism.

Signals are the unit of reactivity: a `Mut` holds a value, a `Calculated`
derives one from other signals, and an `Effect` runs a closure whenever any
signal it read has changed. Reads performed while an observer frame is active
record the signal as a dependency of that frame.

# Basic usage

```rust
use prism_signals::*;

let name = Mut::new("Buffy".to_string());
let age = Mut::new(29);

let caption = Calculated::new({
    let name = name.read();
    let age = age.read();
    move || format!("{}, {}", name.get(), age.get())
});

assert_eq!(caption.get(), "Buffy, 29");
age.set(30);
assert_eq!(caption.get(), "Buffy, 30");
```

# Batching

Writes inside [`batch`] defer notification; each dependent is notified at most
once when the outermost batch exits, no matter how many writes it covered.
*/

pub mod batch;
pub mod broadcast;
pub mod context;
pub mod effect;
pub mod observer;
pub mod porcelain;
pub mod signal;
pub mod value;

pub use batch::batch;
pub use context::CurrentObserver;
pub use effect::Effect;
pub use observer::Observer;
pub use porcelain::{IntoSubscribeListener, Subscribe, SubscriptionGuard};
pub use signal::{Calculated, Get, Listener, ListenerGuard, Mut, Peek, Read, Signal, With};
