use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Cooperative shutdown flag shared by listeners, sessions and writer
/// threads. Signalling is one-way and sticky.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
