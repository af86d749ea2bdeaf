//! One-shot lifecycle latch.

use tokio::sync::watch;

/// A latch that starts closed and is released exactly once.
///
/// Waiters that arrive after release return immediately.
#[derive(Debug)]
pub struct Gate {
    released: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            released: watch::Sender::new(false),
        }
    }

    /// Open the gate. Returns `true` only for the call that opened it.
    pub fn release(&self) -> bool {
        self.released.send_if_modified(|released| {
            if *released {
                false
            } else {
                *released = true;
                true
            }
        })
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    /// Wait until the gate has been released.
    pub async fn wait(&self) {
        let mut rx = self.released.subscribe();
        // The sender lives in `self`, so this can only end by release.
        let _ = rx.wait_for(|released| *released).await;
    }

    /// Release the gate when the returned guard goes out of scope.
    pub fn release_on_drop(&self) -> ReleaseGuard<'_> {
        ReleaseGuard { gate: self }
    }
}

/// Releases its [`Gate`] on drop, whichever path leaves the scope.
pub struct ReleaseGuard<'a> {
    gate: &'a Gate,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
