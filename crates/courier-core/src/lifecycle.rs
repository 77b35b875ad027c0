//! Caller-owned relevance tokens
//!
//! A call or batch can be bound to a [`LifecycleToken`]. The delivery
//! consumer polls the token before every event; once the token reports the
//! caller is gone, the call is cancelled and only its final `finish` event
//! is delivered. Tokens can also cancel their bound calls eagerly through
//! the [`Canceller`] they receive in [`LifecycleToken::bind`].

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Cancels one call or batch on behalf of a lifecycle token
pub struct Canceller {
    cancel: Box<dyn Fn() + Send + Sync>,
    live: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Canceller {
    pub(crate) fn new(
        cancel: impl Fn() + Send + Sync + 'static,
        live: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            cancel: Box::new(cancel),
            live: Box::new(live),
        }
    }

    /// Cancel the bound call; a no-op once it is terminal
    pub fn cancel(&self) {
        (self.cancel)();
    }

    /// Whether the bound call still exists and is not terminal.
    ///
    /// Tokens holding cancellers can drop the ones that report false.
    pub fn is_live(&self) -> bool {
        (self.live)()
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller").finish_non_exhaustive()
    }
}

/// Relevance capability supplied by the caller
pub trait LifecycleToken: Send + Sync {
    /// Whether events for bound calls should still be delivered
    fn is_still_relevant(&self) -> bool;

    /// Called once when a call or batch is bound to this token
    fn bind(&self, _canceller: Canceller) {}
}

/// Ready-made token: relevant until [`LifecycleScope::end`] is called,
/// which also cancels every call bound to it.
#[derive(Default)]
pub struct LifecycleScope {
    ended: AtomicBool,
    bound: Mutex<Vec<Canceller>>,
}

impl LifecycleScope {
    /// Create a scope that is still relevant
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// End the scope and cancel everything bound to it
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        let bound = std::mem::take(&mut *self.bound.lock());
        for canceller in bound {
            canceller.cancel();
        }
    }

    /// Whether [`end`](Self::end) has been called
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Number of cancellers currently held
    pub fn bound_count(&self) -> usize {
        self.bound.lock().len()
    }
}

impl LifecycleToken for LifecycleScope {
    fn is_still_relevant(&self) -> bool {
        !self.is_ended()
    }

    fn bind(&self, canceller: Canceller) {
        if self.is_ended() {
            canceller.cancel();
            return;
        }
        let mut bound = self.bound.lock();
        bound.retain(Canceller::is_live);
        bound.push(canceller);
    }
}

impl fmt::Debug for LifecycleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleScope")
            .field("ended", &self.is_ended())
            .field("bound", &self.bound.lock().len())
            .finish()
    }
}

/// Weak wrapper so a token outliving its scope owner reads as irrelevant
pub struct WeakToken<T: LifecycleToken>(pub Weak<T>);

impl<T: LifecycleToken> LifecycleToken for WeakToken<T> {
    fn is_still_relevant(&self) -> bool {
        self.0
            .upgrade()
            .map(|token| token.is_still_relevant())
            .unwrap_or(false)
    }

    fn bind(&self, canceller: Canceller) {
        match self.0.upgrade() {
            Some(token) => token.bind(canceller),
            None => canceller.cancel(),
        }
    }
}
