//! Per-call error handlers
//!
//! Handlers intercept terminal errors before the generic `on_error`
//! callback. When several handlers match, the most specific matcher wins:
//! an API error code beats an error kind, which beats the catch-all.

use crate::error::{ErrorKind, RpcError};
use std::fmt;
use std::sync::Arc;

/// Which errors a handler intercepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMatcher {
    /// Every error
    Any,
    /// Errors of one kind
    Kind(ErrorKind),
    /// API errors carrying one code
    ApiCode(i64),
}

impl ErrorMatcher {
    fn matches(&self, error: &RpcError) -> bool {
        match self {
            ErrorMatcher::Any => true,
            ErrorMatcher::Kind(kind) => error.kind() == *kind,
            ErrorMatcher::ApiCode(code) => {
                matches!(error, RpcError::Api { code: actual, .. } if actual == code)
            }
        }
    }

    fn specificity(&self) -> u8 {
        match self {
            ErrorMatcher::Any => 0,
            ErrorMatcher::Kind(_) => 1,
            ErrorMatcher::ApiCode(_) => 2,
        }
    }
}

type HandlerFn = Arc<dyn Fn(&RpcError) + Send + Sync>;

/// Ordered set of error handlers attached to one call or batch
#[derive(Clone, Default)]
pub struct ErrorHandlers {
    handlers: Vec<(ErrorMatcher, HandlerFn)>,
}

impl ErrorHandlers {
    /// No handlers; every error goes to the generic path
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler
    pub fn on(mut self, matcher: ErrorMatcher, handler: impl Fn(&RpcError) + Send + Sync + 'static) -> Self {
        self.handlers.push((matcher, Arc::new(handler)));
        self
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the most specific matching handler.
    ///
    /// Returns `false` when nothing matched and the generic error callback
    /// should run instead. Equally specific handlers resolve to the one
    /// registered first.
    pub fn dispatch(&self, error: &RpcError) -> bool {
        let mut best: Option<&(ErrorMatcher, HandlerFn)> = None;
        for entry in self.handlers.iter().filter(|(m, _)| m.matches(error)) {
            if best.map_or(true, |(b, _)| entry.0.specificity() > b.specificity()) {
                best = Some(entry);
            }
        }
        match best {
            Some((_, handler)) => {
                handler(error);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|(m, _)| m))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording() -> (Arc<Mutex<Vec<&'static str>>>, ErrorHandlers) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let handlers = ErrorHandlers::new()
            .on(ErrorMatcher::Any, move |_| a.lock().push("any"))
            .on(ErrorMatcher::ApiCode(404), move |_| b.lock().push("404"))
            .on(ErrorMatcher::Kind(ErrorKind::Api), move |_| c.lock().push("api"));
        (log, handlers)
    }

    #[test]
    fn test_most_specific_wins_regardless_of_order() {
        let (log, handlers) = recording();
        assert!(handlers.dispatch(&RpcError::api(404, "missing")));
        assert!(handlers.dispatch(&RpcError::api(500, "boom")));
        assert!(handlers.dispatch(&RpcError::connection("reset")));
        assert_eq!(*log.lock(), vec!["404", "api", "any"]);
    }

    #[test]
    fn test_no_match_falls_through() {
        let handlers = ErrorHandlers::new().on(ErrorMatcher::Kind(ErrorKind::Parse), |_| {});
        assert!(!handlers.dispatch(&RpcError::connection("reset")));
    }

    #[test]
    fn test_tie_goes_to_first_registered() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());
        let handlers = ErrorHandlers::new()
            .on(ErrorMatcher::Kind(ErrorKind::Api), move |_| a.lock().push(1))
            .on(ErrorMatcher::Kind(ErrorKind::Api), move |_| b.lock().push(2));
        handlers.dispatch(&RpcError::api(1, "x"));
        assert_eq!(*log.lock(), vec![1]);
    }
}
