//! Cooperative cancellation for in-flight backend work.
//!
//! Every backend call site polls a token before starting a request. Unmount
//! cancels the mount-wide token so outstanding reads and readahead chains
//! stop issuing new requests, while flushes drain under their own deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Why an operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// The mount is shutting down.
    Unmount,
    /// The operation outlived its deadline.
    DeadlineExceeded,
    /// A newer operation supersedes this one.
    Superseded,
    /// Explicit caller cancellation.
    #[default]
    UserRequested,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Unmount => write!(f, "unmount"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelReason::Superseded => write!(f, "superseded"),
            CancelReason::UserRequested => write!(f, "user requested"),
        }
    }
}

/// Cloneable token observed by in-flight work.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<CancelReason>>>,
    children: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl CancelToken {
    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The recorded reason, once cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock().unwrap()
    }

    /// Derives a child pair: cancelled with the parent, or independently.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let cancelled = Arc::new(AtomicBool::new(self.is_cancelled()));
        let reason = Arc::new(Mutex::new(self.reason()));
        let children = Arc::new(Mutex::new(Vec::new()));

        self.children.lock().unwrap().push(Arc::clone(&cancelled));

        (
            CancelToken {
                cancelled: Arc::clone(&cancelled),
                reason: Arc::clone(&reason),
                children: Arc::clone(&children),
            },
            CancelHandle {
                cancelled,
                reason,
                children,
            },
        )
    }
}

/// The triggering side of a token.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<CancelReason>>>,
    children: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl CancelHandle {
    /// Cancels the token and every child derived from it.
    ///
    /// The first reason recorded wins; later calls are no-ops for it.
    pub fn cancel(&self, reason: CancelReason) {
        self.cancelled.store(true, Ordering::SeqCst);
        {
            let mut recorded = self.reason.lock().unwrap();
            if recorded.is_none() {
                *recorded = Some(reason);
            }
        }
        for child in self.children.lock().unwrap().iter() {
            child.store(true, Ordering::SeqCst);
        }
    }

    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Creates a fresh token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let reason = Arc::new(Mutex::new(None));
    let children = Arc::new(Mutex::new(Vec::new()));

    (
        CancelToken {
            cancelled: Arc::clone(&cancelled),
            reason: Arc::clone(&reason),
            children: Arc::clone(&children),
        },
        CancelHandle {
            cancelled,
            reason,
            children,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pair_is_not_cancelled() {
        let (token, handle) = new_cancel_pair();
        assert!(!token.is_cancelled());
        assert!(!handle.is_cancelled());
        assert_eq!(token.reason(), None);
    }

    #[test]
    fn cancel_reaches_every_clone() {
        let (token, handle) = new_cancel_pair();
        let other = token.clone();

        handle.cancel(CancelReason::Unmount);

        assert!(token.is_cancelled());
        assert!(other.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Unmount));
    }

    #[test]
    fn first_reason_wins() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::DeadlineExceeded);
        handle.cancel(CancelReason::UserRequested);
        assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn parent_cancel_propagates_to_children() {
        let (token, handle) = new_cancel_pair();
        let (child_token, _child_handle) = token.child();

        handle.cancel(CancelReason::Unmount);
        assert!(child_token.is_cancelled());
    }

    #[test]
    fn child_cancel_leaves_parent_running() {
        let (token, _handle) = new_cancel_pair();
        let (child_token, child_handle) = token.child();

        child_handle.cancel(CancelReason::Superseded);
        assert!(child_token.is_cancelled());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Unmount);

        let (child_token, _) = token.child();
        assert!(child_token.is_cancelled());
        assert_eq!(child_token.reason(), Some(CancelReason::Unmount));
    }

    #[test]
    fn reasons_display_distinctly() {
        let all = [
            CancelReason::Unmount,
            CancelReason::DeadlineExceeded,
            CancelReason::Superseded,
            CancelReason::UserRequested,
        ];
        let mut rendered: Vec<String> = all.iter().map(|r| r.to_string()).collect();
        rendered.dedup();
        assert_eq!(rendered.len(), all.len());
    }
}
