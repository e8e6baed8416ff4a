//! Cooperative cancellation shared between a run and its workers.
//!
//! Cancelling a token cancels every token derived from it with [`CancelToken::child`].
//! Cancelling a child leaves the parent untouched, which lets one failing
//! dependency stop its siblings without aborting the caller's token.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    token: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn parent_cancellation_reaches_children() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();
        assert!(!grandchild.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_cancellation_stays_local() {
        let root = CancelToken::new();
        let child = root.child();
        let sibling = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_from_another_thread_without_runtime() {
        let token = CancelToken::new();
        let child = token.child();
        thread::scope(|scope| {
            scope.spawn(|| token.cancel());
        });
        assert!(child.is_cancelled());
    }
}
