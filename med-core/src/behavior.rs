//! Failure-handling policy.
//!
//! Every entry point accepts a [`Behavior`] describing what to do when an
//! operation fails: return the error, abort the process, or retry once
//! for transient failures. A per-context [`BehaviorStack`] lets callers
//! scope a policy to a region of work and restore the previous one.

use crate::error::MedError;
use tracing::error;

/// What to do when an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFail {
    /// Propagate the error to the caller.
    #[default]
    Return,
    /// Abort the process after logging.
    Exit,
}

/// Failure policy for an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Behavior {
    pub on_fail: OnFail,
    /// Retry file opens and transient read failures once before failing.
    pub retry_once: bool,
    pub suppress_errors: bool,
    pub suppress_warnings: bool,
    pub suppress_messages: bool,
}

impl Behavior {
    pub const fn returning() -> Self {
        Behavior {
            on_fail: OnFail::Return,
            retry_once: false,
            suppress_errors: false,
            suppress_warnings: false,
            suppress_messages: false,
        }
    }

    pub const fn exiting() -> Self {
        Behavior {
            on_fail: OnFail::Exit,
            retry_once: false,
            suppress_errors: false,
            suppress_warnings: false,
            suppress_messages: false,
        }
    }

    pub const fn with_retry(mut self) -> Self {
        self.retry_once = true;
        self
    }

    /// Apply this policy to a failed operation. Returns the error for
    /// propagation unless the policy aborts the process.
    pub fn handle(&self, err: MedError) -> MedError {
        if !self.suppress_errors {
            error!(kind = ?err.kind(), "{err}");
        }
        match self.on_fail {
            OnFail::Return => err,
            OnFail::Exit => std::process::exit(1),
        }
    }

    /// Run `op`, retrying once if the policy allows and the first failure
    /// was transient.
    pub fn run<T>(&self, mut op: impl FnMut() -> crate::Result<T>) -> crate::Result<T> {
        match op() {
            Ok(v) => Ok(v),
            Err(e) if self.retry_once && e.is_transient() => match op() {
                Ok(v) => Ok(v),
                Err(e2) => Err(self.handle(e2)),
            },
            Err(e) => Err(self.handle(e)),
        }
    }
}

/// A stack of failure policies. The top entry is the "global" behavior an
/// entry point resolves to when the caller does not pass its own. Worker
/// threads receive a snapshot of their parent's stack.
#[derive(Debug, Clone)]
pub struct BehaviorStack {
    stack: Vec<Behavior>,
}

impl BehaviorStack {
    pub fn new(base: Behavior) -> Self {
        BehaviorStack { stack: vec![base] }
    }

    pub fn current(&self) -> Behavior {
        *self.stack.last().expect("behavior stack is never empty")
    }

    pub fn push(&mut self, behavior: Behavior) {
        self.stack.push(behavior);
    }

    pub fn pop(&mut self) -> Behavior {
        if self.stack.len() > 1 {
            self.stack.pop().unwrap()
        } else {
            self.current()
        }
    }
}

impl Default for BehaviorStack {
    fn default() -> Self {
        BehaviorStack::new(Behavior::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MedError;
    use std::path::PathBuf;

    #[test]
    fn retry_once_applies_to_transient_failures() {
        let behavior = Behavior::returning().with_retry();
        let mut attempts = 0;
        let result: crate::Result<i32> = behavior.run(|| {
            attempts += 1;
            if attempts == 1 {
                Err(MedError::Read {
                    path: PathBuf::from("x.tdat"),
                    offset: 0,
                    detail: "interrupted".into(),
                })
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn non_transient_failures_are_not_retried() {
        let behavior = Behavior::returning().with_retry();
        let mut attempts = 0;
        let result: crate::Result<i32> = behavior.run(|| {
            attempts += 1;
            Err(MedError::BadPassword { hint: None })
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn stack_keeps_its_base_entry() {
        let mut stack = BehaviorStack::default();
        stack.push(Behavior::exiting());
        assert_eq!(stack.current().on_fail, OnFail::Exit);
        stack.pop();
        assert_eq!(stack.current().on_fail, OnFail::Return);
        // Popping the base is a no-op.
        stack.pop();
        assert_eq!(stack.current().on_fail, OnFail::Return);
    }
}
