use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::CalibrationError;

/// Cooperative cancellation flag shared between an operator and a running solve.
///
/// Clones share the flag. Solves poll it between views and iterations and
/// return [`CalibrationError::Cancelled`], discarding partial results.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), CalibrationError> {
        if self.is_cancelled() {
            Err(CalibrationError::Cancelled)
        } else {
            Ok(())
        }
    }
}
