use crate::error::CalibanError;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    // Once registered, SIGINT and SIGTERM no longer terminate the process.
    pub fn register() -> Result<Self, CalibanError> {
        let interrupt = Self::default();
        flag::register(SIGINT, Arc::clone(&interrupt.raised))?;
        flag::register(SIGTERM, Arc::clone(&interrupt.raised))?;
        Ok(interrupt)
    }

    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), CalibanError> {
        if self.is_set() {
            return Err(CalibanError::Interrupted);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Relaxed);
    }
}
