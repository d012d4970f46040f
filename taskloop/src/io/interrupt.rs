//! Operator interrupt (SIGINT) shared by the loop and the process supervisor.
//!
//! The first Ctrl-C raises the flag: a running command is killed and reported
//! as interrupted, or the loop stops at its next turn boundary. A second
//! Ctrl-C while the flag is still raised terminates the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::debug;

/// Cloneable handle to the interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    /// A flag that is only raised programmatically (tests, embedding).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register SIGINT handlers that raise this flag.
    #[cfg(unix)]
    pub fn install() -> Result<Self> {
        use anyhow::Context;
        use signal_hook::consts::signal::SIGINT;
        use signal_hook::flag;

        let interrupt = Self::new();
        // Order matters: the conditional shutdown must observe the flag before it is set.
        flag::register_conditional_shutdown(SIGINT, 130, Arc::clone(&interrupt.flag))
            .context("register SIGINT shutdown handler")?;
        flag::register(SIGINT, Arc::clone(&interrupt.flag))
            .context("register SIGINT flag handler")?;
        debug!("interrupt handler installed");
        Ok(interrupt)
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Self> {
        debug!("interrupt handler unavailable on this platform");
        Ok(Self::new())
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Consume a raised flag. Returns whether it was raised.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_the_flag_for_all_clones() {
        let interrupt = Interrupt::new();
        let other = interrupt.clone();
        assert!(!interrupt.take());

        other.raise();
        assert!(interrupt.is_raised());
        assert!(interrupt.take());
        assert!(!other.is_raised());
    }
}
