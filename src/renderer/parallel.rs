use std::sync::mpsc::{self, Receiver};

use crate::error::RenderError;

/// CPU work started early in a frame on the rayon pool and collected later.
///
/// `start_parallel_update` never blocks; `end_parallel_update` waits for the
/// result. Starting a new update drops the previous one unread.
pub struct ParallelUpdate<T> {
    pending: Option<Receiver<T>>,
}

impl<T: Send + 'static> ParallelUpdate<T> {
    pub fn new() -> Self {
        Self { pending: None }
    }

    pub fn start_parallel_update<F>(&mut self, work: F)
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(1);
        rayon::spawn(move || {
            // The receiver may be gone if the update was abandoned.
            let _ = sender.send(work());
        });
        self.pending = Some(receiver);
    }

    pub fn is_running(&self) -> bool {
        self.pending.is_some()
    }

    pub fn end_parallel_update(&mut self) -> Result<T, RenderError> {
        let receiver = self.pending.take().ok_or_else(|| {
            RenderError::InvariantViolation("no parallel update was started".to_string())
        })?;
        receiver.recv().map_err(|_| {
            RenderError::InvariantViolation("parallel update panicked before finishing".to_string())
        })
    }
}

impl<T: Send + 'static> Default for ParallelUpdate<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_is_collected_at_the_end() {
        let mut update = ParallelUpdate::new();
        update.start_parallel_update(|| (1..=100u32).sum::<u32>());
        assert!(update.is_running());
        assert_eq!(update.end_parallel_update().unwrap(), 5050);
        assert!(!update.is_running());
    }

    #[test]
    fn ending_without_start_is_an_error() {
        let mut update = ParallelUpdate::<u8>::new();
        assert!(matches!(
            update.end_parallel_update(),
            Err(RenderError::InvariantViolation(_))
        ));
    }

    #[test]
    fn restarting_replaces_the_pending_update() {
        let mut update = ParallelUpdate::new();
        update.start_parallel_update(|| 1);
        update.start_parallel_update(|| 2);
        assert_eq!(update.end_parallel_update().unwrap(), 2);
    }
}
