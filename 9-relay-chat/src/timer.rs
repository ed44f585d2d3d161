//! Single-shot timers that report back to an event loop.
//!
//! Arming spawns a task that sleeps and then posts an event on the owner's
//! channel. Each arm gets a fresh generation; the owner asks [`Timer::fire`]
//! whether a delivered event still belongs to the current arm, because a
//! firing can already be queued when the timer is stopped or rearmed.

use std::time::Duration;

use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};

#[derive(Debug, Default)]
pub struct Timer {
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)arms the timer. `event` receives the generation of this arm.
    pub fn arm<E, F>(&mut self, after: Duration, events: &UnboundedSender<E>, event: F) -> u64
    where
        E: Send + 'static,
        F: FnOnce(u64) -> E,
    {
        self.stop();
        self.generation += 1;

        let event = event(self.generation);
        let events = events.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        }));

        self.generation
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Consumes a firing. Returns `false` for events from an earlier arm or
    /// from a timer that has since been stopped.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.task.is_none() || generation != self.generation {
            return false;
        }
        self.task = None;
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
