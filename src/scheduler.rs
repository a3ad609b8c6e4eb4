//! Playback scheduler
//!
//! A single dedicated thread drives scheduled ticks. The thread hosts a
//! current-thread tokio runtime whose loop selects over a command channel and
//! an interval timer. Commands are polled first, so a `Stop` queued before a
//! due tick always wins, while a tick that is already running is never
//! interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

#[derive(Debug)]
enum SchedulerCommand {
    Start(Duration),
    Stop,
    Shutdown,
}

/// Repeating tick driver with play/pause control.
pub struct PlaybackScheduler {
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    playing: Arc<AtomicBool>,
    shut_down: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl PlaybackScheduler {
    /// Starts the scheduler thread in the stopped state.
    ///
    /// # Arguments
    /// * `tick` - Invoked on the scheduler thread once per interval while playing
    ///
    /// # Errors
    /// Returns an error if the runtime or the thread can't be created.
    pub fn spawn<F>(tick: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        let playing = Arc::new(AtomicBool::new(false));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let worker_playing = Arc::clone(&playing);
        let worker = std::thread::Builder::new()
            .name("replay-scheduler".to_string())
            .spawn(move || {
                runtime.block_on(run_loop(receiver, worker_playing, tick));
                log::debug!("Replay scheduler stopped");
            })?;

        Ok(PlaybackScheduler {
            commands,
            playing,
            shut_down: AtomicBool::new(false),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Starts ticking every `interval`, first tick immediately.
    ///
    /// Returns `false` (and does nothing) if already playing or shut down.
    pub fn play(&self, interval: Duration) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            log::warn!("Replay scheduler is shut down; ignoring play");
            return false;
        }
        if self.playing.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.send(SchedulerCommand::Start(interval.max(Duration::from_millis(1))));
        true
    }

    /// Stops ticking. A tick already in progress runs to completion.
    ///
    /// Returns `false` (and does nothing) if already stopped.
    pub fn pause(&self) -> bool {
        if !self.playing.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.send(SchedulerCommand::Stop);
        true
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Stops the scheduler thread permanently.
    ///
    /// Waits for the thread to exit unless called from the scheduler thread itself.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        let _ = self.commands.send(SchedulerCommand::Shutdown);

        if std::thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("Replay scheduler thread panicked");
            }
        }
    }

    fn send(&self, command: SchedulerCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("Replay scheduler is shut down; ignoring command");
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_loop<F>(
    mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    playing: Arc<AtomicBool>,
    tick: F,
) where
    F: Fn(),
{
    let mut ticker: Option<Interval> = None;

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(SchedulerCommand::Start(interval)) => {
                    let mut interval = tokio::time::interval(interval);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker = Some(interval);
                }
                Some(SchedulerCommand::Stop) => ticker = None,
                Some(SchedulerCommand::Shutdown) | None => break,
            },

            _ = next_tick(&mut ticker) => {
                if playing.load(Ordering::SeqCst) {
                    tick();
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_scheduler() -> (PlaybackScheduler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let scheduler = PlaybackScheduler::spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        (scheduler, count)
    }

    #[test]
    fn test_starts_stopped() {
        let (scheduler, count) = counting_scheduler();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!scheduler.is_playing());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_tick_is_immediate() {
        let (scheduler, count) = counting_scheduler();
        assert!(scheduler.play(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ticks_repeat_until_paused() {
        let (scheduler, count) = counting_scheduler();
        scheduler.play(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(100));
        assert!(scheduler.pause());

        // Let any in-flight tick settle
        std::thread::sleep(Duration::from_millis(20));
        let after_pause = count.load(Ordering::SeqCst);
        assert!(after_pause >= 2);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_pause);
    }

    #[test]
    fn test_play_and_pause_are_idempotent() {
        let (scheduler, _count) = counting_scheduler();
        assert!(scheduler.play(Duration::from_millis(50)));
        assert!(!scheduler.play(Duration::from_millis(50)));
        assert!(scheduler.is_playing());

        assert!(scheduler.pause());
        assert!(!scheduler.pause());
        assert!(!scheduler.is_playing());
    }

    #[test]
    fn test_shutdown_stops_thread() {
        let (scheduler, count) = counting_scheduler();
        scheduler.play(Duration::from_millis(5));
        scheduler.shutdown();

        let after = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after);
        assert!(!scheduler.is_playing());

        assert!(!scheduler.play(Duration::from_millis(5)));
        assert!(!scheduler.is_playing());
    }
}
