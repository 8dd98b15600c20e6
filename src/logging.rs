//! Log capture.
//!
//! Records go to `env_logger` (when console output is wanted) and into a
//! bounded in-memory queue the coordinating process drains with
//! [`get_log_messages`].

use std::{collections::VecDeque, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::parameters::LogLevel;

const MAX_QUEUED_MESSAGES: usize = 1024;
const BLOCKING_WAIT: Duration = Duration::from_millis(500);

lazy_static::lazy_static! {
    static ref QUEUE: LogQueue = LogQueue::default();
}

#[derive(Default)]
struct LogQueue {
    messages: Mutex<VecDeque<String>>,
    available: Condvar,
}

impl LogQueue {
    fn push(&self, message: String) {
        let mut messages = self.messages.lock();
        if messages.len() == MAX_QUEUED_MESSAGES {
            messages.pop_front();
        }
        messages.push_back(message);
        self.available.notify_one();
    }

    fn pop(&self, blocking: bool) -> Option<String> {
        let mut messages = self.messages.lock();
        if messages.is_empty() && blocking {
            self.available.wait_for(&mut messages, BLOCKING_WAIT);
        }
        messages.pop_front()
    }
}

struct CapturingLogger {
    console: Option<env_logger::Logger>,
}

impl log::Log for CapturingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(console) = &self.console {
            if console.matches(record) {
                console.log(record);
            }
        }
        QUEUE.push(format!(
            "[{} {}] {}",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {
        if let Some(console) = &self.console {
            console.flush();
        }
    }
}

/// Installs the process logger. Only the first call in a process has an
/// effect.
pub fn init_logging(to_console: bool) {
    let console = to_console.then(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).build()
    });
    if log::set_boxed_logger(Box::new(CapturingLogger { console })).is_ok() {
        log::set_max_level(LogLevel::Debug.to_level_filter());
    }
}

pub fn set_log_level(level: LogLevel) {
    log::set_max_level(level.to_level_filter());
}

/// Takes the oldest captured message. With `blocking`, waits a short while
/// for one to arrive.
pub fn get_log_messages(blocking: bool) -> Option<String> {
    QUEUE.pop(blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_bounded() {
        let queue = LogQueue::default();
        for i in 0..MAX_QUEUED_MESSAGES + 10 {
            queue.push(i.to_string());
        }
        assert_eq!(queue.pop(false), Some("10".to_string()));
        assert_eq!(queue.messages.lock().len(), MAX_QUEUED_MESSAGES - 1);
    }

    #[test]
    fn blocking_pop_times_out() {
        let queue = LogQueue::default();
        assert_eq!(queue.pop(true), None);
    }

    #[test]
    fn captured_records_can_be_drained() {
        init_logging(false);
        set_log_level(LogLevel::Debug);
        log::info!("captured-marker-7f3a");
        let found = std::iter::from_fn(|| get_log_messages(false))
            .any(|m| m.contains("captured-marker-7f3a"));
        assert!(found);
    }
}
