use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest instance name, in characters.
pub const MAX_INSTANCE_NAME: usize = 64;
/// Longest crash dump directory, in characters.
pub const MAX_CRASH_DUMPS_PATH: usize = 260;

const DEFAULT_INSTANCE_NAME: &str = "usvfs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl LogLevel {
    pub fn from_raw(value: u8) -> Option<LogLevel> {
        Some(match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CrashDumpsType {
    None = 0,
    Mini = 1,
    Data = 2,
    Full = 3,
}

impl CrashDumpsType {
    pub fn from_raw(value: u8) -> Option<CrashDumpsType> {
        Some(match value {
            0 => CrashDumpsType::None,
            1 => CrashDumpsType::Mini,
            2 => CrashDumpsType::Data,
            3 => CrashDumpsType::Full,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CrashDumpsType::None => "none",
            CrashDumpsType::Mini => "mini",
            CrashDumpsType::Data => "data",
            CrashDumpsType::Full => "full",
        }
    }
}

/// Session settings shared with every hooked process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    instance_name: String,
    debug_mode: bool,
    log_level: LogLevel,
    crash_dumps_type: CrashDumpsType,
    crash_dumps_path: String,
    process_delay: Duration,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            instance_name: DEFAULT_INSTANCE_NAME.to_owned(),
            debug_mode: false,
            log_level: LogLevel::Debug,
            crash_dumps_type: CrashDumpsType::None,
            crash_dumps_path: String::new(),
            process_delay: Duration::ZERO,
        }
    }
}

fn truncated(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

impl Parameters {
    pub fn new() -> Parameters {
        Parameters::default()
    }

    pub fn copy_from(&mut self, source: &Parameters) {
        self.clone_from(source);
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Names longer than [`MAX_INSTANCE_NAME`] are cut.
    pub fn set_instance_name(&mut self, name: &str) {
        self.instance_name = truncated(name, MAX_INSTANCE_NAME);
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn set_debug_mode(&mut self, debug_mode: bool) {
        self.debug_mode = debug_mode;
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn set_log_level(&mut self, level: LogLevel) {
        self.log_level = level;
    }

    pub fn crash_dumps_type(&self) -> CrashDumpsType {
        self.crash_dumps_type
    }

    pub fn set_crash_dumps_type(&mut self, dump_type: CrashDumpsType) {
        self.crash_dumps_type = dump_type;
    }

    pub fn crash_dumps_path(&self) -> &str {
        &self.crash_dumps_path
    }

    pub fn set_crash_dumps_path(&mut self, path: &str) {
        self.crash_dumps_path = truncated(path, MAX_CRASH_DUMPS_PATH);
    }

    pub fn process_delay(&self) -> Duration {
        self.process_delay
    }

    /// Negative delays count as zero.
    pub fn set_process_delay(&mut self, milliseconds: i32) {
        self.process_delay = Duration::from_millis(milliseconds.max(0) as u64);
    }
}
