use alloc::format;
use log::{LevelFilter, Metadata, Record};

/// Forwards formatted log records to a platform sink, such as the kernel
/// debugger output.
pub struct KernelLogger {
    sink: fn(&str),
    level: LevelFilter,
}

impl KernelLogger {
    pub const fn new(sink: fn(&str), level: LevelFilter) -> Self {
        Self { sink, level }
    }

    /// Installs the logger. Fails if another logger was installed first.
    pub fn init(&'static self) -> Result<(), log::SetLoggerError> {
        log::set_logger(self).map(|()| log::set_max_level(self.level))
    }
}

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = format!("{} - {}\n", record.level(), record.args());

            (self.sink)(&message);
        }
    }

    fn flush(&self) {}
}
