use crate::config::log_level;
use log::{Level, Log, Metadata, Record};

static LOGGER: Logger = Logger;

struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let label = match record.level() {
                Level::Trace => "[trace] ",
                Level::Debug => "[debug] ",
                Level::Info => "[info]  ",
                Level::Warn => "[warn]  ",
                Level::Error => "[error] ",
            };

            crate::console_print(format_args!("{}{}: {}\n", label, record.target(), record.args()));
        }
    }

    fn flush(&self) {}
}

pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log_level().to_level_filter()))
        .expect("Error setting logger!");
}
