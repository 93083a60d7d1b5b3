use log::{Level, LevelFilter, Metadata, Record};

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        println!(
            "\x1b[{}m[{}] {}\x1b[0m",
            level_to_color_code(record.level()),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Installs the console logger. The level comes from `LOG` at build time.
pub fn init() {
    static LOGGER: SimpleLogger = SimpleLogger;
    match log::set_logger(&LOGGER) {
        Ok(_) => println!("[logging] set LOGGER success"),
        Err(err) => panic!("set LOGGER ERROR, {}", err),
    };
    log::set_max_level(max_level(option_env!("LOG")))
}

fn max_level(env: Option<&str>) -> LevelFilter {
    match env {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}
