/// Logs a line under a component name, which becomes the record's target.
/// Usage:
/// ```rust
/// use log::Level;
/// tdt_agent::tdt_log!(Level::Info, "agent", "Engine constructed");
/// tdt_agent::tdt_log!(Level::Error, "registry", "Dispatch failed: {}", "unknown context");
/// ```
/// The fern formatter installed by `logging::setup` prints the target in
/// its third field, so a line ends up as:
/// [2025-04-25T16:32:10+02:00][DEBUG][registry][pid=4568][tid=ThreadId(3)] Dispatch failed: unknown context
#[macro_export]
macro_rules! tdt_log {
    ($level:expr, $component:expr, $($arg:tt)+) => {
        log::log!(target: $component, $level, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use log::{Level, LevelFilter, Log, Metadata, Record};
    use std::sync::{Mutex, OnceLock};

    /// (target, level, message) of every record seen by the test logger.
    static CAPTURED: Mutex<Vec<(String, Level, String)>> = Mutex::new(Vec::new());

    struct Capture;

    impl Log for Capture {
        fn enabled(&self, _: &Metadata) -> bool {
            true
        }
        fn log(&self, record: &Record) {
            CAPTURED.lock().unwrap().push((
                record.target().to_owned(),
                record.level(),
                record.args().to_string(),
            ));
        }
        fn flush(&self) {}
    }

    static CAPTURE: Capture = Capture;

    fn install() {
        static INSTALLED: OnceLock<()> = OnceLock::new();
        INSTALLED.get_or_init(|| {
            log::set_logger(&CAPTURE).expect("unit tests install no other logger");
            log::set_max_level(LevelFilter::Trace);
        });
    }

    fn lines_for(target: &str) -> Vec<(Level, String)> {
        CAPTURED
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == target)
            .map(|(_, level, msg)| (*level, msg.clone()))
            .collect()
    }

    #[test]
    fn component_becomes_target() {
        install();
        tdt_log!(Level::Debug, "macro-check", "context={} agent={}", 42, 7);
        tdt_log!(Level::Warn, "macro-check", "no arguments");

        assert_eq!(
            lines_for("macro-check"),
            vec![
                (Level::Debug, "context=42 agent=7".to_owned()),
                (Level::Warn, "no arguments".to_owned()),
            ]
        );
    }

    #[test]
    fn trailing_comma_and_inline_args() {
        install();
        let context = 9;
        tdt_log!(Level::Info, "macro-inline", "context {context} released",);
        assert_eq!(lines_for("macro-inline"), vec![(Level::Info, "context 9 released".to_owned())]);
    }
}
