use std::fmt;
use std::io::Write;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use env_logger::Env;

/// Install the stderr logger. `role` labels records from the main thread of this process.
///
/// `RUST_LOG` overrides the default filter (`debug` in debug builds, `warn` otherwise).
pub fn init(role: &str) {
    let default_filter = if cfg!(debug_assertions) { "debug" } else { "warn" };
    let role = role.to_string();
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format(move |buf, record| {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            let current = thread::current();
            let name = match current.name() {
                Some("main") | None => role.as_str(),
                Some(name) => name,
            };
            writeln!(buf, "[{ts}ms][{name}][{}] {}", record.level(), record.args())
        })
        .try_init();
}

/// Print one console line and flush, so interleaved process output stays line-ordered.
pub fn announce_line(line: fmt::Arguments<'_>) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

#[macro_export]
macro_rules! announce {
    ($($arg:tt)*) => {
        $crate::logging::announce_line(format_args!($($arg)*))
    };
}
