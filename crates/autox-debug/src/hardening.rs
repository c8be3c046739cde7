use std::sync::Once;

use autox_config::LoggingConfig;

static PANIC_HOOK: Once = Once::new();

/// Initialize structured logging and install a process-wide panic hook that records panics
/// through `tracing`.
///
/// Request handlers and paused-thread requests still isolate panics with `catch_unwind`; the
/// hook only makes panics on other threads (interpreter workers, the connection loops) visible
/// in the log.
pub fn init(config: &LoggingConfig) {
    autox_config::init_tracing(config);
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let thread = std::thread::current();
            let location = info
                .location()
                .map(|location| format!("{}:{}", location.file(), location.line()))
                .unwrap_or_default();
            tracing::error!(
                target: "autox.debug",
                thread = thread.name().unwrap_or("<unnamed>"),
                location = %location,
                "panic: {}",
                crate::error::panic_message(info.payload())
            );
            if cfg!(debug_assertions) {
                previous(info);
            }
        }));
    });
}
