//! Browser console plumbing: `log` records and panics go to
//! `web_sys::console`. Native builds keep whatever logger the host installed.

#[cfg(target_arch = "wasm32")]
mod logger {
    use log::{Level, Log, Metadata, Record};
    use wasm_bindgen::JsValue;

    pub struct ConsoleLogger;

    pub static LOGGER: ConsoleLogger = ConsoleLogger;

    impl Log for ConsoleLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let line = JsValue::from_str(&format!("[{}] {}", record.target(), record.args()));
            match record.level() {
                Level::Error => web_sys::console::error_1(&line),
                Level::Warn => web_sys::console::warn_1(&line),
                Level::Info => web_sys::console::info_1(&line),
                Level::Debug => web_sys::console::debug_1(&line),
                Level::Trace => web_sys::console::log_1(&line),
            }
        }

        fn flush(&self) {}
    }
}

/// Install the console logger and the panic hook. Only the first call has
/// an effect.
pub fn init() {
    #[cfg(target_arch = "wasm32")]
    {
        use std::sync::Once;
        static SET_HOOK: Once = Once::new();
        SET_HOOK.call_once(|| {
            if log::set_logger(&logger::LOGGER).is_ok() {
                log::set_max_level(log::LevelFilter::Info);
            }
            std::panic::set_hook(Box::new(|info| {
                let msg = format!("BF WASM panic: {info}");
                web_sys::console::error_1(&msg.into());
            }));
        });
    }
}
