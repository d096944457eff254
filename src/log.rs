use std::io::Write;

use env_logger::Builder;
use once_cell::sync::OnceCell;

static LOG_INIT: OnceCell<()> = OnceCell::new();

/// Install the process-wide logger.
///
/// Lines come out as `[<timestamp>] [<LEVEL>] [<component>] <message>`,
/// where the component is the Rust module that emitted the record. Safe to
/// call any number of times; only the first call does anything, so tests
/// can call it from every entry point.
pub fn init_log() {
    LOG_INIT.get_or_init(|| {
        let mut builder = Builder::from_default_env();
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{}] [{}] [{}] {}",
                    buf.timestamp(),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .try_init()
            .ok();
    });
}
