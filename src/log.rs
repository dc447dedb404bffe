//! `log` backend printing on the SBI debug console.

use core::fmt::{self, Write};

use ::log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

const GUEST_LINE_MAX: usize = 128;

static LOGGER: ConsoleLogger = ConsoleLogger {
    sink: Mutex::new(None),
};

pub struct ConsoleLogger {
    sink: Mutex<Option<fn(&str)>>,
}

/// Writer over a sink function.
struct Writer(fn(&str));

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= ::log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = *self.sink.lock() {
            // nowhere to report a console failure
            let _ = write!(
                Writer(sink),
                "[COVEMM] {:<5} {}: {}\r\n",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Level used by [`init`] unless the caller asks otherwise.
pub fn default_level() -> LevelFilter {
    if cfg!(feature = "debug_log") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs the logger over `sink`. Later calls only replace the sink and the level.
pub fn init_with_sink(sink: fn(&str), level: LevelFilter) -> Result<(), SetLoggerError> {
    *LOGGER.sink.lock() = Some(sink);
    ::log::set_max_level(level);
    ::log::set_logger(&LOGGER)
}

#[cfg(target_arch = "riscv64")]
fn debug_console_write(s: &str) {
    use common::sbi::{sbi_call, SBI_DBCN_CONSOLE_WRITE, SBI_DBCN_EXT_ID};

    let ptr = s.as_ptr() as usize;
    sbi_call(
        SBI_DBCN_EXT_ID,
        SBI_DBCN_CONSOLE_WRITE,
        &[s.len(), ptr & 0xffff_ffff, (ptr >> 32) & 0xffff_ffff, 0, 0, 0],
    );
}

/// Installs the logger on the SBI debug console.
#[cfg(target_arch = "riscv64")]
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    init_with_sink(debug_console_write, level)
}

/// Collects the bytes a guest prints one at a time into lines.
#[derive(Default)]
pub struct LineBuffer {
    line: heapless::String<GUEST_LINE_MAX>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a byte. Returns the finished line on newline or when the buffer is full.
    pub fn push(&mut self, byte: u8) -> Option<heapless::String<GUEST_LINE_MAX>> {
        match byte {
            b'\r' => None,
            b'\n' => Some(core::mem::take(&mut self.line)),
            _ => {
                let c = if byte.is_ascii() { byte as char } else { '?' };
                if self.line.push(c).is_err() {
                    let full = core::mem::take(&mut self.line);
                    let _ = self.line.push(c);
                    return Some(full);
                }
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.line.is_empty()
    }
}
