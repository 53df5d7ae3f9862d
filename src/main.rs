#[macro_use]
extern crate log;

use std::env::consts::{ARCH, FAMILY, OS};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use anyhow::Error;
use log::LevelFilter;
use parking_lot::Mutex;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, TermLogger, TerminalMode, WriteLogger,
};

use crate::program::Program;

mod cli;
mod engine;
mod program;
mod sites;

/// Name of the log file kept next to the executable.
const LOG_NAME: &str = "tagrip.log";

/// A buffered log file writer. Lines are flushed in batches so a crash loses
/// little while steady logging stays off the disk's hot path.
struct BufferedFileWriter {
    inner: Arc<Mutex<BufWriter<std::fs::File>>>,
    line_count: Arc<Mutex<usize>>,
}

impl BufferedFileWriter {
    fn new() -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(LOG_NAME)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(64 * 1024, file))),
            line_count: Arc::new(Mutex::new(0)),
        })
    }
}

impl Write for BufferedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.inner.lock();
        let size = writer.write(buf)?;

        let newlines = buf.iter().filter(|&&b| b == b'\n').count();
        if newlines > 0 {
            let mut count = self.line_count.lock();
            *count += newlines;
            // Flush every 50 lines so a crash loses at most one batch.
            if *count % 50 == 0 {
                writer.flush()?;
            }
        }
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl Drop for BufferedFileWriter {
    fn drop(&mut self) {
        let _ = self.inner.lock().flush();
    }
}

fn main() -> Result<(), Error> {
    initialize_logger();
    log_system_information();

    let program = Program::new();
    if let Err(err) = program.run() {
        error!("{err}");
        return Err(err);
    }
    Ok(())
}

/// Initializes the combined terminal and file logger. When the log file
/// cannot be opened, logging degrades to the terminal alone.
fn initialize_logger() {
    let mut config = ConfigBuilder::new();
    config.add_filter_allow_str("tagrip");

    let file_writer = match BufferedFileWriter::new() {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!("Failed to open {LOG_NAME}: {e}. Logging to the terminal only.");
            let _ = TermLogger::init(
                LevelFilter::Info,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            );
            return;
        }
    };

    if let Err(e) = CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::max(), config.build(), file_writer),
    ]) {
        eprintln!("Failed to initialize the combined logger: {e}. Logging to the terminal only.");
        let _ = TermLogger::init(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        );
    }
}

/// Logs system information for debugging.
fn log_system_information() {
    trace!("ARCH:   \"{}\"", ARCH);
    trace!("FAMILY: \"{}\"", FAMILY);
    trace!("OS:     \"{}\"", OS);
}
