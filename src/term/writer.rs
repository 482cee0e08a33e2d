//! Terminal byte streams and geometry probing.
//!
//! Graphics commands and placeholder cells go to two (possibly different)
//! streams: commands default to the controlling tty, display output to
//! stdout. Within one process the streams are written sequentially, so
//! bytes of different graphics commands never interleave.

use crate::utils::Result;
use crossterm::tty::IsTty;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

enum Stream {
    Stdout,
    Tty(std::fs::File),
    File(std::fs::File),
}

impl Stream {
    fn is_tty(&self) -> bool {
        match self {
            Stream::Stdout => std::io::stdout().is_tty(),
            Stream::Tty(_) => true,
            Stream::File(_) => false,
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Stdout => std::io::stdout().write_all(bytes),
            Stream::Tty(f) | Stream::File(f) => f.write_all(bytes),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Stdout => std::io::stdout().flush(),
            Stream::Tty(f) | Stream::File(f) => f.flush(),
        }
    }
}

pub struct TerminalWriter {
    command: Stream,
    display: Stream,
}

impl TerminalWriter {
    /// `out_command` / `out_display` override the default streams (the
    /// controlling tty and stdout). Explicit paths are created/truncated.
    pub fn open(out_command: Option<&Path>, out_display: Option<&Path>) -> Result<Self> {
        let display = match out_display {
            Some(path) => Stream::File(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?,
            ),
            None => Stream::Stdout,
        };
        let command = match out_command {
            Some(path) => Stream::File(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?,
            ),
            None => match OpenOptions::new().write(true).open("/dev/tty") {
                Ok(tty) => Stream::Tty(tty),
                Err(err) => {
                    log::warn!("Cannot open /dev/tty ({}), sending commands to stdout", err);
                    Stream::Stdout
                }
            },
        };
        Ok(Self { command, display })
    }

    pub fn display_is_tty(&self) -> bool {
        self.display.is_tty()
    }

    /// Write one complete graphics command. The display stream is flushed
    /// first so commands and placeholder cells stay ordered on the wire.
    pub fn write_command(&mut self, bytes: &[u8]) -> Result<()> {
        self.display.flush()?;
        self.command.write_all(bytes)?;
        self.command.flush()?;
        Ok(())
    }

    pub fn write_display(&mut self, bytes: &[u8]) -> Result<()> {
        self.display.write_all(bytes)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.display.flush()?;
        self.command.flush()?;
        Ok(())
    }

    /// Terminal size in cells, if the output is a terminal.
    pub fn terminal_size(&self) -> Option<(u32, u32)> {
        crossterm::terminal::size()
            .ok()
            .filter(|&(cols, rows)| cols > 0 && rows > 0)
            .map(|(cols, rows)| (cols as u32, rows as u32))
    }

    /// Cell size in pixels derived from the window size report, when the
    /// terminal provides pixel dimensions.
    pub fn cell_size(&self) -> Option<(u32, u32)> {
        let ws = crossterm::terminal::window_size().ok()?;
        if ws.columns == 0 || ws.rows == 0 || ws.width == 0 || ws.height == 0 {
            return None;
        }
        Some((
            (ws.width / ws.columns) as u32,
            (ws.height / ws.rows) as u32,
        ))
    }

    /// Current 0-based cursor position (col, row). Requires a tty; used
    /// only when a position formula mentions `cx`/`cy`.
    pub fn cursor_position(&self) -> Option<(u32, u32)> {
        crossterm::cursor::position()
            .ok()
            .map(|(col, row)| (col as u32, row as u32))
    }
}
