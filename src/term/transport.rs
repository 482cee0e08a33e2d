//! Upload strategies for getting encoded image bytes into the terminal.
//!
//! `file` hands the terminal a temp-file path, `stream` sends chunked
//! base64 inline. `temp` is a reserved sentinel and always rejected.

use crate::term::command::{abort_command, transmit_command, Format};
use crate::term::writer::TerminalWriter;
use crate::utils::{IkupError, Result};
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    File,
    Stream,
    Temp,
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::File => "file",
            Transport::Stream => "stream",
            Transport::Temp => "temp",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transport {
    type Err = IkupError;

    fn from_str(s: &str) -> Result<Transport> {
        match s {
            "file" | "f" => Ok(Transport::File),
            // Stream and direct are the same wire bytes.
            "stream" | "direct" | "d" => Ok(Transport::Stream),
            "temp" | "t" => Ok(Transport::Temp),
            other => Err(IkupError::invalid_arg(format!(
                "invalid upload method '{}', expected file, stream or direct",
                other
            ))),
        }
    }
}

/// Everything an upload needs besides the encoded bytes.
#[derive(Debug, Clone)]
pub struct UploadParams {
    pub id: u32,
    pub cols: u32,
    pub rows: u32,
    pub format: Format,
    /// Base64 bytes per chunked command.
    pub chunk_size: usize,
    /// Artificial delay after each command, for stall testing.
    pub command_delay: Duration,
}

/// Emit the transmit sequence for `data` over the given transport.
/// `progress` is called with the cumulative payload bytes after each
/// command hits the wire; the caller throttles its own status updates.
/// Returns the number of payload bytes sent.
pub fn upload(
    transport: Transport,
    writer: &mut TerminalWriter,
    params: &UploadParams,
    data: &[u8],
    progress: &mut dyn FnMut(u64) -> Result<()>,
) -> Result<u64> {
    match transport {
        Transport::Temp => Err(IkupError::transport("temp")),
        Transport::File => upload_file(writer, params, data, progress),
        Transport::Stream => upload_stream(writer, params, data, progress),
    }
}

fn upload_file(
    writer: &mut TerminalWriter,
    params: &UploadParams,
    data: &[u8],
    progress: &mut dyn FnMut(u64) -> Result<()>,
) -> Result<u64> {
    // The terminal reads the file after we return, so the temp file must
    // outlive this process; terminals delete tty-graphics-protocol-* files
    // after reading them.
    let mut tmp = tempfile::Builder::new()
        .prefix("tty-graphics-protocol-")
        .suffix(".img")
        .tempfile()?;
    tmp.write_all(data)?;
    tmp.flush()?;
    let (_, path) = tmp.keep().map_err(|e| IkupError::Io(e.error))?;
    log::debug!("Wrote {} upload bytes to {}", data.len(), path.display());

    let command = transmit_command(params.id, 'f', params.format, params.cols, params.rows)
        .set_filename(&path.to_string_lossy());
    writer.write_command(&command.to_bytes())?;
    maybe_delay(params.command_delay);
    progress(data.len() as u64)?;
    Ok(data.len() as u64)
}

fn upload_stream(
    writer: &mut TerminalWriter,
    params: &UploadParams,
    data: &[u8],
    progress: &mut dyn FnMut(u64) -> Result<()>,
) -> Result<u64> {
    // A final m=0 bracket first, so a half-finished transmission from a
    // crashed process cannot swallow our chunks.
    writer.write_command(&abort_command(params.id).to_bytes())?;

    let mut command = transmit_command(params.id, 'd', params.format, params.cols, params.rows)
        .set_data(data);
    command.more = Some(true);
    let chunks = command.split(params.chunk_size);
    let mut sent: u64 = 0;
    for chunk in chunks {
        sent += chunk.payload.len() as u64;
        writer.write_command(&chunk.to_bytes())?;
        maybe_delay(params.command_delay);
        progress(sent)?;
    }
    Ok(sent)
}

fn maybe_delay(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};

    fn params(id: u32, chunk_size: usize) -> UploadParams {
        UploadParams {
            id,
            cols: 5,
            rows: 2,
            format: Format::Png,
            chunk_size,
            command_delay: Duration::ZERO,
        }
    }

    fn capture_writer(dir: &std::path::Path) -> (TerminalWriter, std::path::PathBuf) {
        let out = dir.join("commands.bin");
        let writer = TerminalWriter::open(Some(&out), Some(&dir.join("display.bin"))).unwrap();
        (writer, out)
    }

    #[test]
    fn test_transport_parsing() {
        assert_eq!("file".parse::<Transport>().unwrap(), Transport::File);
        assert_eq!("stream".parse::<Transport>().unwrap(), Transport::Stream);
        assert_eq!("direct".parse::<Transport>().unwrap(), Transport::Stream);
        assert_eq!("temp".parse::<Transport>().unwrap(), Transport::Temp);
        assert!("unknown".parse::<Transport>().is_err());
    }

    #[test]
    fn test_temp_transport_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, _) = capture_writer(dir.path());
        let err = upload(
            Transport::Temp,
            &mut writer,
            &params(1, 4096),
            b"data",
            &mut |_| Ok(()),
        )
        .unwrap_err();
        assert!(matches!(err, IkupError::TransportUnsupported(_)));
    }

    #[test]
    fn test_file_transport_writes_payload_path() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, out) = capture_writer(dir.path());
        let sent = upload(
            Transport::File,
            &mut writer,
            &params(42, 4096),
            b"image-bytes",
            &mut |_| Ok(()),
        )
        .unwrap();
        assert_eq!(sent, 11);
        let emitted = std::fs::read_to_string(&out).unwrap();
        assert!(emitted.starts_with("\x1b_Gi=42,t=f,q=2,a=T,U=1,f=100,r=2,c=5;"));
        let payload = emitted
            .split(';')
            .nth(1)
            .unwrap()
            .trim_end_matches("\x1b\\");
        let path = String::from_utf8(STANDARD.decode(payload).unwrap()).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"image-bytes");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_stream_transport_chunks_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, out) = capture_writer(dir.path());
        let data = vec![7u8; 300];
        let mut updates = Vec::new();
        upload(
            Transport::Stream,
            &mut writer,
            &params(9, 100),
            &data,
            &mut |sent| {
                updates.push(sent);
                Ok(())
            },
        )
        .unwrap();
        let emitted = std::fs::read_to_string(&out).unwrap();
        // Abort bracket first, then the chunked transmission.
        assert!(emitted.starts_with("\x1b_Gi=9,q=2,m=0;\x1b\\"));
        assert!(emitted.contains("i=9,t=d,q=2,m=1,a=T,U=1,f=100,r=2,c=5;"));
        assert!(emitted.contains("\x1b_Gi=9,m=1;"));
        // Exactly one final chunk besides the abort bracket.
        assert_eq!(emitted.matches("m=0;").count(), 2);
        // Progress is cumulative and monotonic.
        assert!(updates.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*updates.last().unwrap(), STANDARD.encode(&data).len() as u64);
    }
}
