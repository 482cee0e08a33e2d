//! Kitty graphics protocol command framing.
//!
//! Commands are `ESC _ G <kv-list> ; <payload> ESC \` with a comma-separated
//! key=value list. Emitted keys always appear in the order
//! `i,t,q,m,a,U,f,r,c`; absent keys are skipped.

use base64::{engine::general_purpose::STANDARD, Engine};

/// Pixel format codes of the `f` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Rgb,
    Rgba,
    Png,
}

impl Format {
    pub fn code(&self) -> u32 {
        match self {
            Format::Rgb => 24,
            Format::Rgba => 32,
            Format::Png => 100,
        }
    }
}

/// One graphics command. Only the keys this tool emits are modelled.
#[derive(Debug, Clone, Default)]
pub struct GraphicsCommand {
    pub image_id: Option<u32>,
    /// Transmission medium key `t`: 'f' for file, 'd' for direct.
    pub medium: Option<char>,
    /// Quiet level `q`; fixed at 2 for every transmission we issue.
    pub quiet: Option<u8>,
    /// `m`: true when more chunks follow.
    pub more: Option<bool>,
    /// Action `a`: 'T' transmit+display, 't' transmit only.
    pub action: Option<char>,
    /// `U=1` requests a Unicode-placeholder placement.
    pub unicode_placeholder: bool,
    pub format: Option<Format>,
    pub rows: Option<u32>,
    pub cols: Option<u32>,
    /// Raw payload, base64-encoded by the caller.
    pub payload: Vec<u8>,
}

impl GraphicsCommand {
    pub fn set_data(mut self, data: &[u8]) -> Self {
        self.payload = STANDARD.encode(data).into_bytes();
        self
    }

    pub fn set_filename(mut self, filename: &str) -> Self {
        self.payload = STANDARD.encode(filename.as_bytes()).into_bytes();
        self
    }

    /// Serialise into the escape-sequence frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 64);
        out.extend_from_slice(b"\x1b_G");
        let mut first = true;
        let mut push = |out: &mut Vec<u8>, key: &str, value: String| {
            if !first {
                out.push(b',');
            }
            first = false;
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
        };
        if let Some(id) = self.image_id {
            push(&mut out, "i", id.to_string());
        }
        if let Some(medium) = self.medium {
            push(&mut out, "t", medium.to_string());
        }
        if let Some(quiet) = self.quiet {
            push(&mut out, "q", quiet.to_string());
        }
        if let Some(more) = self.more {
            push(&mut out, "m", if more { "1" } else { "0" }.to_string());
        }
        if let Some(action) = self.action {
            push(&mut out, "a", action.to_string());
        }
        if self.unicode_placeholder {
            push(&mut out, "U", "1".to_string());
        }
        if let Some(format) = self.format {
            push(&mut out, "f", format.code().to_string());
        }
        if let Some(rows) = self.rows {
            push(&mut out, "r", rows.to_string());
        }
        if let Some(cols) = self.cols {
            push(&mut out, "c", cols.to_string());
        }
        out.push(b';');
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(b"\x1b\\");
        out
    }

    /// Split a direct transmission into chunked commands of at most
    /// `chunk_size` base64 bytes. The first command carries the full key
    /// list, continuations only the id; the final chunk has `m=0`.
    pub fn split(self, chunk_size: usize) -> Vec<GraphicsCommand> {
        let chunk_size = chunk_size.max(4);
        if self.payload.len() <= chunk_size {
            let mut only = self;
            if only.more.is_some() {
                only.more = Some(false);
            }
            return vec![only];
        }
        let payload = self.payload.clone();
        let mut chunks = payload.chunks(chunk_size);
        let mut head = self;
        head.payload = chunks.next().unwrap_or_default().to_vec();
        head.more = Some(true);
        let image_id = head.image_id;
        let mut result = vec![head];
        let rest: Vec<&[u8]> = chunks.collect();
        let last = rest.len().saturating_sub(1);
        for (idx, chunk) in rest.into_iter().enumerate() {
            result.push(GraphicsCommand {
                image_id,
                more: Some(idx != last),
                payload: chunk.to_vec(),
                ..Default::default()
            });
        }
        result
    }
}

/// The transmit command shared by every upload strategy.
pub fn transmit_command(id: u32, medium: char, format: Format, cols: u32, rows: u32) -> GraphicsCommand {
    GraphicsCommand {
        image_id: Some(id),
        medium: Some(medium),
        quiet: Some(2),
        action: Some('T'),
        unicode_placeholder: true,
        format: Some(format),
        rows: Some(rows),
        cols: Some(cols),
        ..Default::default()
    }
}

/// A final `m=0` bracket that aborts any transmission in flight for `id`,
/// preparing the terminal for a fresh direct upload.
pub fn abort_command(id: u32) -> GraphicsCommand {
    GraphicsCommand {
        image_id: Some(id),
        quiet: Some(2),
        more: Some(false),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order() {
        let cmd = transmit_command(42, 'f', Format::Png, 5, 2).set_filename("/tmp/x.png");
        let bytes = cmd.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("\x1b_Gi=42,t=f,q=2,a=T,U=1,f=100,r=2,c=5;"));
        assert!(text.ends_with("\x1b\\"));
        let payload = text
            .split(';')
            .nth(1)
            .unwrap()
            .trim_end_matches("\x1b\\")
            .to_string();
        assert_eq!(
            STANDARD.decode(payload).unwrap(),
            b"/tmp/x.png".to_vec()
        );
    }

    #[test]
    fn test_m_key_position() {
        let mut cmd = transmit_command(7, 'd', Format::Png, 3, 1);
        cmd.more = Some(true);
        let text = String::from_utf8(cmd.to_bytes()).unwrap();
        assert!(text.starts_with("\x1b_Gi=7,t=d,q=2,m=1,a=T,U=1,f=100,r=1,c=3;"));
    }

    #[test]
    fn test_split_chunks() {
        let data = vec![0u8; 100];
        let cmd = transmit_command(9, 'd', Format::Png, 3, 1).set_data(&data);
        let total_b64 = cmd.payload.len();
        let chunks = cmd.split(50);
        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].more, Some(true));
        assert_eq!(chunks[0].medium, Some('d'));
        for middle in &chunks[1..chunks.len() - 1] {
            assert_eq!(middle.more, Some(true));
            assert_eq!(middle.medium, None);
            assert_eq!(middle.image_id, Some(9));
        }
        assert_eq!(chunks.last().unwrap().more, Some(false));
        let reassembled: usize = chunks.iter().map(|c| c.payload.len()).sum();
        assert_eq!(reassembled, total_b64);
    }

    #[test]
    fn test_split_small_payload_is_single_final_command() {
        let cmd = transmit_command(9, 'd', Format::Png, 3, 1).set_data(b"xy");
        let mut cmd = cmd;
        cmd.more = Some(true);
        let chunks = cmd.split(4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].more, Some(false));
    }

    #[test]
    fn test_abort_command() {
        let text = String::from_utf8(abort_command(5).to_bytes()).unwrap();
        assert_eq!(text, "\x1b_Gi=5,q=2,m=0;\x1b\\");
    }
}
