pub mod command;
pub mod identity;
pub mod placeholder;
pub mod transport;
pub mod writer;

pub use command::{Format, GraphicsCommand};
pub use identity::TerminalIdentity;
pub use placeholder::{PlaceholderOptions, RestoreCursor};
pub use transport::{Transport, UploadParams};
pub use writer::TerminalWriter;
