//! Runtime Dump Writer
//!
//! Writes raw encoder input surfaces and encoded output packets to disk.
//! Each pipeline owns a bounded queue and a dedicated worker thread that only
//! exists while dumping is active, so the producer-side cost of a disabled
//! pipeline is a single atomic load.

mod error;
mod writer;

pub use error::DumpError;
pub use writer::{RuntimeDumpWriter, DEFAULT_QUEUE_DEPTH};

/// Which dump pipeline(s) an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DumpMode {
    /// Raw RGBA surfaces fed to the encoder
    Input,
    /// Encoded bitstream packets
    Output,
    /// Both pipelines
    Both,
}

impl DumpMode {
    pub(crate) fn includes_input(self) -> bool {
        matches!(self, DumpMode::Input | DumpMode::Both)
    }

    pub(crate) fn includes_output(self) -> bool {
        matches!(self, DumpMode::Output | DumpMode::Both)
    }
}

/// One unit of dump data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpRecord {
    /// Raw bytes appended to the dump file
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Whether the packet starts an independently decodable sequence
    pub key_frame: bool,
}

impl DumpRecord {
    /// Raw input surface
    pub fn surface(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            key_frame: true,
        }
    }

    /// Encoded output packet
    pub fn packet(data: Vec<u8>, key_frame: bool) -> Self {
        Self {
            data,
            width: 0,
            height: 0,
            key_frame,
        }
    }
}

/// Snapshot of which pipelines are currently writing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStatus {
    pub input: bool,
    pub output: bool,
}
