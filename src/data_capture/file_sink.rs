use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error_handling::types::PersistenceError;

use super::sink::Sink;

/// Appends every packet verbatim to a byte stream.
///
/// Packets arrive in packet-index order, so the output is the device stream itself:
/// raw interleaved little-endian words, no header, exactly `total_bytes` long once
/// the capture is complete.
pub struct SequentialFileSink<W: Write + Send = BufWriter<File>> {
    writer: W,
    path: Option<PathBuf>,
    bytes_written: u64,
    packets_written: u64,
    next_index: u64,
}

impl SequentialFileSink {
    /// Creates (or truncates) the capture file.
    pub fn create(path: &Path) -> Result<Self, PersistenceError> {
        let file = File::create(path).map_err(|e| PersistenceError::CreateFailed(path.to_path_buf(), e))?;
        debug!("Capture file {} created", path.display());
        let mut sink = Self::from_writer(BufWriter::new(file));
        sink.path = Some(path.to_path_buf());
        Ok(sink)
    }
}

impl<W: Write + Send> SequentialFileSink<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer,
            path: None,
            bytes_written: 0,
            packets_written: 0,
            next_index: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for SequentialFileSink<W> {
    fn write(
        &mut self,
        packet: &[u8],
        packet_index: u64,
        total_packets: u64,
    ) -> Result<(), PersistenceError> {
        if packet_index != self.next_index {
            warn!(
                "File sink expected packet {} but got {}",
                self.next_index, packet_index
            );
        }
        self.writer
            .write_all(packet)
            .map_err(PersistenceError::WriteFailed)?;
        self.bytes_written += packet.len() as u64;
        self.packets_written += 1;
        self.next_index = packet_index + 1;
        if self.next_index == total_packets {
            debug!(
                "File sink received final packet, {} bytes written",
                self.bytes_written
            );
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PersistenceError> {
        self.writer.flush().map_err(PersistenceError::FlushFailed)
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}
