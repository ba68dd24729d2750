//! Byte sources feeding the frame reassembler.
use anyhow::Result;
use std::io::{self, Read};

/// Anything the reader worker can pull raw chunks from.
///
/// `Ok(0)` means the source is exhausted. An error of kind `TimedOut` or
/// `WouldBlock` means no data yet and the worker keeps polling.
pub trait ByteSource: Send {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<R: Read + Send> ByteSource for R {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Whether an I/O error only signals an idle line.
pub fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Open a serial port at 8N1.
#[cfg(feature = "serial")]
pub fn open_serial(
    port_name: &str,
    baud_rate: u32,
    timeout_ms: u64,
) -> Result<Box<dyn ByteSource>> {
    use anyhow::anyhow;
    use log::debug;
    use std::time::Duration;

    debug!("Opening serial port {} at {} baud", port_name, baud_rate);
    let port = serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(timeout_ms))
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
pub fn open_serial(
    port_name: &str,
    _baud_rate: u32,
    _timeout_ms: u64,
) -> Result<Box<dyn ByteSource>> {
    anyhow::bail!(
        "Cannot open {}: built without the 'serial' feature",
        port_name
    )
}

/// Source that hands out pre-recorded chunks one `read_chunk` call at a time.
/// Useful for replaying captures and for tests.
#[derive(Debug, Default)]
pub struct ChunkedSource {
    chunks: std::collections::VecDeque<Vec<u8>>,
}

impl ChunkedSource {
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }
}

impl Read for ChunkedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(0);
        };
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            self.chunks.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        if chunk.is_empty() {
            // an empty chunk stands for an idle read, not end of stream
            return Err(io::Error::new(io::ErrorKind::TimedOut, "idle"));
        }
        Ok(chunk.len())
    }
}
