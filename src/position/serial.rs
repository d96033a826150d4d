use std::{
    io::{self, BufRead, BufReader},
    time::Duration,
};

const MAX_LINE_BYTES: usize = 256;

/// Line-oriented view of a position device.
pub trait SentenceSource: Send {
    /// Next complete line, `Ok(None)` when the read timed out without one.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// Opens candidate ports. Swapped out in tests.
pub trait PortOpener: Send + Sync {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> io::Result<Box<dyn SentenceSource>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl PortOpener for SerialPortOpener {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> io::Result<Box<dyn SentenceSource>> {
        let serial = serialport::new(port, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(LineReader::new(serial)))
    }
}

/// Accumulates bytes across timeouts until a newline completes a line.
pub struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: io::Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::with_capacity(MAX_LINE_BYTES),
        }
    }
}

impl<R: io::Read + Send> SentenceSource for LineReader<R> {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "position device closed",
                    ))
                }
                Ok(_) => {
                    if self.pending.last() != Some(&b'\n') {
                        // EOF mid-line; the next call reports it.
                        continue;
                    }
                    let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                    self.pending.clear();
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(line));
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    // Line noise without newlines must not grow the buffer forever.
                    if self.pending.len() > MAX_LINE_BYTES {
                        self.pending.clear();
                    }
                    return Ok(None);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}
