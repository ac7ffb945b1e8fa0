//! `serialport` backed gateway link.
//!
//! The port is opened once; a cloned handle is moved into a blocking reader
//! thread that feeds a [`LineFramer`] and forwards complete lines over a tokio
//! channel. Writes happen on the caller's thread (the role loop) through
//! [`write_framed`], which paces long payloads.
use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::line::{write_framed, LineFramer, LinePacing};
use super::SerialLink;
use crate::errors::{QuakeError, QuakeResult};
use crate::logutil::escape_log;

/// Serial link writer half.
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
    pacing: LinePacing,
}

impl SerialLink for SerialPortLink {
    fn send_line(&mut self, line: &str) -> QuakeResult<()> {
        write_framed(&mut self.port, line, &self.pacing).map_err(QuakeError::Io)
    }
}

/// Open `port_name`, start the reader thread and return the writer plus the
/// stream of inbound lines.
pub async fn open_serial_link(
    port_name: &str,
    baud_rate: u32,
    pacing: LinePacing,
) -> Result<(SerialPortLink, mpsc::UnboundedReceiver<String>)> {
    info!("Opening serial link {} at {} baud", port_name, baud_rate);

    let mut builder = serialport::new(port_name, baud_rate).timeout(Duration::from_millis(50));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder
        .open()
        .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;

    // Small settle delay
    sleep(Duration::from_millis(150)).await;

    // Clear any existing buffered boot text
    let mut purge_buf = [0u8; 512];
    if let Ok(available) = port.bytes_to_read() {
        if available > 0 {
            let _ = port.read(&mut purge_buf);
        }
    }

    let reader = port
        .try_clone()
        .map_err(|e| anyhow!("Failed to clone serial port {}: {}", port_name, e))?;
    let (tx, rx) = mpsc::unbounded_channel();
    let name = port_name.to_string();
    std::thread::Builder::new()
        .name("serial-reader".into())
        .spawn(move || reader_loop(reader, tx, name))?;

    debug!("Serial link {} ready", port_name);
    Ok((SerialPortLink { port, pacing }, rx))
}

fn reader_loop(mut port: Box<dyn SerialPort>, tx: mpsc::UnboundedSender<String>, name: String) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; 1024];
    loop {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                framer.push(&buf[..n]);
                for line in framer.drain_lines() {
                    if tx.send(line).is_err() {
                        debug!("serial reader for {} stopping: receiver dropped", name);
                        return;
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!(
                    "serial read error on {}: {}",
                    name,
                    escape_log(&e.to_string())
                );
                std::thread::sleep(Duration::from_millis(250));
            }
        }
    }
}
