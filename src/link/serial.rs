//! Serial transport for the curve tracer
//!
//! Wraps the `serialport` crate. Opening the port resets the instrument,
//! which then prints a short boot banner before streaming telemetry; the
//! open sequence waits out that banner under a long timeout and then drops
//! the timeout so steady-state polls return quickly.

use crate::config::{LinkConfig, BOOT_BANNER_LINES};
use crate::error::{IvBenchError, Result, ResultExt};
use crate::link::{lock_timed, DetectedPort, InstrumentLink, LineAssembler, LinkStats};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Bytes read per pass while draining the port
const READ_CHUNK: usize = 256;

/// Serial link to the curve tracer
///
/// The port handle sits behind a timed guard, so a caller that cannot get
/// exclusive access within the configured wait receives
/// [`IvBenchError::LinkBusy`] instead of blocking indefinitely.
pub struct SerialLink {
    /// Link configuration
    config: LinkConfig,
    /// Port handle, present while the link is open
    port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
    /// Assembles the byte stream into telemetry lines
    assembler: LineAssembler,
    /// Link statistics
    stats: LinkStats,
}

impl SerialLink {
    /// Create a closed link with the given configuration
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            port: Arc::new(Mutex::new(None)),
            assembler: LineAssembler::new(),
            stats: LinkStats::default(),
        }
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lock_timeout_ms)
    }
}

impl InstrumentLink for SerialLink {
    fn open(&mut self, port: Option<&str>) -> Result<()> {
        if let Some(name) = port {
            self.config.port = Some(name.to_string());
        }
        let name = self
            .config
            .port
            .clone()
            .ok_or_else(|| IvBenchError::Config("no serial port configured".to_string()))?;

        let mut port = serialport::new(&name, self.config.baud_rate)
            .timeout(Duration::from_millis(self.config.open_timeout_ms))
            .open()
            .map_err(|source| IvBenchError::Connect {
                port: name.clone(),
                source,
            })?;

        discard_boot_banner(&mut port, BOOT_BANNER_LINES)
            .with_context(|| format!("Reading boot banner from {}", name))?;

        port.set_timeout(Duration::from_millis(self.config.read_timeout_ms))?;
        // The banner read can leave a partial frame buffered by the driver.
        port.clear(ClearBuffer::All)?;

        let mut guard = lock_timed(&self.port, self.lock_timeout())?;
        *guard = Some(port);
        drop(guard);

        self.assembler.clear();
        tracing::info!(port = %name, baud = self.config.baud_rate, "Serial link opened");
        Ok(())
    }

    fn close(&mut self) {
        match lock_timed(&self.port, self.lock_timeout()) {
            Ok(mut guard) => {
                if guard.take().is_some() {
                    tracing::info!("Serial link closed");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Could not lock the port to close it");
            }
        }
        self.assembler.clear();
    }

    fn is_open(&self) -> bool {
        lock_timed(&self.port, self.lock_timeout())
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn port_name(&self) -> Option<&str> {
        self.config.port.as_deref()
    }

    fn poll_lines(&mut self) -> Result<Vec<String>> {
        let mut guard = lock_timed(&self.port, self.lock_timeout())?;
        let port = guard.as_mut().ok_or(IvBenchError::LinkClosed)?;

        let mut lines = Vec::new();
        let mut buf = [0u8; READ_CHUNK];

        // The first read waits up to the port timeout; bytes already
        // buffered after it are drained without waiting again.
        loop {
            match port.read(&mut buf) {
                Ok(n) if n > 0 => {
                    self.stats.record_read(n as u64);
                    self.assembler.push_bytes(&buf[..n], &mut lines);
                    match port.bytes_to_read() {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                Ok(_) => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        let now = Instant::now();
        for _ in &lines {
            self.stats.record_line(now);
        }
        Ok(lines)
    }

    fn write_command(&mut self, bytes: &[u8]) -> Result<()> {
        let mut guard = lock_timed(&self.port, self.lock_timeout())?;
        let port = guard.as_mut().ok_or(IvBenchError::LinkClosed)?;

        match port.write_all(bytes).and_then(|_| port.flush()) {
            Ok(()) => {
                self.stats.record_write_success();
                Ok(())
            }
            Err(e) => {
                self.stats.record_write_failure();
                Err(e.into())
            }
        }
    }

    fn stats(&self) -> &LinkStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut LinkStats {
        &mut self.stats
    }
}

/// Read and drop the instrument's boot banner
///
/// Consumes bytes one at a time until `lines` newline terminators have
/// passed, leaving everything after the banner unread.
fn discard_boot_banner(reader: &mut dyn Read, lines: usize) -> Result<()> {
    let mut byte = [0u8; 1];
    let mut seen = 0;
    while seen < lines {
        reader.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            seen += 1;
        }
    }
    Ok(())
}

/// List serial ports visible to the OS
pub fn list_ports() -> Result<Vec<DetectedPort>> {
    let ports = serialport::available_ports()?;

    Ok(ports
        .into_iter()
        // On macOS, keep only the /dev/cu.* (calling unit) device nodes
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| match p.port_type {
            SerialPortType::UsbPort(info) => DetectedPort::Usb {
                name: p.port_name,
                vendor_id: info.vid,
                product_id: info.pid,
                product: info.product,
                serial_number: info.serial_number,
            },
            SerialPortType::BluetoothPort => DetectedPort::Other {
                name: p.port_name,
                kind: "Bluetooth".to_string(),
            },
            SerialPortType::PciPort => DetectedPort::Other {
                name: p.port_name,
                kind: "PCI".to_string(),
            },
            SerialPortType::Unknown => DetectedPort::Other {
                name: p.port_name,
                kind: "Unknown".to_string(),
            },
        })
        .collect())
}
