//! RF control link to the fixture's auxiliary controller.
//!
//! Outbound packets are variable length:
//!
//! ```text
//! | 2D D4 | len 00 00 | crc(header) | payload ... | crc(all preceding) |
//! ```
//!
//! Inbound frames are always [`INBOUND_FRAME_LEN`] bytes with a 2-byte payload.
//! The two directions are encoded and decoded separately because the fixture
//! firmware only ever answers with the short form.

use crate::crc8;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

pub const SYNC_MARKER: [u8; 2] = [0x2D, 0xD4];
pub const HEADER_LEN: usize = 3;
pub const INBOUND_FRAME_LEN: usize = 9;
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Added to the pin id to turn a pin command into a blink command.
pub const BLINK_OPCODE_OFFSET: u8 = 0x07;

pub const FIXTURE_VENDOR: &str = "Silicon Labs";
pub const BAUD_RATE: u32 = 9600;

/// Auxiliary lines on the fixture, by their id in the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pin {
    RedLed = 1,
    GreenLed = 2,
    ProgrammingMode = 3,
    RadioPower = 4,
}

impl Pin {
    pub const ALL: [Pin; 4] = [Pin::RedLed, Pin::GreenLed, Pin::ProgrammingMode, Pin::RadioPower];

    pub fn id(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum RfError {
    #[error("no serial device from vendor '{0}' found")]
    NotFound(String),
    #[error("could not open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("port enumeration failed: {0}")]
    Enumerate(#[from] serialport::Error),
    #[error("transport is not open")]
    NotOpen,
    #[error("payload of {0} bytes does not fit the length field")]
    PayloadTooLong(usize),
    #[error("serial I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Signals the fixture reports on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Operator pressed the start button on the fixture.
    StartWork,
    /// A new board was inserted.
    NewDevice,
    Unknown([u8; 2]),
}

impl Signal {
    pub fn decode(payload: [u8; 2]) -> Signal {
        match payload {
            [0x06, 0xD3] => Signal::StartWork,
            [0x07, 0x05] => Signal::NewDevice,
            other => Signal::Unknown(other),
        }
    }
}

// --- Outbound encoding ---

/// Builds a complete control packet around `payload`.
pub fn encode_packet(payload: &[u8]) -> Result<Vec<u8>, RfError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(RfError::PayloadTooLong(payload.len()));
    }
    let header = [payload.len() as u8, 0x00, 0x00];

    let mut packet = Vec::with_capacity(SYNC_MARKER.len() + HEADER_LEN + 2 + payload.len());
    packet.extend_from_slice(&SYNC_MARKER);
    packet.extend_from_slice(&header);
    packet.push(crc8::checksum(&header));
    packet.extend_from_slice(payload);
    packet.push(crc8::checksum(&packet));
    Ok(packet)
}

pub fn pin_payload(pin: Pin, on: bool) -> [u8; 2] {
    [pin.id(), on as u8]
}

pub fn blink_payload(pin: Pin, period_ms: u32) -> [u8; 5] {
    let period = period_ms.to_le_bytes();
    [pin.id() + BLINK_OPCODE_OFFSET, period[0], period[1], period[2], period[3]]
}

// --- Inbound decoding ---

/// Reassembles fixed-size inbound frames from an arbitrary byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pub frames: u64,
    pub crc_errors: u64,
    pub skipped: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INBOUND_FRAME_LEN * 4),
            ..Default::default()
        }
    }

    /// Appends `chunk` and hands every valid payload to `on_payload`.
    ///
    /// A buffer head that is not the sync marker is dropped one byte at a time.
    /// A frame with a bad trailing CRC is dropped whole and never delivered.
    pub fn feed(&mut self, chunk: &[u8], on_payload: &mut dyn FnMut([u8; 2])) {
        self.buf.extend_from_slice(chunk);

        while self.buf.len() >= INBOUND_FRAME_LEN {
            if self.buf[..2] != SYNC_MARKER {
                self.buf.remove(0);
                self.skipped += 1;
                continue;
            }

            let frame: Vec<u8> = self.buf.drain(..INBOUND_FRAME_LEN).collect();
            if crc8::verify(&frame) {
                self.frames += 1;
                log::debug!("rf frame {:02X?}", frame);
                on_payload([frame[6], frame[7]]);
            } else {
                self.crc_errors += 1;
                log::warn!("rf frame with invalid CRC discarded: {:02X?}", frame);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Reads frames from `reader` until `stop` is raised or the reader fails.
pub fn listen_loop<R: Read>(mut reader: R, stop: &AtomicBool, on_signal: &mut dyn FnMut(Signal)) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; INBOUND_FRAME_LEN];

    log::info!("rf listener started");
    while !stop.load(Ordering::Relaxed) {
        match reader.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => decoder.feed(&chunk[..n], &mut |payload| on_signal(Signal::decode(payload))),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::error!("rf listener read failed: {}", e);
                break;
            }
        }
    }
    log::info!(
        "rf listener stopped ({} frames, {} crc errors, {} bytes skipped)",
        decoder.frames,
        decoder.crc_errors,
        decoder.skipped
    );
}

// --- Transport ---

/// Write half of the fixture connection.
pub trait Transport: Write + Send {
    /// Discards pending input and output before the port is released.
    fn drain(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn drain(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::All)
            .map_err(io::Error::from)?;
        self.flush()
    }
}

#[derive(Debug, Clone)]
pub struct RfSettings {
    pub vendor: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for RfSettings {
    fn default() -> Self {
        Self {
            vendor: FIXTURE_VENDOR.to_string(),
            baud_rate: BAUD_RATE,
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Returns the name of the serial device whose USB manufacturer is `vendor`.
pub fn discover_transport(vendor: &str) -> Result<String, RfError> {
    serialport::available_ports()?
        .into_iter()
        .find(|p| match &p.port_type {
            serialport::SerialPortType::UsbPort(info) => info.manufacturer.as_deref() == Some(vendor),
            _ => false,
        })
        .map(|p| p.port_name)
        .ok_or_else(|| RfError::NotFound(vendor.to_string()))
}

/// Exclusive owner of the fixture's serial transport.
///
/// Writes go through one mutex so a packet is always written whole; the
/// listener thread reads from its own clone of the port.
pub struct RfLink {
    settings: RfSettings,
    writer: Mutex<Option<Box<dyn Transport>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    stop: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RfLink {
    pub fn new(settings: RfSettings) -> Self {
        Self {
            settings,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
        }
    }

    /// Builds a link over an already open transport.
    pub fn with_transport(writer: Box<dyn Transport>, reader: Option<Box<dyn Read + Send>>) -> Self {
        let link = Self::new(RfSettings::default());
        *lock(&link.writer) = Some(writer);
        *lock(&link.reader) = reader;
        link
    }

    pub fn is_open(&self) -> bool {
        lock(&self.writer).is_some()
    }

    /// Discovers and opens the fixture port. Opening twice is a no-op.
    pub fn open(&self) -> Result<(), RfError> {
        let mut writer = lock(&self.writer);
        if writer.is_some() {
            log::debug!("fixture already connected");
            return Ok(());
        }

        let port_name = discover_transport(&self.settings.vendor)?;
        let port = serialport::new(&port_name, self.settings.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(self.settings.read_timeout)
            .open()
            .map_err(|source| RfError::Open {
                port: port_name.clone(),
                source,
            })?;
        let read_half = port.try_clone().map_err(|source| RfError::Open {
            port: port_name.clone(),
            source,
        })?;

        log::info!("opened fixture port {}", port_name);
        *lock(&self.reader) = Some(Box::new(read_half));
        *writer = Some(Box::new(port));
        self.stop.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Drains both buffers and releases the port.
    pub fn close(&self) -> Result<(), RfError> {
        let mut writer = lock(&self.writer);
        match writer.take() {
            Some(mut port) => {
                port.drain()?;
                lock(&self.reader).take();
                log::info!("fixture port closed");
                Ok(())
            }
            None => Err(RfError::NotOpen),
        }
    }

    pub fn send_packet(&self, payload: &[u8]) -> Result<(), RfError> {
        let packet = encode_packet(payload)?;
        let mut writer = lock(&self.writer);
        let port = writer.as_mut().ok_or(RfError::NotOpen)?;
        port.write_all(&packet)?;
        port.flush()?;
        log::debug!("rf sent {:02X?}", packet);
        Ok(())
    }

    pub fn set_pin(&self, pin: Pin, on: bool) -> Result<(), RfError> {
        self.send_packet(&pin_payload(pin, on))
    }

    pub fn set_blinking(&self, pin: Pin, period_ms: u32) -> Result<(), RfError> {
        self.send_packet(&blink_payload(pin, period_ms))
    }

    /// Drives the inverse of `on`, holds it for `delay`, then restores `on`.
    pub fn pulse_pin(&self, pin: Pin, on: bool, delay: Duration) -> Result<(), RfError> {
        self.set_pin(pin, !on)?;
        thread::sleep(delay);
        self.set_pin(pin, on)
    }

    /// Starts the background listener. Every decoded signal is passed to `on_signal`.
    pub fn listen<F>(&self, mut on_signal: F) -> Result<(), RfError>
    where
        F: FnMut(Signal) + Send + 'static,
    {
        let mut listener = lock(&self.listener);
        if listener.is_some() {
            return Ok(());
        }
        let reader = lock(&self.reader).take().ok_or(RfError::NotOpen)?;
        let stop = Arc::clone(&self.stop);
        stop.store(false, Ordering::Relaxed);

        *listener = Some(thread::spawn(move || {
            listen_loop(reader, &stop, &mut on_signal);
        }));
        Ok(())
    }

    /// Turns every pin off, stops the listener and closes the port.
    ///
    /// Safe to call repeatedly and when the link never connected.
    pub fn shutdown(&self) -> Result<(), RfError> {
        if self.is_open() {
            for pin in Pin::ALL {
                if let Err(e) = self.set_pin(pin, false) {
                    log::warn!("could not turn {:?} off: {}", pin, e);
                }
            }
        }

        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = lock(&self.listener).take() {
            if handle.join().is_err() {
                log::error!("rf listener thread panicked");
            }
        }

        match self.close() {
            Ok(()) | Err(RfError::NotOpen) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for RfLink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
