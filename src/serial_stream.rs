// com2tcp - Serial Stream Adapter
// Blocking duplex byte stream over a serial device that can only be polled
//
// The driver only offers "give me whatever is buffered" reads and a buffered
// byte count, so blocking reads are emulated here: probe, and if nothing came
// back sleep for roughly one byte time at the configured baud rate. Every call
// into the driver goes through one owner thread per device, fed by a command
// channel, so the raw handle is never touched from two threads at once.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serialport::SerialPort;

use crate::cancel::CancelToken;
use crate::error::ProxyError;

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const MIN_POLL_NANOS: u64 = 100;

/// Raw serial driver operations. None of them may block waiting for data.
pub trait SerialDevice: Send {
    /// Number of input bytes currently buffered by the driver.
    fn bytes_available(&mut self) -> io::Result<usize>;
    /// Returns every buffered input byte, or an empty vector if there are none.
    fn read_available(&mut self) -> io::Result<Vec<u8>>;
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

/// Opens and configures (8 data bits, 1 stop bit, no parity) a serial device.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialDevice>>;
}

/// Opens real ports through the `serialport` crate.
pub struct SystemSerial;

impl DeviceOpener for SystemSerial {
    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialDevice>> {
        let port = serialport::new(port, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()?;
        Ok(Box::new(SystemPort { port: Some(port) }))
    }
}

struct SystemPort {
    port: Option<Box<dyn SerialPort>>,
}

impl SystemPort {
    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }
}

impl SerialDevice for SystemPort {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port()?.bytes_to_read()? as usize)
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let port = self.port()?;
        let pending = port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![0u8; pending];
        match port.read(&mut buffer) {
            Ok(n) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        write_fully(self.port()?, data)
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the handle releases the OS device.
        self.port.take();
        Ok(())
    }
}

/// Writes all of `data`. A full transmit buffer surfaces as `TimedOut`,
/// which only means "try again"; any other error is a real failure.
fn write_fully<W: Write + ?Sized>(port: &mut W, data: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match port.write(&data[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "serial port accepted no data")),
            Ok(n) => written += n,
            Err(ref e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
            Err(e) => return Err(e),
        }
    }
    loop {
        match port.flush() {
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
            result => return result,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SerialSettings {
    /// Sleep between empty probes. `None` derives it from the baud rate.
    pub poll_interval: Option<Duration>,
}

impl SerialSettings {
    /// Effective sleep between empty probes, never below 100ns.
    pub fn poll_interval_at(&self, baud_rate: u32) -> Duration {
        match self.poll_interval {
            Some(interval) => interval.max(Duration::from_nanos(MIN_POLL_NANOS)),
            None => poll_interval_for(baud_rate),
        }
    }
}

/// Time to transmit one byte (8 bits) at `baud_rate`, never below 100ns.
pub fn poll_interval_for(baud_rate: u32) -> Duration {
    let per_bit = NANOS_PER_SECOND / u64::from(baud_rate.max(1));
    Duration::from_nanos((per_bit * 8).max(MIN_POLL_NANOS))
}

enum Command {
    Probe(Sender<io::Result<usize>>),
    Read(Sender<io::Result<Vec<u8>>>),
    Write(Vec<u8>, Sender<io::Result<()>>),
    Close(Sender<()>),
}

/// Owner loop of one device. Exits on `Close` or once every sender is gone.
fn run_device(mut device: Box<dyn SerialDevice>, commands: Receiver<Command>) {
    for command in commands {
        match command {
            Command::Probe(reply) => {
                let _ = reply.send(device.bytes_available());
            }
            Command::Read(reply) => {
                let _ = reply.send(device.read_available());
            }
            Command::Write(data, reply) => {
                let _ = reply.send(device.write_bytes(&data));
            }
            Command::Close(reply) => {
                let _ = device.close();
                let _ = reply.send(());
                return;
            }
        }
    }
    let _ = device.close();
}

#[derive(Default)]
struct InputBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl InputBuffer {
    fn is_empty(&self) -> bool {
        self.cursor >= self.bytes.len()
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    fn fill(&mut self, data: Vec<u8>) {
        self.bytes = data;
        self.cursor = 0;
    }

    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = self.remaining().min(buf.len());
        buf[..n].copy_from_slice(&self.bytes[self.cursor..self.cursor + n]);
        self.cursor += n;
        if self.is_empty() {
            self.bytes.clear();
            self.cursor = 0;
        }
        n
    }
}

struct Shared {
    name: String,
    commands: Sender<Command>,
    poll_interval: Duration,
    close_requested: AtomicBool,
    closed: AtomicBool,
    input: Mutex<InputBuffer>,
}

impl Shared {
    fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
    }

    fn closed_error(&self) -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, format!("serial port {} is closed", self.name))
    }

    /// Sends one command to the owner thread and waits for its answer.
    /// Any failure latches the close request.
    fn request<T>(&self, command: impl FnOnce(Sender<io::Result<T>>) -> Command) -> io::Result<T> {
        if self.is_close_requested() {
            return Err(self.closed_error());
        }
        let (reply, response) = mpsc::channel();
        let result = self
            .commands
            .send(command(reply))
            .map_err(|_| self.closed_error())
            .and_then(|_| response.recv().map_err(|_| self.closed_error()))
            .and_then(|r| r);
        if result.is_err() {
            self.request_close();
        }
        result
    }

    fn input(&self) -> MutexGuard<'_, InputBuffer> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An open serial device. Clones share the same device.
#[derive(Clone)]
pub struct SerialStream {
    shared: Arc<Shared>,
}

impl SerialStream {
    pub fn open(
        opener: &dyn DeviceOpener,
        port: &str,
        baud_rate: u32,
        settings: &SerialSettings,
    ) -> Result<Self, ProxyError> {
        let unavailable = |source: io::Error| ProxyError::DeviceUnavailable {
            port: port.to_string(),
            baud_rate,
            source,
        };
        let device = opener.open(port, baud_rate).map_err(unavailable)?;

        let (commands, receiver) = mpsc::channel();
        thread::Builder::new()
            .name(format!("serial {}", port))
            .spawn(move || run_device(device, receiver))
            .map_err(unavailable)?;

        Ok(SerialStream {
            shared: Arc::new(Shared {
                name: format!("{}@{}", port, baud_rate),
                commands,
                poll_interval: settings.poll_interval_at(baud_rate),
                close_requested: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                input: Mutex::new(InputBuffer::default()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Read side. Blocking reads give up as soon as `cancel` fires.
    pub fn reader(&self, cancel: CancelToken) -> SerialReader {
        SerialReader { shared: Arc::clone(&self.shared), cancel }
    }

    pub fn writer(&self) -> SerialWriter {
        SerialWriter { shared: Arc::clone(&self.shared) }
    }

    /// True once the device failed or a close was requested. Never reverts.
    pub fn is_closed(&self) -> bool {
        self.shared.is_close_requested()
    }

    #[cfg(test)]
    pub fn same_device(&self, other: &SerialStream) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Releases the device. Idempotent, errors from the driver are ignored.
    pub fn close(&self) {
        self.shared.request_close();
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reply, done) = mpsc::channel();
        if self.shared.commands.send(Command::Close(reply)).is_ok() {
            let _ = done.recv();
        }
    }
}

pub struct SerialReader {
    shared: Arc<Shared>,
    cancel: CancelToken,
}

impl SerialReader {
    fn cancelled() -> io::Error {
        io::Error::new(io::ErrorKind::Interrupted, "serial read cancelled")
    }

    /// Polls the device until the input buffer holds data.
    /// Returns false when the device is closed (end of stream).
    fn wait_for_data(&self, input: &mut InputBuffer) -> io::Result<bool> {
        while input.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(Self::cancelled());
            }
            if self.shared.is_close_requested() {
                return Ok(false);
            }
            match self.shared.request(Command::Read) {
                Ok(data) if !data.is_empty() => input.fill(data),
                Ok(_) => {
                    if self.cancel.wait_timeout(self.shared.poll_interval) {
                        return Err(Self::cancelled());
                    }
                }
                Err(_) => return Ok(false),
            }
        }
        Ok(!self.shared.is_close_requested())
    }

    /// Reads a single byte, `None` at end of stream.
    #[allow(dead_code)]
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Bytes readable without blocking.
    #[allow(dead_code)]
    pub fn available(&self) -> usize {
        let input = self.shared.input();
        if self.shared.is_close_requested() {
            return 0;
        }
        if !input.is_empty() {
            return input.remaining();
        }
        self.shared.request(Command::Probe).unwrap_or(0)
    }

    #[allow(dead_code)]
    pub fn close(&self) {
        self.shared.request_close();
    }
}

impl Read for SerialReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut input = self.shared.input();
        if !self.wait_for_data(&mut input)? {
            return Ok(0);
        }
        Ok(input.drain_into(buf))
    }
}

pub struct SerialWriter {
    shared: Arc<Shared>,
}

#[allow(dead_code)]
impl SerialWriter {
    pub fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte])
    }

    pub fn close(&self) {
        self.shared.request_close();
    }
}

impl Write for SerialWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let data = buf.to_vec();
        self.shared
            .request(|reply| Command::Write(data, reply))
            .map_err(|e| {
                io::Error::new(e.kind(), format!("failed to write to serial port {}: {}", self.shared.name, e))
            })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
