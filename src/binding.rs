// com2tcp - Binding
// One serial port exposed on one TCP port, with at most one client at a time

use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cancel::CancelToken;
use crate::config::BindingSpec;
use crate::copy_loop::{CopyLoop, CopyOptions};
use crate::error::ProxyError;
use crate::logger::{LogSink, LOG_ERROR, LOG_INFO, LOG_NOTICE};
use crate::serial_stream::{DeviceOpener, SerialSettings, SerialStream};

/// Live state of one connected client.
struct Session {
    client: TcpStream,
    peer: String,
    serial_to_client: CopyLoop,
    client_to_serial: CopyLoop,
}

impl Session {
    /// Stops both loops and closes the client. Bytes still in flight toward
    /// the client are dropped. The serial device stays open.
    fn stop(mut self) {
        self.serial_to_client.stop();
        self.client_to_serial.stop();
        let _ = self.client.shutdown(Shutdown::Both);
        self.serial_to_client.join();
        self.client_to_serial.join();
    }
}

#[derive(Default)]
struct BindingState {
    serial: Option<SerialStream>,
    session: Option<Session>,
}

pub struct Binding {
    spec: BindingSpec,
    serial_settings: SerialSettings,
    chunk_size: usize,
    opener: Arc<dyn DeviceOpener>,
    logger: Arc<dyn LogSink>,
    state: Mutex<BindingState>,
}

impl Binding {
    pub fn new(
        spec: BindingSpec,
        serial_settings: SerialSettings,
        chunk_size: usize,
        opener: Arc<dyn DeviceOpener>,
        logger: Arc<dyn LogSink>,
    ) -> Self {
        Binding {
            spec,
            serial_settings,
            chunk_size,
            opener,
            logger,
            state: Mutex::new(BindingState::default()),
        }
    }

    /// `port@baud`, used to tag log and dump lines.
    pub fn id(&self) -> String {
        format!("{}@{}", self.spec.serial_port, self.spec.baud_rate)
    }

    pub fn spec(&self) -> &BindingSpec {
        &self.spec
    }

    fn state(&self) -> MutexGuard<'_, BindingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.state().session.is_some()
    }

    /// The currently open serial device, if any.
    #[cfg(test)]
    pub fn serial_stream(&self) -> Option<SerialStream> {
        self.state().serial.clone()
    }

    /// Takes over the binding for `client`, evicting any current client first.
    /// If the serial device cannot be opened the client is closed and the
    /// binding stays idle; the next client retries the open.
    pub fn handle_client(&self, client: TcpStream) -> Result<(), ProxyError> {
        let mut state = self.state();

        if let Some(session) = state.session.take() {
            self.stop_session(session);
        }

        let peer = peer_name(&client);
        self.logger.log(&format!("{}: New client {}", self.id(), peer), LOG_NOTICE);

        let serial = match self.ensure_serial(&mut state) {
            Ok(serial) => serial,
            Err(e) => {
                self.logger.log(
                    &format!("{}: Client {} disconnected due to inactive serial port.", self.id(), peer),
                    LOG_ERROR,
                );
                let _ = client.shutdown(Shutdown::Both);
                return Err(e);
            }
        };

        match self.start_session(client, peer.clone(), &serial) {
            Ok(session) => {
                state.session = Some(session);
                Ok(())
            }
            Err(e) => {
                self.logger.log(
                    &format!("{}: Unable to start session for client {}: {}", self.id(), peer, e),
                    LOG_ERROR,
                );
                Err(e.into())
            }
        }
    }

    /// Tears down the active session, if there is one.
    pub fn stop_client(&self) {
        let session = self.state().session.take();
        if let Some(session) = session {
            self.stop_session(session);
        }
    }

    /// Stops the active session and closes the serial device.
    pub fn close(&self) {
        self.stop_client();
        let serial = self.state().serial.take();
        if let Some(serial) = serial {
            serial.close();
            self.logger.log(&format!("{}: Closed", self.id()), LOG_NOTICE);
        }
    }

    fn stop_session(&self, session: Session) {
        self.logger.log(&format!("{}: Client {} disconnected.", self.id(), session.peer), LOG_NOTICE);
        session.stop();
    }

    /// Returns the open device, opening a fresh one when there is none or the
    /// previous instance failed.
    fn ensure_serial(&self, state: &mut BindingState) -> Result<SerialStream, ProxyError> {
        if let Some(serial) = state.serial.take() {
            if !serial.is_closed() {
                state.serial = Some(serial.clone());
                return Ok(serial);
            }
            self.logger.log(&format!("{}: Serial port failed, closing", serial.name()), LOG_ERROR);
            serial.close();
        }

        self.logger.log(&format!("{}: Opening ...", self.id()), LOG_INFO);
        match SerialStream::open(
            self.opener.as_ref(),
            &self.spec.serial_port,
            self.spec.baud_rate,
            &self.serial_settings,
        ) {
            Ok(serial) => {
                self.logger.log(&format!("{}: Open", self.id()), LOG_NOTICE);
                state.serial = Some(serial.clone());
                Ok(serial)
            }
            Err(e) => {
                self.logger.log(&format!("{}: Opening failed: {}", self.id(), e), LOG_ERROR);
                Err(e)
            }
        }
    }

    fn start_session(&self, client: TcpStream, peer: String, serial: &SerialStream) -> io::Result<Session> {
        let result = self.spawn_loops(&client, serial);
        match result {
            Ok((serial_to_client, client_to_serial)) => Ok(Session {
                client,
                peer,
                serial_to_client,
                client_to_serial,
            }),
            Err(e) => {
                let _ = client.shutdown(Shutdown::Both);
                Err(e)
            }
        }
    }

    fn spawn_loops(&self, client: &TcpStream, serial: &SerialStream) -> io::Result<(CopyLoop, CopyLoop)> {
        let cancel = CancelToken::new();
        let id = self.id();
        let options = |direction: &str| CopyOptions {
            chunk_size: self.chunk_size,
            dump_label: self.spec.dump.then(|| format!("{} {}", id, direction)),
        };

        let client_to_serial = {
            let interrupt = client.try_clone()?;
            CopyLoop::spawn(
                &format!("{} <<", id),
                client.try_clone()?,
                serial.writer(),
                options("<<"),
                cancel.clone(),
                Arc::clone(&self.logger),
            )?
            .with_interrupt(move || {
                let _ = interrupt.shutdown(Shutdown::Read);
            })
        };

        let serial_to_client = CopyLoop::spawn(
            &format!("{} >>", id),
            serial.reader(cancel.clone()),
            client.try_clone()?,
            options(">>"),
            cancel,
            Arc::clone(&self.logger),
        )?;

        Ok((serial_to_client, client_to_serial))
    }
}

fn peer_name(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemorySink;
    use crate::serial_stream::testing::FakeOpener;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn spec(dump: bool) -> BindingSpec {
        BindingSpec { tcp_port: 8000, serial_port: "COM3".to_string(), baud_rate: 9600, dump }
    }

    fn binding(opener: &Arc<FakeOpener>, sink: &Arc<MemorySink>, dump: bool) -> Binding {
        Binding::new(
            spec(dump),
            SerialSettings { poll_interval: Some(Duration::from_millis(1)) },
            1024,
            opener.clone(),
            sink.clone(),
        )
    }

    /// Returns (client side, server side) of a fresh loopback connection.
    fn connect(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        (client, server)
    }

    fn wait_until(what: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !what() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn read_exactly(client: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_relays_both_directions() {
        let opener = FakeOpener::new();
        let sink = MemorySink::new();
        let binding = binding(&opener, &sink, false);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let (mut client, server) = connect(&listener);
        binding.handle_client(server).unwrap();
        assert!(binding.is_active());

        client.write_all(b"ATZ\r").unwrap();
        wait_until(|| opener.device.written() == b"ATZ\r");

        opener.device.push_input(b"OK\r\n");
        assert_eq!(read_exactly(&mut client, 4), b"OK\r\n");
        assert!(sink.contains("COM3@9600: Open"));
        assert!(sink.contains("COM3@9600: New client"));
    }

    #[test]
    fn test_relay_preserves_order() {
        let opener = FakeOpener::new();
        let sink = MemorySink::new();
        let binding = binding(&opener, &sink, false);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut client, server) = connect(&listener);
        binding.handle_client(server).unwrap();

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        for chunk in payload.chunks(700) {
            opener.device.push_input(chunk);
        }
        assert_eq!(read_exactly(&mut client, payload.len()), payload);

        client.write_all(&payload).unwrap();
        wait_until(|| opener.device.written().len() == payload.len());
        assert_eq!(opener.device.written(), payload);
    }

    #[test]
    fn test_new_client_preempts_old() {
        let opener = FakeOpener::new();
        let sink = MemorySink::new();
        let binding = binding(&opener, &sink, false);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let (mut first, server) = connect(&listener);
        binding.handle_client(server).unwrap();
        let first_serial = binding.serial_stream().unwrap();

        let (mut second, server) = connect(&listener);
        binding.handle_client(server).unwrap();

        // the first client was closed
        let mut buf = [0u8; 8];
        assert_eq!(first.read(&mut buf).unwrap_or(0), 0);

        // same device handle, no reopen
        assert_eq!(opener.opens(), 1);
        assert!(binding.serial_stream().unwrap().same_device(&first_serial));

        opener.device.push_input(b"hello");
        assert_eq!(read_exactly(&mut second, 5), b"hello");
    }

    #[test]
    fn test_open_failure_then_retry() {
        let opener = FakeOpener::new();
        let sink = MemorySink::new();
        let binding = binding(&opener, &sink, false);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        opener.set_unavailable(true);
        let (mut client, server) = connect(&listener);
        assert!(matches!(binding.handle_client(server), Err(ProxyError::DeviceUnavailable { .. })));
        assert!(!binding.is_active());
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        assert!(sink.contains("disconnected due to inactive serial port"));

        opener.set_unavailable(false);
        let (_client, server) = connect(&listener);
        binding.handle_client(server).unwrap();
        assert!(binding.is_active());
        assert_eq!(opener.opens(), 1);
    }

    #[test]
    fn test_failed_device_is_reopened() {
        let opener = FakeOpener::new();
        let sink = MemorySink::new();
        let binding = binding(&opener, &sink, false);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let (_first, server) = connect(&listener);
        binding.handle_client(server).unwrap();
        let failed = binding.serial_stream().unwrap();
        opener.device.set_failing(true);
        wait_until(|| failed.is_closed());

        let (_second, server) = connect(&listener);
        binding.handle_client(server).unwrap();
        assert_eq!(opener.opens(), 2);
        assert!(!binding.serial_stream().unwrap().same_device(&failed));
    }

    #[test]
    fn test_stop_client_keeps_serial_open() {
        let opener = FakeOpener::new();
        let sink = MemorySink::new();
        let binding = binding(&opener, &sink, false);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let (mut client, server) = connect(&listener);
        binding.handle_client(server).unwrap();
        binding.stop_client();
        binding.stop_client();

        assert!(!binding.is_active());
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        assert!(!opener.device.is_closed());
        assert!(!binding.serial_stream().unwrap().is_closed());
    }

    #[test]
    fn test_stop_is_bounded_by_poll_interval() {
        let opener = FakeOpener::new();
        let sink = MemorySink::new();
        let binding = Binding::new(
            spec(false),
            SerialSettings { poll_interval: Some(Duration::from_millis(300)) },
            1024,
            opener.clone(),
            sink.clone(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (_client, server) = connect(&listener);
        binding.handle_client(server).unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        binding.stop_client();
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_close_releases_device() {
        let opener = FakeOpener::new();
        let sink = MemorySink::new();
        let binding = binding(&opener, &sink, false);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (_client, server) = connect(&listener);
        binding.handle_client(server).unwrap();

        binding.close();
        assert!(!binding.is_active());
        assert!(binding.serial_stream().is_none());
        assert!(opener.device.is_closed());
        assert!(sink.contains("COM3@9600: Closed"));
    }

    #[test]
    fn test_dump_labels() {
        let opener = FakeOpener::new();
        let sink = MemorySink::new();
        let binding = binding(&opener, &sink, true);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut client, server) = connect(&listener);
        binding.handle_client(server).unwrap();

        client.write_all(&[0x00, 0x0a, 0xff]).unwrap();
        wait_until(|| sink.contains("COM3@9600 << 00 0a ff"));

        opener.device.push_input(&[0x41]);
        read_exactly(&mut client, 1);
        wait_until(|| sink.contains("COM3@9600 >> 41"));
    }
}
