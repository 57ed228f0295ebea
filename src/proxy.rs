// com2tcp - Proxy
// Registry of bindings keyed by TCP port, with one listener thread per binding

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::binding::Binding;
use crate::config::{BindingSpec, Config};
use crate::copy_loop::DEFAULT_CHUNK_SIZE;
use crate::error::ProxyError;
use crate::logger::{LogSink, LOG_ERROR, LOG_NOTICE, LOG_WARN};
use crate::serial_stream::{DeviceOpener, SerialSettings};

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub bind_address: String,
    pub serial: SerialSettings,
    pub chunk_size: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            bind_address: "0.0.0.0".to_string(),
            serial: SerialSettings::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&Config> for ProxySettings {
    fn from(config: &Config) -> Self {
        ProxySettings {
            bind_address: config.bind_address.clone(),
            serial: SerialSettings { poll_interval: config.poll_interval },
            chunk_size: config.chunk_size,
        }
    }
}

pub struct Proxy {
    settings: ProxySettings,
    opener: Arc<dyn DeviceOpener>,
    logger: Arc<dyn LogSink>,
    bindings: BTreeMap<u16, Arc<Binding>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Proxy {
    pub fn new(settings: ProxySettings, opener: Arc<dyn DeviceOpener>, logger: Arc<dyn LogSink>) -> Self {
        Proxy {
            settings,
            opener,
            logger,
            bindings: BTreeMap::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers a binding. TCP ports must be unique; the same serial port
    /// may be bound to several TCP ports, each opening its own handle.
    pub fn add_binding(
        &mut self,
        tcp_port: u32,
        serial_port: &str,
        baud_rate: u32,
        dump: bool,
    ) -> Result<(), ProxyError> {
        if !(1..=65535).contains(&tcp_port) {
            return Err(ProxyError::InvalidTcpPort(tcp_port));
        }
        if baud_rate < 1 {
            return Err(ProxyError::InvalidBaudRate(baud_rate));
        }
        let tcp_port = tcp_port as u16;
        if self.bindings.contains_key(&tcp_port) {
            return Err(ProxyError::DuplicateTcpPort(tcp_port));
        }

        let spec = BindingSpec {
            tcp_port,
            serial_port: serial_port.to_string(),
            baud_rate,
            dump,
        };
        let binding = Binding::new(
            spec,
            self.settings.serial,
            self.settings.chunk_size,
            Arc::clone(&self.opener),
            Arc::clone(&self.logger),
        );
        self.bindings.insert(tcp_port, Arc::new(binding));
        Ok(())
    }

    pub fn add_spec(&mut self, spec: &BindingSpec) -> Result<(), ProxyError> {
        self.add_binding(u32::from(spec.tcp_port), &spec.serial_port, spec.baud_rate, spec.dump)
    }

    #[cfg(test)]
    pub fn binding(&self, tcp_port: u16) -> Option<Arc<Binding>> {
        self.bindings.get(&tcp_port).cloned()
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Arc<Binding>> {
        self.bindings.values()
    }

    /// Starts one accept loop per binding. A binding whose port cannot be
    /// bound is logged and skipped; the others still start.
    /// Returns the addresses actually listening.
    pub fn launch(&self) -> Vec<SocketAddr> {
        let mut bound = Vec::new();
        for (port, binding) in &self.bindings {
            let bind_address = format!("{}:{}", self.settings.bind_address, port);
            let started = TcpListener::bind(&bind_address)
                .map_err(|source| ProxyError::Listener { port: *port, source })
                .and_then(|listener| {
                    let addr = listener.local_addr()?;
                    let handle = spawn_listener(Arc::clone(binding), listener, Arc::clone(&self.logger))?;
                    Ok((addr, handle))
                });
            match started {
                Ok((addr, handle)) => {
                    self.logger.log(&format!("{}: Listening on {}", binding.id(), addr), LOG_NOTICE);
                    self.listeners
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(handle);
                    bound.push(addr);
                }
                Err(e) => {
                    self.logger.log(&format!("{}: {}", binding.id(), e), LOG_ERROR);
                }
            }
        }
        bound
    }

    /// Blocks until every listener has terminated.
    pub fn wait(&self) {
        let handles: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Stops every active client and closes every serial device.
    pub fn shutdown(&self) {
        for binding in self.bindings.values() {
            binding.close();
        }
    }
}

/// Accepts clients forever and hands each one to `binding`. Any accept
/// error terminates this listener only.
pub fn spawn_listener(
    binding: Arc<Binding>,
    listener: TcpListener,
    logger: Arc<dyn LogSink>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("listen {}", binding.spec().tcp_port))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    // failures are logged by the binding and only affect this client
                    Ok(client) => {
                        let _ = binding.handle_client(client);
                    }
                    Err(e) => {
                        logger.log(&format!("{}: Listener stopped: {}", binding.id(), e), LOG_WARN);
                        break;
                    }
                }
            }
        })
}
