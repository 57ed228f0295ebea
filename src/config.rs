// com2tcp - Configuration
// Binding strings, optional config file, and command-line overrides

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use crate::copy_loop::DEFAULT_CHUNK_SIZE;
use crate::error::ProxyError;

/// One `TCP_PORT:SERIAL_ID@BAUD_RATE` (or `TCP_PORT::SERIAL_ID@BAUD_RATE`
/// with dump) binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub tcp_port: u16,
    pub serial_port: String,
    pub baud_rate: u32,
    pub dump: bool,
}

impl FromStr for BindingSpec {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |why: &str| ProxyError::InvalidBinding(format!("{} ({})", s, why));

        let (port, rest) = s.split_once(':').ok_or_else(|| malformed("missing ':'"))?;
        let tcp_port: u32 = port.parse().map_err(|_| malformed("tcp port is not a number"))?;

        let (dump, rest) = match rest.strip_prefix(':') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };

        // Serial ids may themselves contain '@', the baud rate follows the last one.
        let (serial_port, baud) = rest.rsplit_once('@').ok_or_else(|| malformed("missing '@'"))?;
        if serial_port.is_empty() {
            return Err(malformed("empty serial port"));
        }
        let baud_rate: u32 = baud.parse().map_err(|_| malformed("baud rate is not a number"))?;

        if !(1..=65535).contains(&tcp_port) {
            return Err(ProxyError::InvalidTcpPort(tcp_port));
        }
        if baud_rate < 1 {
            return Err(ProxyError::InvalidBaudRate(baud_rate));
        }

        Ok(BindingSpec {
            tcp_port: tcp_port as u16,
            serial_port: serial_port.to_string(),
            baud_rate,
            dump,
        })
    }
}

impl fmt::Display for BindingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.dump { "::" } else { ":" };
        write!(f, "{}{}{}@{}", self.tcp_port, sep, self.serial_port, self.baud_rate)
    }
}

/// Parses a binding, reporting failures with the offending text.
pub fn parse_binding(text: &str) -> Result<BindingSpec, ProxyError> {
    text.trim().parse().map_err(|e: ProxyError| match e {
        ProxyError::InvalidBinding(why) => ProxyError::InvalidBinding(why),
        other => ProxyError::InvalidBinding(format!("{} ({})", text.trim(), other)),
    })
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bindings: Vec<BindingSpec>,
    pub bind_address: String,
    pub log_level: u8,
    pub logfile: Option<String>,
    pub log_to_console: bool,
    pub pidfile: Option<String>,
    pub quiet_startup: bool,
    pub poll_interval: Option<Duration>,
    pub chunk_size: usize,
    pub show_help: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bindings: Vec::new(),
            bind_address: "0.0.0.0".to_string(),
            log_level: 5,
            logfile: None,
            log_to_console: true,
            pidfile: None,
            quiet_startup: false,
            poll_interval: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            show_help: false,
        }
    }
}

impl Config {
    /// Builds the configuration from command-line arguments (program name
    /// excluded), reading the `-c` file first when one is given.
    pub fn load(args: &[String]) -> Result<Self, ProxyError> {
        let config_file = args
            .iter()
            .position(|arg| arg == "-c" || arg == "--config")
            .and_then(|i| args.get(i + 1));

        let mut config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_cli_overrides(args)?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file '{}': {}", path, e)))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ProxyError> {
        let mut config_map = BTreeMap::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let mut value = value.trim();
                if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
                    value = &value[1..value.len() - 1];
                }
                config_map.insert(key.to_string(), value.to_string());
            }
        }

        let mut config = Config::default();

        // bindingNNNN entries, in key order
        for (key, value) in &config_map {
            if key.starts_with("binding") {
                config.bindings.push(parse_binding(value)?);
            }
        }

        if let Some(addr) = config_map.get("bind_address") {
            config.bind_address = addr.clone();
        }
        if let Some(level) = config_map.get("log_level") {
            config.log_level = Self::parse_log_level(level)?;
        }
        config.logfile = config_map.get("logfile").cloned();
        config.pidfile = config_map.get("pidfile").cloned();
        config.log_to_console = config_map
            .get("log_to_console")
            .and_then(|v| Self::parse_bool(v))
            .unwrap_or(true);
        config.quiet_startup = config_map
            .get("quiet_startup")
            .and_then(|v| Self::parse_bool(v))
            .unwrap_or(false);
        if let Some(us) = config_map.get("poll_interval_us") {
            let us: u64 = us
                .parse()
                .map_err(|_| ProxyError::Config(format!("Invalid poll_interval_us: {}", us)))?;
            config.poll_interval = Some(Duration::from_micros(us));
        }
        if let Some(size) = config_map.get("chunk_size") {
            config.chunk_size = match size.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ProxyError::Config(format!("Invalid chunk_size: {}", size))),
            };
        }

        Ok(config)
    }

    pub fn apply_cli_overrides(&mut self, args: &[String]) -> Result<(), ProxyError> {
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();
            let value = args.get(i + 1);
            let missing = || ProxyError::Config(format!("Option {} requires a value", arg));
            match arg {
                "-h" | "--help" => self.show_help = true,
                "-q" | "--quiet" => self.quiet_startup = true,
                "--no-console" => self.log_to_console = false,
                "-c" | "--config" => {
                    value.ok_or_else(missing)?;
                    i += 1;
                }
                "-I" | "--address" => {
                    self.bind_address = value.ok_or_else(missing)?.clone();
                    i += 1;
                }
                "-L" | "--log-level" => {
                    self.log_level = Self::parse_log_level(value.ok_or_else(missing)?)?;
                    i += 1;
                }
                "-l" | "--logfile" => {
                    self.logfile = Some(value.ok_or_else(missing)?.clone());
                    i += 1;
                }
                "-P" | "--pidfile" => {
                    self.pidfile = Some(value.ok_or_else(missing)?.clone());
                    i += 1;
                }
                _ if arg.starts_with('-') => {
                    return Err(ProxyError::Config(format!("Unknown option: {}", arg)));
                }
                _ => self.bindings.push(parse_binding(arg)?),
            }
            i += 1;
        }
        Ok(())
    }

    fn parse_log_level(s: &str) -> Result<u8, ProxyError> {
        s.parse::<u8>()
            .map(|level| level.min(9))
            .map_err(|_| ProxyError::Config(format!("Invalid log level: {}", s)))
    }

    fn parse_bool(s: &str) -> Option<bool> {
        match s.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

// Example configuration file:
//
// # Bindings, same grammar as on the command line
// binding0000=8000::/dev/ttyUSB0@9600
// binding0001=8001:/dev/ttyUSB1@115200
//
// bind_address=0.0.0.0
// log_level=5
// logfile=/var/log/com2tcp.log
// pidfile=/run/com2tcp.pid

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_binding_with_dump() {
        let spec: BindingSpec = "8000::COM3@9600".parse().unwrap();
        assert_eq!(
            spec,
            BindingSpec { tcp_port: 8000, serial_port: "COM3".to_string(), baud_rate: 9600, dump: true }
        );
    }

    #[test]
    fn test_parse_binding_without_dump() {
        let spec: BindingSpec = "8001:COM4@115200".parse().unwrap();
        assert_eq!(
            spec,
            BindingSpec { tcp_port: 8001, serial_port: "COM4".to_string(), baud_rate: 115200, dump: false }
        );
    }

    #[test]
    fn test_binding_display_matches_input() {
        for text in ["8000::COM3@9600", "8001:COM4@115200", "1:/dev/ttyUSB0@300"] {
            let spec: BindingSpec = text.parse().unwrap();
            assert_eq!(spec.to_string(), text);
        }
    }

    #[test]
    fn test_serial_id_up_to_last_at() {
        let spec: BindingSpec = "9000:/dev/serial/by-id/usb@1@57600".parse().unwrap();
        assert_eq!(spec.serial_port, "/dev/serial/by-id/usb@1");
        assert_eq!(spec.baud_rate, 57600);
    }

    #[test]
    fn test_invalid_bindings() {
        assert!(matches!("8000COM3@9600".parse::<BindingSpec>(), Err(ProxyError::InvalidBinding(_))));
        assert!(matches!("8000:COM3".parse::<BindingSpec>(), Err(ProxyError::InvalidBinding(_))));
        assert!(matches!("abc:COM3@9600".parse::<BindingSpec>(), Err(ProxyError::InvalidBinding(_))));
        assert!(matches!("8000:COM3@fast".parse::<BindingSpec>(), Err(ProxyError::InvalidBinding(_))));
        assert!(matches!("8000:@9600".parse::<BindingSpec>(), Err(ProxyError::InvalidBinding(_))));
        assert!(matches!("0:COM3@9600".parse::<BindingSpec>(), Err(ProxyError::InvalidTcpPort(0))));
        assert!(matches!("70000:COM3@9600".parse::<BindingSpec>(), Err(ProxyError::InvalidTcpPort(70000))));
        assert!(matches!("8000:COM3@0".parse::<BindingSpec>(), Err(ProxyError::InvalidBaudRate(0))));
    }

    #[test]
    fn test_parse_binding_names_offending_text() {
        let err = parse_binding("8000:COM3@0").unwrap_err();
        assert!(err.to_string().contains("8000:COM3@0"));
    }

    #[test]
    fn test_cli_bindings_and_options() {
        let config = Config::load(&args(&["-L", "7", "-q", "8000::COM3@9600", "8001:COM4@115200"])).unwrap();
        assert_eq!(config.bindings.len(), 2);
        assert_eq!(config.log_level, 7);
        assert!(config.quiet_startup);
        assert!(config.bindings[0].dump);
    }

    #[test]
    fn test_cli_errors() {
        assert!(Config::load(&args(&["--bogus"])).is_err());
        assert!(Config::load(&args(&["-L"])).is_err());
        assert!(Config::load(&args(&["8000:COM3"])).is_err());
    }

    #[test]
    fn test_no_bindings() {
        let config = Config::load(&[]).unwrap();
        assert!(config.bindings.is_empty());
        assert!(!config.show_help);
    }

    #[test]
    fn test_parse_config_file() {
        let contents = "\
# bindings
binding0001 = 8001:COM4@115200
binding0000 = \"8000::COM3@9600\"
bind_address = 127.0.0.1
log_level = 6
log_to_console = no
poll_interval_us = 250
chunk_size = 512
";
        let config = Config::parse(contents).unwrap();
        assert_eq!(config.bindings[0].tcp_port, 8000);
        assert_eq!(config.bindings[1].tcp_port, 8001);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.log_level, 6);
        assert!(!config.log_to_console);
        assert_eq!(config.poll_interval, Some(Duration::from_micros(250)));
        assert_eq!(config.chunk_size, 512);
    }

    #[test]
    fn test_config_file_rejects_bad_values() {
        assert!(Config::parse("binding0000=8000:COM3@0").is_err());
        assert!(Config::parse("chunk_size=0").is_err());
        assert!(Config::parse("log_level=loud").is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = std::env::temp_dir().join(format!("com2tcp-cfg-{}.cfg", std::process::id()));
        fs::write(&path, "binding0000=8000:COM3@9600\nlog_level=3\n").unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let config = Config::load(&args(&["-c", &path_str, "-L", "6", "8001:COM4@19200"])).unwrap();
        assert_eq!(config.log_level, 6);
        assert_eq!(config.bindings.len(), 2);
        let _ = fs::remove_file(&path);
    }
}
