// com2tcp - Serial to TCP Proxy
//
// Copyright (C) 2025 Kris Kirby
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
// com2tcp main source
//
// This file is part of com2tcp.
//
// com2tcp is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// com2tcp is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with com2tcp.  If not, see <https://www.gnu.org/licenses/>.
//
// Each binding exposes one serial port as a TCP listening port. A client that
// connects gets a raw, bidirectional byte stream to the serial device. Only one
// client per serial port is served at a time; a new connection replaces the
// current one. Transferred bytes can optionally be dumped in hex.

mod binding;
mod cancel;
mod config;
mod copy_loop;
mod error;
mod hexdump;
mod logger;
mod proxy;
mod serial_stream;

use std::fs::File;
use std::io::Write;
use std::process;
use std::sync::Arc;

use crate::config::Config;
use crate::logger::{LogSink, Logger, LOG_NOTICE};
use crate::proxy::{Proxy, ProxySettings};
use crate::serial_stream::SystemSerial;

fn show_help(program_name: &str) {
    println!("com2tcp - Serial to TCP Proxy\n");
    println!("Usage: {} [OPTIONS] binding1 binding2 ...\n", program_name);
    println!("Bindings:");
    println!("  TcpPort:SerialPort@baudRate     Binding without dump");
    println!("  TcpPort::SerialPort@baudRate    Binding with hex dump of transferred data");
    println!("\nOptions:");
    println!("  -c, --config <file>    Config file (bindingNNNN=... entries and settings below)");
    println!("  -I, --address <addr>   Listen address (default: 0.0.0.0)");
    println!("  -l, --logfile <file>   Log file path");
    println!("  -L, --log-level <0-9>  Log level (default: 5)");
    println!("  --no-console           Do not log to console");
    println!("  -P, --pidfile <file>   PID file path");
    println!("  -q, --quiet            Quiet startup");
    println!("  -h, --help             Show this help\n");
    println!("Config file options:");
    println!("  bindingNNNN, bind_address, log_level, logfile, log_to_console,");
    println!("  pidfile, quiet_startup, poll_interval_us, chunk_size\n");
    println!("Examples:");
    println!("  {} 8000::COM3@9600 8001:COM4@115200", program_name);
    println!("  {} -I 127.0.0.1 7000:/dev/ttyUSB0@57600", program_name);
    println!("\nLog levels: 0=EMERG 1=ALERT 2=CRIT 3=ERROR 4=WARN 5=NOTICE 6=INFO 7=DEBUG 8=TRACE 9=VERBOSE");
}

fn write_pidfile(pidfile: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = File::create(pidfile)?;
    writeln!(file, "{}", process::id())?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let program_name = args.first().map(String::as_str).unwrap_or("com2tcp");

    let config = match Config::load(args.get(1..).unwrap_or(&[])) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e.startup_message());
            process::exit(1);
        }
    };

    if config.show_help || config.bindings.is_empty() {
        show_help(program_name);
        return Ok(());
    }

    let logger: Arc<dyn LogSink> = Arc::new(Logger::new(
        config.logfile.clone(),
        config.log_level,
        config.log_to_console,
    )?);

    let mut proxy = Proxy::new(ProxySettings::from(&config), Arc::new(SystemSerial), Arc::clone(&logger));
    for spec in &config.bindings {
        if let Err(e) = proxy.add_spec(spec) {
            eprintln!("Invalid binding: {} ({})", spec, e);
            process::exit(1);
        }
    }

    if !config.quiet_startup {
        println!("com2tcp - Serial to TCP Proxy");
        println!("=============================");
        for spec in proxy.bindings().map(|b| b.spec()) {
            println!(
                "  TCP {}:{} <-> {} @ {} baud, 8N1{}",
                config.bind_address,
                spec.tcp_port,
                spec.serial_port,
                spec.baud_rate,
                if spec.dump { ", dump" } else { "" }
            );
        }
        println!("  Log level: {}", config.log_level);
        if let Some(ref lf) = config.logfile { println!("  Log file: {}", lf); }
        if let Some(ref pf) = config.pidfile { println!("  PID file: {}", pf); }
        println!();
    }

    if let Some(ref pidfile) = config.pidfile {
        write_pidfile(pidfile)?;
        if !config.quiet_startup {
            println!("PID {} written to {}", process::id(), pidfile);
        }
    }

    let proxy = Arc::new(proxy);
    let shutdown_proxy = Arc::clone(&proxy);
    let shutdown_logger = Arc::clone(&logger);
    ctrlc::set_handler(move || {
        shutdown_logger.log("Received SIGINT, shutting down", LOG_NOTICE);
        shutdown_proxy.shutdown();
        process::exit(0);
    })?;

    logger.log("com2tcp starting", LOG_NOTICE);
    if proxy.launch().is_empty() {
        return Err("Failed to bind any TCP port".into());
    }
    proxy.wait();
    Ok(())
}
