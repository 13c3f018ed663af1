// Mount backend speaking the Meade LX200 protocol over a TCP connection,
// e.g. to a serial-to-network bridge or a mount's own WiFi interface.
//
// References for LX200 command set include:
//    https://www.astro.louisville.edu/software/xmtel/archive/xmtel-indi-6.0/xmtel-6.0l/support/lx200/CommandSet.html
//    https://interactiveastronomy.com/lx-200gps_telescope_protocol_2010-10.pdf
//
// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, deadline_exceeded_error,
                      failed_precondition_error, internal_error,
                      invalid_argument_error, unavailable_error};
use log::{debug, info, warn};

use crate::instruction::Direction;
use crate::mount_driver::MountDriver;

pub struct Lx200Driver {
    address: String,
    stream: Option<TcpStream>,

    // Applies to connecting and to each read.
    io_timeout: Duration,

    // While slewing, the distance bars are queried this often.
    slew_poll_interval: Duration,
    slew_timeout: Duration,
}

impl Lx200Driver {
    // `address` host:port of the mount's LX200 interface.
    pub fn new(address: &str) -> Self {
        Lx200Driver{
            address: address.to_string(),
            stream: None,
            io_timeout: Duration::from_secs(5),
            slew_poll_interval: Duration::from_millis(250),
            slew_timeout: Duration::from_secs(300),
        }
    }

    pub fn set_slew_poll_interval(&mut self, interval: Duration) {
        self.slew_poll_interval = interval;
    }

    fn transport_error(context: &str, e: std::io::Error) -> CanonicalError {
        unavailable_error(format!("LX200 {}: {:?}", context, e).as_str())
    }

    fn stream(&mut self) -> Result<&mut TcpStream, CanonicalError> {
        match self.stream.as_mut() {
            Some(s) => Ok(s),
            None => Err(unavailable_error("LX200 mount is not connected")),
        }
    }

    fn send(&mut self, command: &str) -> Result<(), CanonicalError> {
        debug!("LX200 send {}", command);
        let stream = self.stream()?;
        stream.write_all(command.as_bytes())
            .map_err(|e| Self::transport_error("write", e))
    }

    // For commands answered by a single character.
    fn command_char(&mut self, command: &str) -> Result<char, CanonicalError> {
        self.send(command)?;
        let mut buf = [0_u8; 1];
        self.stream()?.read_exact(&mut buf)
            .map_err(|e| Self::transport_error("read", e))?;
        Ok(buf[0] as char)
    }

    // For commands answered by a '#'-terminated string. The terminator is not
    // included in the result.
    fn command_string(&mut self, command: &str) -> Result<String, CanonicalError> {
        self.send(command)?;
        let stream = self.stream()?;
        let mut reply = String::new();
        let mut buf = [0_u8; 1];
        loop {
            stream.read_exact(&mut buf)
                .map_err(|e| Self::transport_error("read", e))?;
            if buf[0] == b'#' {
                break;
            }
            reply.push(buf[0] as char);
            if reply.len() > 64 {
                return Err(internal_error(
                    format!("Unterminated LX200 reply to {}: {}",
                            command, reply).as_str()));
            }
        }
        debug!("LX200 reply {}", reply);
        Ok(reply)
    }

    fn command_accepted(&mut self, command: &str) -> Result<(), CanonicalError> {
        match self.command_char(command)? {
            '1' => Ok(()),
            c => Err(invalid_argument_error(
                format!("LX200 rejected {}: {}", command, c).as_str())),
        }
    }
}

impl MountDriver for Lx200Driver {
    fn connect(&mut self) -> Result<(), CanonicalError> {
        let addr: SocketAddr = self.address.to_socket_addrs()
            .map_err(|e| invalid_argument_error(
                format!("Bad LX200 address {}: {:?}", self.address, e).as_str()))?
            .next()
            .ok_or_else(|| invalid_argument_error(
                format!("LX200 address {} did not resolve", self.address).as_str()))?;
        let stream = TcpStream::connect_timeout(&addr, self.io_timeout)
            .map_err(|e| Self::transport_error("connect", e))?;
        stream.set_read_timeout(Some(self.io_timeout))
            .map_err(|e| Self::transport_error("configure", e))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not disable Nagle on LX200 connection: {:?}", e);
        }
        self.stream = Some(stream);
        // Switch to high precision coordinates if the mount is currently in
        // low precision mode. The toggle has no reply.
        let ra = self.command_string(":GR#")?;
        if ra.contains('.') {
            self.send(":U#")?;
        }
        info!("Connected to LX200 mount at {}", self.address);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), CanonicalError> {
        if self.stream.is_some() {
            // Halt all motion.
            if let Err(e) = self.send(":Q#") {
                warn!("Could not halt mount: {:?}", e);
            }
            self.stream = None;
            info!("Disconnected from LX200 mount at {}", self.address);
        }
        Ok(())
    }

    fn slew_to(&mut self, ra: f64, de: f64) -> Result<(), CanonicalError> {
        self.command_accepted(&format!(":Sr{}#", format_ra(ra)))?;
        self.command_accepted(&format!(":Sd{}#", format_de(de)))?;
        let reply = self.command_char(":MS#")?;
        if reply != '0' {
            // Drain the explanatory message.
            let mut message = String::new();
            let mut buf = [0_u8; 1];
            let stream = self.stream()?;
            while stream.read_exact(&mut buf).is_ok() && buf[0] != b'#' {
                message.push(buf[0] as char);
            }
            return Err(failed_precondition_error(
                format!("LX200 slew refused ({}): {}", reply, message).as_str()));
        }
        // Distance bars are empty once the slew is done.
        let start = Instant::now();
        loop {
            let bars = self.command_string(":D#")?;
            if bars.trim().is_empty() {
                return Ok(());
            }
            if start.elapsed() > self.slew_timeout {
                return Err(deadline_exceeded_error(
                    format!("LX200 slew not finished after {:?}",
                            self.slew_timeout).as_str()));
            }
            thread::sleep(self.slew_poll_interval);
        }
    }

    fn position(&mut self) -> Result<(f64, f64), CanonicalError> {
        let ra_str = self.command_string(":GR#")?;
        let de_str = self.command_string(":GD#")?;
        let ra = parse_ra(&ra_str).ok_or_else(|| internal_error(
            format!("Bad LX200 right ascension '{}'", ra_str).as_str()))?;
        let de = parse_de(&de_str).ok_or_else(|| internal_error(
            format!("Bad LX200 declination '{}'", de_str).as_str()))?;
        Ok((ra, de))
    }

    fn pulse_guide(&mut self, direction: Direction, duration: Duration)
                   -> Result<(), CanonicalError> {
        let dir_char = match direction {
            Direction::North => 'n',
            Direction::South => 's',
            Direction::East => 'e',
            Direction::West => 'w',
        };
        let millis = duration.as_millis().min(9999);
        self.send(&format!(":Mg{}{:04}#", dir_char, millis))?;
        // The mount executes the pulse asynchronously; don't overlap pulses.
        thread::sleep(Duration::from_millis(millis as u64));
        Ok(())
    }

    fn name(&self) -> &str { "LX200" }
}

// Splits a non-negative value into whole units, minutes and rounded seconds.
fn to_hms(n: f64) -> (i64, i64, i64) {
    let n_abs = n.abs();
    let mut hours = n_abs.trunc() as i64;
    let h_rem = n_abs.fract() * 60.0;
    let mut minutes = h_rem.trunc() as i64;
    let m_rem = h_rem.fract() * 60.0;
    let mut seconds = m_rem.round() as i64;
    if seconds == 60 {
        seconds = 0;
        minutes += 1;
        if minutes == 60 {
            minutes = 0;
            hours += 1;
        }
    }
    (hours, minutes, seconds)
}

// Radians to HH:MM:SS.
pub fn format_ra(ra: f64) -> String {
    let hours = ra.to_degrees().rem_euclid(360.0) / 15.0;
    let (h, m, s) = to_hms(hours);
    format!("{:02}:{:02}:{:02}", h % 24, m, s)
}

// Radians to sDD*MM:SS.
pub fn format_de(de: f64) -> String {
    let degrees = de.to_degrees();
    let sign = if degrees < 0.0 { '-' } else { '+' };
    let (d, m, s) = to_hms(degrees);
    format!("{}{:02}*{:02}:{:02}", sign, d, m, s)
}

// Accepts HH:MM:SS and the low precision HH:MM.T form. Returns radians.
pub fn parse_ra(s: &str) -> Option<f64> {
    let fields: Vec<&str> = s.trim().split(':').collect();
    let hours = match fields.as_slice() {
        [h, m, sec] => h.parse::<f64>().ok()? + m.parse::<f64>().ok()? / 60.0 +
            sec.parse::<f64>().ok()? / 3600.0,
        [h, m] => h.parse::<f64>().ok()? + m.parse::<f64>().ok()? / 60.0,
        _ => return None,
    };
    Some((hours * 15.0).to_radians())
}

// Accepts sDD*MM'SS, sDD*MM:SS and the low precision sDD*MM form. Returns
// radians.
pub fn parse_de(s: &str) -> Option<f64> {
    let s = s.trim();
    let (negative, rest) = match s.chars().next()? {
        '-' => (true, &s[1..]),
        '+' => (false, &s[1..]),
        _ => (false, s),
    };
    let fields: Vec<&str> =
        rest.split(|c| c == '*' || c == ':' || c == '\'' || c == '\u{df}')
        .filter(|f| !f.is_empty()).collect();
    let degrees = match fields.as_slice() {
        [d, m, sec] => d.parse::<f64>().ok()? + m.parse::<f64>().ok()? / 60.0 +
            sec.parse::<f64>().ok()? / 3600.0,
        [d, m] => d.parse::<f64>().ok()? + m.parse::<f64>().ok()? / 60.0,
        _ => return None,
    };
    let radians = degrees.to_radians();
    Some(if negative { -radians } else { radians })
}

// mod tests.
