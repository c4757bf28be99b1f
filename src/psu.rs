//! Bench supply control over SCPI.
//!
//! The supply listens on a raw TCP socket (port 5025). Commands and replies
//! are `\n` terminated; only queries (`?`) produce a reply.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub const SCPI_PORT: u16 = 5025;

/// Current used when a voltage is applied without an explicit limit.
pub const DEFAULT_CURRENT_LIMIT: f64 = 0.5;

/// Output channels of the two-channel supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Main input of the unit under test.
    Main = 1,
    /// Battery terminal of the unit under test.
    Battery = 2,
}

impl Channel {
    pub fn number(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum PsuError {
    #[error("power supply is not connected")]
    NotConnected,
    #[error("could not reach power supply at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("SCPI I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected reply to '{command}': '{reply}'")]
    BadReply { command: String, reply: String },
}

/// Primitive operations the electrical sequence is built from.
pub trait PsuLink: Send {
    /// Establishes the session and returns the instrument identity.
    fn connect(&mut self) -> Result<String, PsuError> {
        self.identify()
    }

    /// Returns the instrument identity (`*IDN?`).
    fn identify(&mut self) -> Result<String, PsuError>;

    fn select(&mut self, channel: Channel) -> Result<(), PsuError>;

    /// `APPLY v,c` on the selected channel.
    fn apply(&mut self, channel: Channel, volts: f64, amps: f64) -> Result<(), PsuError>;

    fn set_voltage(&mut self, channel: Channel, volts: f64) -> Result<(), PsuError>;

    fn set_current(&mut self, channel: Channel, amps: f64) -> Result<(), PsuError>;

    fn enable(&mut self, channel: Channel, on: bool) -> Result<(), PsuError>;

    fn measure_voltage(&mut self, channel: Channel) -> Result<f64, PsuError>;

    fn measure_current(&mut self, channel: Channel) -> Result<f64, PsuError>;

    fn is_connected(&self) -> bool {
        true
    }

    fn disconnect(&mut self) -> Result<(), PsuError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PsuSettings {
    pub host: String,
    pub port: u16,
    pub io_timeout: Duration,
}

impl Default for PsuSettings {
    fn default() -> Self {
        Self {
            host: "192.168.20.126".to_string(),
            port: SCPI_PORT,
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// SCPI supply reached over a TCP socket.
pub struct ScpiPsu {
    settings: PsuSettings,
    stream: Option<BufReader<TcpStream>>,
}

impl ScpiPsu {
    pub fn new(settings: PsuSettings) -> Self {
        Self { settings, stream: None }
    }

    /// Opens the socket and checks the instrument answers `*IDN?`.
    pub fn open(&mut self) -> Result<String, PsuError> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let connect_err = |source| PsuError::Connect {
            addr: addr.clone(),
            source,
        };

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| connect_err(io::ErrorKind::NotFound.into()))?;
        let stream = TcpStream::connect_timeout(&socket_addr, self.settings.io_timeout)
            .map_err(connect_err)?;
        stream.set_read_timeout(Some(self.settings.io_timeout))?;
        stream.set_write_timeout(Some(self.settings.io_timeout))?;
        stream.set_nodelay(true)?;
        self.stream = Some(BufReader::new(stream));

        let idn = self.identify()?;
        log::info!("connected to power supply: {}", idn);
        Ok(idn)
    }

    fn write_line(&mut self, command: &str) -> Result<(), PsuError> {
        let stream = self.stream.as_mut().ok_or(PsuError::NotConnected)?;
        let socket = stream.get_mut();
        socket.write_all(command.as_bytes())?;
        socket.write_all(b"\n")?;
        socket.flush()?;
        log::debug!("scpi > {}", command);
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, PsuError> {
        self.write_line(command)?;
        let stream = self.stream.as_mut().ok_or(PsuError::NotConnected)?;
        let mut reply = String::new();
        if stream.read_line(&mut reply)? == 0 {
            return Err(PsuError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        let reply = reply.trim_end().to_string();
        log::debug!("scpi < {}", reply);
        Ok(reply)
    }

    fn query_f64(&mut self, command: &str) -> Result<f64, PsuError> {
        let reply = self.query(command)?;
        reply.trim().parse::<f64>().map_err(|_| PsuError::BadReply {
            command: command.to_string(),
            reply,
        })
    }
}

impl PsuLink for ScpiPsu {
    fn connect(&mut self) -> Result<String, PsuError> {
        self.open()
    }

    fn identify(&mut self) -> Result<String, PsuError> {
        self.query("*IDN?")
    }

    fn select(&mut self, channel: Channel) -> Result<(), PsuError> {
        self.write_line(&format!("INST:SEL OUT{}", channel.number()))
    }

    fn apply(&mut self, channel: Channel, volts: f64, amps: f64) -> Result<(), PsuError> {
        self.select(channel)?;
        self.write_line(&format!("APPLY {:.2},{:.2}", volts, amps))
    }

    fn set_voltage(&mut self, channel: Channel, volts: f64) -> Result<(), PsuError> {
        self.select(channel)?;
        self.write_line(&format!("SOUR:VOLT {:.2}", volts))
    }

    fn set_current(&mut self, channel: Channel, amps: f64) -> Result<(), PsuError> {
        self.select(channel)?;
        self.write_line(&format!("SOUR:CURR {:.2}", amps))
    }

    fn enable(&mut self, channel: Channel, on: bool) -> Result<(), PsuError> {
        self.select(channel)?;
        self.write_line(if on { "OUTP 1" } else { "OUTP 0" })
    }

    fn measure_voltage(&mut self, channel: Channel) -> Result<f64, PsuError> {
        self.select(channel)?;
        self.query_f64("MEAS:VOLT?")
    }

    fn measure_current(&mut self, channel: Channel) -> Result<f64, PsuError> {
        self.select(channel)?;
        self.query_f64("MEAS:CURR?")
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) -> Result<(), PsuError> {
        if self.stream.take().is_some() {
            log::info!("disconnected from power supply");
        }
        Ok(())
    }
}

/// Applies `volts`/`amps` to `channel`, turns the output on and logs the read-back.
///
/// `(0, 0)` switches the channel off; a zero current with a non-zero voltage
/// uses [`DEFAULT_CURRENT_LIMIT`].
pub fn apply_and_enable<P: PsuLink + ?Sized>(
    psu: &mut P,
    channel: Channel,
    volts: f64,
    amps: f64,
    settle: Duration,
) -> Result<(), PsuError> {
    if volts == 0.0 && amps == 0.0 {
        return psu.enable(channel, false);
    }
    let amps = if amps == 0.0 { DEFAULT_CURRENT_LIMIT } else { amps };

    psu.apply(channel, volts, amps)?;
    thread::sleep(settle);
    psu.enable(channel, true)?;
    thread::sleep(settle);

    let measured_v = psu.measure_voltage(channel)?;
    let measured_i = psu.measure_current(channel)?;
    log::debug!(
        "channel {} set to {:.2} V / {:.2} A, measured {:.3} V / {:.4} A",
        channel.number(),
        volts,
        amps,
        measured_v,
        measured_i
    );
    Ok(())
}

/// Sets a channel to `volts` (or off for 0 V) and verifies the output followed.
pub fn power<P: PsuLink + ?Sized>(
    psu: &mut P,
    channel: Channel,
    volts: f64,
    settle: Duration,
) -> Result<bool, PsuError> {
    psu.set_voltage(channel, volts)?;
    if volts != 0.0 {
        psu.set_current(channel, DEFAULT_CURRENT_LIMIT)?;
        psu.enable(channel, true)?;
    } else {
        psu.enable(channel, false)?;
    }
    thread::sleep(settle);

    let measured = psu.measure_voltage(channel)?;
    let ok = if volts == 0.0 {
        measured <= 0.1
    } else {
        (volts - measured).abs() < 0.5
    };
    log::debug!(
        "channel {} power {:.2} V, measured {:.3} V ({})",
        channel.number(),
        volts,
        measured,
        if ok { "ok" } else { "off target" }
    );
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Minimal SCPI instrument: answers queries from a script and records every line.
    fn spawn_instrument(replies: Vec<&'static str>) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut writer = socket.try_clone().unwrap();
            let mut reader = BufReader::new(socket);
            let mut replies = replies.into_iter();
            let mut seen = Vec::new();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let cmd = line.trim_end().to_string();
                if cmd.ends_with('?') {
                    let reply = replies.next().unwrap_or("0");
                    writer.write_all(format!("{}\n", reply).as_bytes()).unwrap();
                }
                seen.push(cmd);
                line.clear();
            }
            seen
        });
        (port, handle)
    }

    fn psu_on(port: u16) -> ScpiPsu {
        ScpiPsu::new(PsuSettings {
            host: "127.0.0.1".to_string(),
            port,
            io_timeout: Duration::from_secs(2),
        })
    }

    #[test]
    fn connect_queries_identity() {
        let (port, instrument) = spawn_instrument(vec!["RIGOL,DP832,0,1.0"]);
        let mut psu = psu_on(port);
        assert_eq!(psu.connect().unwrap(), "RIGOL,DP832,0,1.0");
        assert!(psu.is_connected());
        psu.disconnect().unwrap();
        assert!(!psu.is_connected());
        assert_eq!(instrument.join().unwrap(), vec!["*IDN?"]);
    }

    #[test]
    fn commands_select_channel_first() {
        let (port, instrument) = spawn_instrument(vec!["id", "0.0123"]);
        let mut psu = psu_on(port);
        psu.connect().unwrap();
        psu.apply(Channel::Main, 14.0, 0.5).unwrap();
        psu.enable(Channel::Battery, false).unwrap();
        let amps = psu.measure_current(Channel::Battery).unwrap();
        assert!((amps - 0.0123).abs() < 1e-9);
        psu.disconnect().unwrap();

        assert_eq!(
            instrument.join().unwrap(),
            vec![
                "*IDN?",
                "INST:SEL OUT1",
                "APPLY 14.00,0.50",
                "INST:SEL OUT2",
                "OUTP 0",
                "INST:SEL OUT2",
                "MEAS:CURR?",
            ]
        );
    }

    #[test]
    fn non_numeric_reply_is_an_error() {
        let (port, _instrument) = spawn_instrument(vec!["id", "ERR"]);
        let mut psu = psu_on(port);
        psu.connect().unwrap();
        assert!(matches!(
            psu.measure_voltage(Channel::Main),
            Err(PsuError::BadReply { .. })
        ));
    }

    #[test]
    fn commands_need_a_connection() {
        let mut psu = ScpiPsu::new(PsuSettings::default());
        assert!(matches!(psu.enable(Channel::Main, true), Err(PsuError::NotConnected)));
    }

    #[test]
    fn unreachable_instrument_reports_address() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut psu = psu_on(port);
        match psu.connect() {
            Err(PsuError::Connect { addr, .. }) => assert_eq!(addr, format!("127.0.0.1:{}", port)),
            other => panic!("expected connect error, got {:?}", other.map(|_| ())),
        }
    }
}
