//! Minimal Tor control-port client: cookie authentication and `SIGNAL
//! NEWNYM`.

use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, ShieldError};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Ask the running Tor to switch to clean circuits.
pub fn new_identity(control_port: u16, cookie_path: &Path) -> Result<()> {
    let cookie = std::fs::read(cookie_path).map_err(|e| {
        ShieldError::Control(format!("cannot read cookie {}: {e}", cookie_path.display()))
    })?;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, control_port));
    let stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT)
        .map_err(|e| ShieldError::Control(format!("connect {addr}: {e}")))?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    let reader = BufReader::new(stream.try_clone()?);
    request_newnym(reader, stream, &cookie)?;
    info!(control_port, "new identity requested");
    Ok(())
}

/// Run the AUTHENTICATE / SIGNAL NEWNYM / QUIT exchange over any stream.
pub fn request_newnym<R: BufRead, W: Write>(mut reader: R, mut writer: W, cookie: &[u8]) -> Result<()> {
    if cookie.is_empty() {
        return Err(ShieldError::Control("authentication cookie is empty".into()));
    }
    command(&mut reader, &mut writer, &format!("AUTHENTICATE {}", hex::encode(cookie)))?;
    command(&mut reader, &mut writer, "SIGNAL NEWNYM")?;
    // Best effort: the signal has already been accepted.
    let _ = writer.write_all(b"QUIT\r\n");
    Ok(())
}

fn command<R: BufRead, W: Write>(reader: &mut R, writer: &mut W, line: &str) -> Result<()> {
    let verb = line.split_whitespace().next().unwrap_or(line);
    debug!(command = %verb, "control port request");
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\r\n")?;
    writer.flush()?;

    let reply = read_reply(reader)?;
    if !reply.starts_with("250") {
        return Err(ShieldError::Control(format!("{verb} rejected: {}", reply.trim())));
    }
    Ok(())
}

/// Read one (possibly multi-line) reply and return its final line.
fn read_reply<R: BufRead>(reader: &mut R) -> Result<String> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(ShieldError::Control("control connection closed".into()));
        }
        // "250-..." and "250+..." continue, "250 ..." ends the reply
        if line.len() < 4 || line.as_bytes()[3] == b' ' {
            return Ok(line);
        }
    }
}
