//! SNTP client
//!
//! One-shot queries against NTP servers: a 48-byte client packet goes out
//! on UDP 123, the reply's four timestamps give the clock offset. Small
//! offsets are slewed with adjtime, large ones stepped with settimeofday.

use crate::error::{ConnError, ConnResult};
use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const NTP_PORT: u16 = 123;
const NTP_PACKET_SIZE: usize = 48;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Offsets below this are slewed; larger ones step the clock.
const STEP_THRESHOLD_SECS: f64 = 0.5;

// Leap-not-synced (3) << 6 | version 4 << 3 | client mode 3.
const CLIENT_MODE_HEADER: u8 = 0xe3;

fn unix_to_ntp(now: SystemTime) -> (u32, u32) {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = since_epoch.as_secs() + NTP_UNIX_OFFSET;
    let fraction = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (seconds as u32, fraction as u32)
}

fn ntp_to_unix_seconds(seconds: u32, fraction: u32) -> f64 {
    seconds as f64 - NTP_UNIX_OFFSET as f64 + fraction as f64 / 2f64.powi(32)
}

fn read_timestamp(buf: &[u8], offset: usize) -> f64 {
    let seconds = u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
    let fraction = u32::from_be_bytes([
        buf[offset + 4],
        buf[offset + 5],
        buf[offset + 6],
        buf[offset + 7],
    ]);
    ntp_to_unix_seconds(seconds, fraction)
}

fn build_request(transmit: (u32, u32)) -> [u8; NTP_PACKET_SIZE] {
    let mut packet = [0u8; NTP_PACKET_SIZE];
    packet[0] = CLIENT_MODE_HEADER;
    packet[40..44].copy_from_slice(&transmit.0.to_be_bytes());
    packet[44..48].copy_from_slice(&transmit.1.to_be_bytes());
    packet
}

/// Clock offset computed from the reply, or a protocol error if the reply
/// does not echo our transmit timestamp.
fn compute_offset(
    request_transmit: (u32, u32),
    reply: &[u8],
    destination_time: f64,
) -> ConnResult<f64> {
    if reply.len() < NTP_PACKET_SIZE {
        return Err(ConnError::Protocol("short NTP reply".into()));
    }

    // Originate timestamp must match what we sent.
    let originate_seconds =
        u32::from_be_bytes([reply[24], reply[25], reply[26], reply[27]]);
    let originate_fraction =
        u32::from_be_bytes([reply[28], reply[29], reply[30], reply[31]]);
    if (originate_seconds, originate_fraction) != request_transmit {
        return Err(ConnError::Protocol("NTP originate mismatch".into()));
    }

    let t1 = ntp_to_unix_seconds(request_transmit.0, request_transmit.1);
    let t2 = read_timestamp(reply, 32); // receive
    let t3 = read_timestamp(reply, 40); // transmit
    let t4 = destination_time;

    Ok(((t2 - t1) + (t3 - t4)) / 2.0)
}

pub struct NtpClient;

impl NtpClient {
    /// Query one server and return the measured clock offset in seconds.
    pub async fn query(server: &str) -> ConnResult<f64> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((server, NTP_PORT)).await.map_err(|e| {
            ConnError::Transport(format!("connect {}: {}", server, e))
        })?;

        // Randomize the transmit fraction so replies cannot be spoofed
        // from a guessed timestamp.
        let mut transmit = unix_to_ntp(SystemTime::now());
        transmit.1 ^= rand::thread_rng().gen::<u32>();

        let request = build_request(transmit);
        socket.send(&request).await?;

        let mut reply = [0u8; 128];
        let len = timeout(QUERY_TIMEOUT, socket.recv(&mut reply))
            .await
            .map_err(|_| ConnError::Timeout(format!("NTP query to {}", server)))??;

        let destination = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let offset = compute_offset(transmit, &reply[..len], destination)?;
        debug!("NTP offset from {}: {:.6}s", server, offset);
        Ok(offset)
    }

    /// Walk the server list until one answers, then discipline the clock.
    pub async fn sync(servers: &[String]) -> ConnResult<()> {
        for server in servers {
            match Self::query(server).await {
                Ok(offset) => {
                    apply_offset(offset)?;
                    info!("time synchronized against {} ({:+.3}s)", server, offset);
                    return Ok(());
                }
                Err(e) => {
                    warn!("time server {} failed: {}", server, e);
                }
            }
        }

        Err(ConnError::NotFound("no reachable time server".into()))
    }
}

/// Slew small offsets, step large ones.
fn apply_offset(offset: f64) -> ConnResult<()> {
    let delta = libc::timeval {
        tv_sec: offset.trunc() as libc::time_t,
        tv_usec: (offset.fract() * 1_000_000.0) as libc::suseconds_t,
    };

    let ret = if offset.abs() < STEP_THRESHOLD_SECS {
        unsafe { libc::adjtime(&delta, std::ptr::null_mut()) }
    } else {
        let mut now = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        unsafe {
            if libc::gettimeofday(&mut now, std::ptr::null_mut()) < 0 {
                return Err(ConnError::Io(std::io::Error::last_os_error()));
            }
        }
        let mut stepped = libc::timeval {
            tv_sec: now.tv_sec + delta.tv_sec,
            tv_usec: now.tv_usec + delta.tv_usec,
        };
        if stepped.tv_usec >= 1_000_000 {
            stepped.tv_sec += 1;
            stepped.tv_usec -= 1_000_000;
        } else if stepped.tv_usec < 0 {
            stepped.tv_sec -= 1;
            stepped.tv_usec += 1_000_000;
        }
        unsafe { libc::settimeofday(&stepped, std::ptr::null()) }
    };

    if ret < 0 {
        return Err(ConnError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Set the wall clock to an absolute time (manual Time property writes).
pub fn set_time(seconds: u64) -> ConnResult<()> {
    let tv = libc::timeval {
        tv_sec: seconds as libc::time_t,
        tv_usec: 0,
    };
    let ret = unsafe { libc::settimeofday(&tv, std::ptr::null()) };
    if ret < 0 {
        return Err(ConnError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let packet = build_request((0x12345678, 0x9abcdef0));
        assert_eq!(packet.len(), NTP_PACKET_SIZE);
        assert_eq!(packet[0], 0xe3);
        assert_eq!(&packet[40..44], &0x12345678u32.to_be_bytes());
        assert_eq!(&packet[44..48], &0x9abcdef0u32.to_be_bytes());
    }

    #[test]
    fn test_epoch_conversion() {
        // 2026-01-01T00:00:00Z in NTP seconds.
        let ntp_seconds = 1_767_225_600u64 + NTP_UNIX_OFFSET;
        let unix = ntp_to_unix_seconds(ntp_seconds as u32, 0);
        assert_eq!(unix as u64, 1_767_225_600);
    }

    #[test]
    fn test_offset_computation() {
        let transmit = unix_to_ntp(SystemTime::now());
        let t1 = ntp_to_unix_seconds(transmit.0, transmit.1);

        // Server clock runs 10 seconds ahead, zero network delay.
        let server = t1 + 10.0;
        let mut reply = [0u8; NTP_PACKET_SIZE];
        reply[24..28].copy_from_slice(&transmit.0.to_be_bytes());
        reply[28..32].copy_from_slice(&transmit.1.to_be_bytes());
        let server_ntp = (server + NTP_UNIX_OFFSET as f64) as u64 as u32;
        reply[32..36].copy_from_slice(&server_ntp.to_be_bytes());
        reply[40..44].copy_from_slice(&server_ntp.to_be_bytes());

        let offset = compute_offset(transmit, &reply, t1).unwrap();
        assert!((offset - 10.0).abs() < 1.0);
    }

    #[test]
    fn test_originate_mismatch_rejected() {
        let reply = [0u8; NTP_PACKET_SIZE];
        let err = compute_offset((1, 2), &reply, 0.0).unwrap_err();
        assert!(matches!(err, ConnError::Protocol(_)));
    }
}
