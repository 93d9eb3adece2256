use std::{
    io::{ErrorKind, Read},
    time::Duration,
};

use futures_util::StreamExt;
use serialport::SerialPort;
use tokio::{
    io::AsyncRead,
    net::TcpStream,
    sync::mpsc::{error::TrySendError, Sender},
};
use tokio_util::{
    codec::{BytesCodec, FramedRead},
    sync::CancellationToken,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::PositioningSource,
    nmea::{NmeaParser, ReceiverState},
    telemetry::{TelemetrySnapshot, TelemetryState},
    Error, Result,
};

/// Serial reads give up after this long so cancellation is noticed
const SERIAL_POLL: Duration = Duration::from_millis(100);

/// Turns raw positioning bytes into fix transitions and snapshots
#[derive(Default)]
pub struct TelemetryProcessor {
    parser: NmeaParser,
}

impl TelemetryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of the positioning stream into `state`
    pub fn ingest(&mut self, chunk: &[u8], state: &mut TelemetryState) {
        for report in self.parser.update(chunk) {
            trace!("Got GPS {:?}", report.kind);
            apply_report(&report.state, state);
        }
    }
}

fn apply_report(rx: &ReceiverState, state: &mut TelemetryState) {
    if rx.fix.is_some() {
        if !state.is_fixed() {
            info!("GPS fix acquired ({:?})", rx.fix);
        }
        let prev = *state.snapshot();
        state.fix_acquired(TelemetrySnapshot {
            time: rx.time.unwrap_or(prev.time),
            lat: rx.lat.unwrap_or(prev.lat),
            lon: rx.lon.unwrap_or(prev.lon),
            alt: rx.alt.unwrap_or(prev.alt),
            speed: rx.speed.unwrap_or(prev.speed),
        });
    } else {
        if state.is_fixed() {
            info!("GPS fix lost");
        }
        state.fix_lost();
    }
}

/// Opens the positioning source and forwards its raw bytes until cancelled or the stream ends
pub async fn gps_reader(
    cancel_token: CancellationToken,
    source: PositioningSource,
    chunk_tx: Sender<Vec<u8>>,
) -> Result<()> {
    match &source {
        PositioningSource::Serial { device, baud } => {
            let port = serialport::new(device.as_str(), *baud)
                .timeout(SERIAL_POLL)
                .open()?;
            info!("Reading GPS data from {source}");
            tokio::task::spawn_blocking(move || read_serial(cancel_token, port, chunk_tx))
                .await
                .map_err(|err| Error::Io(std::io::Error::other(err)))?
        }
        PositioningSource::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            info!("Reading GPS data from {source}");
            stream_chunks(cancel_token, stream, chunk_tx).await
        }
    }
}

/// Blocking read loop for a serial port, `port` reads must time out for cancellation to work
fn read_serial<R: Read>(
    cancel_token: CancellationToken,
    mut port: R,
    chunk_tx: Sender<Vec<u8>>,
) -> Result<()> {
    let mut buf = [0u8; 512];
    while !cancel_token.is_cancelled() {
        let read = match port.read(&mut buf) {
            Ok(0) => {
                warn!("GPS stream ended, exiting!");
                return Ok(());
            }
            Ok(read) => read,
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                continue
            }
            Err(err) => {
                warn!("Error reading GPS stream: {err}");
                return Err(err.into());
            }
        };
        let mut chunk = buf[..read].to_vec();
        loop {
            match chunk_tx.try_send(chunk) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    if cancel_token.is_cancelled() {
                        break;
                    }
                    chunk = back;
                    std::thread::sleep(SERIAL_POLL);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("GPS consumer gone, quitting reader");
                    return Ok(());
                }
            }
        }
    }
    debug!("Quitting GPS reader");
    Ok(())
}

async fn stream_chunks<R: AsyncRead + Unpin>(
    cancel_token: CancellationToken,
    reader: R,
    chunk_tx: Sender<Vec<u8>>,
) -> Result<()> {
    let mut framed = FramedRead::new(reader, BytesCodec::new());
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Quitting GPS reader");
                break Ok(());
            },
            res = framed.next() => match res {
                Some(Ok(bytes)) => {
                    if chunk_tx.send(bytes.to_vec()).await.is_err() {
                        debug!("GPS consumer gone, quitting reader");
                        break Ok(());
                    }
                },
                Some(Err(err)) => {
                    warn!("Error reading GPS stream: {err}");
                    break Err(err.into());
                },
                None => {
                    warn!("GPS stream ended, exiting!");
                    break Ok(());
                },
            }
        }
    }
}
