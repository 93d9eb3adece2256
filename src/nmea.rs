//! Incremental NMEA 0183 parser.
//!
//! Bytes are fed in whatever chunks the positioning source produces. Complete
//! lines are matched against the `$<talker><type>,<fields>*<checksum>` frame,
//! checksum verified, and the supported sentences (GGA, RMC, GSA, VTG, GLL)
//! are folded into an accumulated [`ReceiverState`]. Anything else is dropped,
//! receivers are noisy and a bad line is not an error.

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use regex::Regex;
use tracing::trace;

/// Longest run of bytes kept while waiting for a line terminator
const MAX_PENDING: usize = 1024;

const KNOTS_TO_KMH: f64 = 1.852;

/// Quality of the position solution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fix {
    Gps,
    Dgps,
    Pps,
    Rtk,
    FloatRtk,
    Estimated,
    Manual,
    Simulation,
    TwoD,
    ThreeD,
}

/// Everything the receiver has told us so far
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReceiverState {
    pub time: Option<DateTime<Utc>>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    /// km/h
    pub speed: Option<f64>,
    pub fix: Option<Fix>,
    date: Option<NaiveDate>,
}

/// Sentence kinds the parser understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceKind {
    Gga,
    Rmc,
    Gsa,
    Vtg,
    Gll,
}

/// Emitted once per recognised sentence, carrying the state right after it was applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub kind: SentenceKind,
    pub state: ReceiverState,
}

#[derive(Debug)]
struct Malformed;

type Field<T> = Result<Option<T>, Malformed>;

#[derive(Debug, PartialEq)]
enum Sentence {
    Gga {
        time: Option<NaiveTime>,
        lat: Option<f64>,
        lon: Option<f64>,
        fix: Option<Fix>,
        alt: Option<f64>,
    },
    Rmc {
        time: Option<NaiveTime>,
        active: bool,
        lat: Option<f64>,
        lon: Option<f64>,
        speed_knots: Option<f64>,
        date: Option<NaiveDate>,
    },
    Gsa {
        fix: Option<Fix>,
    },
    Vtg {
        speed_knots: Option<f64>,
        speed_kmh: Option<f64>,
    },
    Gll {
        lat: Option<f64>,
        lon: Option<f64>,
        time: Option<NaiveTime>,
        active: bool,
    },
}

impl Sentence {
    fn kind(&self) -> SentenceKind {
        match self {
            Sentence::Gga { .. } => SentenceKind::Gga,
            Sentence::Rmc { .. } => SentenceKind::Rmc,
            Sentence::Gsa { .. } => SentenceKind::Gsa,
            Sentence::Vtg { .. } => SentenceKind::Vtg,
            Sentence::Gll { .. } => SentenceKind::Gll,
        }
    }
}

pub struct NmeaParser {
    pending: Vec<u8>,
    state: ReceiverState,
    frame: Regex,
}

impl Default for NmeaParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NmeaParser {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(128),
            state: ReceiverState::default(),
            frame: Regex::new(r"^\$([A-Z]{2})([A-Z]{3}),([^*]*)\*([0-9A-Fa-f]{2})$")
                .expect("NMEA frame pattern is valid"),
        }
    }

    pub fn state(&self) -> &ReceiverState {
        &self.state
    }

    /// Feed a chunk of raw bytes, returns a report for every complete sentence recognised
    pub fn update(&mut self, chunk: &[u8]) -> Vec<Report> {
        self.pending.extend_from_slice(chunk);
        let mut reports = Vec::new();

        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let Ok(line) = std::str::from_utf8(&line) else {
                trace!("Dropping non utf8 NMEA line");
                continue;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match self.parse_line(line) {
                Some(sentence) => {
                    let kind = sentence.kind();
                    self.apply(sentence);
                    reports.push(Report {
                        kind,
                        state: self.state,
                    });
                }
                None => trace!("Dropping NMEA line {line}"),
            }
        }

        if self.pending.len() > MAX_PENDING {
            trace!("Discarding {} unterminated NMEA bytes", self.pending.len());
            self.pending.clear();
        }
        reports
    }

    fn parse_line(&self, line: &str) -> Option<Sentence> {
        let caps = self.frame.captures(line)?;
        let kind = caps.get(2)?.as_str();
        let body = caps.get(3)?.as_str();
        let expected = u8::from_str_radix(caps.get(4)?.as_str(), 16).ok()?;
        // checksum covers everything between '$' and '*'
        let sum = line[1..line.len() - 3].bytes().fold(0u8, |acc, b| acc ^ b);
        if sum != expected {
            trace!("Bad NMEA checksum, got {sum:02X} expected {expected:02X}");
            return None;
        }

        let fields: Vec<&str> = body.split(',').collect();
        let parsed = match kind {
            "GGA" => parse_gga(&fields),
            "RMC" => parse_rmc(&fields),
            "GSA" => parse_gsa(&fields),
            "VTG" => parse_vtg(&fields),
            "GLL" => parse_gll(&fields),
            _ => return None,
        };
        parsed.ok()
    }

    fn apply(&mut self, sentence: Sentence) {
        let state = &mut self.state;
        match sentence {
            Sentence::Gga {
                time,
                lat,
                lon,
                fix,
                alt,
            } => {
                state.set_time(time);
                state.set_position(lat, lon);
                if alt.is_some() {
                    state.alt = alt;
                }
                state.fix = fix;
            }
            Sentence::Rmc {
                time,
                active,
                lat,
                lon,
                speed_knots,
                date,
            } => {
                if date.is_some() {
                    state.date = date;
                }
                state.set_time(time);
                if active {
                    state.set_position(lat, lon);
                    if let Some(knots) = speed_knots {
                        state.speed = Some(knots * KNOTS_TO_KMH);
                    }
                }
            }
            Sentence::Gsa { fix } => state.fix = fix,
            Sentence::Vtg {
                speed_knots,
                speed_kmh,
            } => {
                if let Some(speed) = speed_kmh.or(speed_knots.map(|k| k * KNOTS_TO_KMH)) {
                    state.speed = Some(speed);
                }
            }
            Sentence::Gll {
                lat,
                lon,
                time,
                active,
            } => {
                state.set_time(time);
                if active {
                    state.set_position(lat, lon);
                }
            }
        }
    }
}

impl ReceiverState {
    fn set_time(&mut self, time: Option<NaiveTime>) {
        let Some(time) = time else {
            return;
        };
        // crossed midnight since the last RMC reported a date
        if let (Some(date), Some(prev)) = (self.date, self.time) {
            if prev.date_naive() == date && prev.hour() == 23 && time.hour() == 0 {
                self.date = date.succ_opt();
            }
        }
        let date = self.date.unwrap_or_else(|| Utc::now().date_naive());
        self.time = Some(date.and_time(time).and_utc());
    }

    fn set_position(&mut self, lat: Option<f64>, lon: Option<f64>) {
        if let (Some(lat), Some(lon)) = (lat, lon) {
            self.lat = Some(lat);
            self.lon = Some(lon);
        }
    }
}

fn field<'a>(fields: &[&'a str], idx: usize) -> &'a str {
    fields.get(idx).copied().unwrap_or_default()
}

fn parse_gga(fields: &[&str]) -> Result<Sentence, Malformed> {
    let fix = match field(fields, 5) {
        "" | "0" => None,
        "1" => Some(Fix::Gps),
        "2" => Some(Fix::Dgps),
        "3" => Some(Fix::Pps),
        "4" => Some(Fix::Rtk),
        "5" => Some(Fix::FloatRtk),
        "6" => Some(Fix::Estimated),
        "7" => Some(Fix::Manual),
        "8" => Some(Fix::Simulation),
        _ => return Err(Malformed),
    };
    Ok(Sentence::Gga {
        time: parse_time(field(fields, 0))?,
        lat: parse_coord(field(fields, 1), field(fields, 2), 2)?,
        lon: parse_coord(field(fields, 3), field(fields, 4), 3)?,
        fix,
        alt: parse_number(field(fields, 8))?,
    })
}

fn parse_rmc(fields: &[&str]) -> Result<Sentence, Malformed> {
    let active = match field(fields, 1) {
        "A" => true,
        "V" | "" => false,
        _ => return Err(Malformed),
    };
    Ok(Sentence::Rmc {
        time: parse_time(field(fields, 0))?,
        active,
        lat: parse_coord(field(fields, 2), field(fields, 3), 2)?,
        lon: parse_coord(field(fields, 4), field(fields, 5), 3)?,
        speed_knots: parse_number(field(fields, 6))?,
        date: parse_date(field(fields, 8))?,
    })
}

fn parse_gsa(fields: &[&str]) -> Result<Sentence, Malformed> {
    let fix = match field(fields, 1) {
        "" | "1" => None,
        "2" => Some(Fix::TwoD),
        "3" => Some(Fix::ThreeD),
        _ => return Err(Malformed),
    };
    Ok(Sentence::Gsa { fix })
}

fn parse_vtg(fields: &[&str]) -> Result<Sentence, Malformed> {
    Ok(Sentence::Vtg {
        speed_knots: parse_number(field(fields, 4))?,
        speed_kmh: parse_number(field(fields, 6))?,
    })
}

fn parse_gll(fields: &[&str]) -> Result<Sentence, Malformed> {
    Ok(Sentence::Gll {
        lat: parse_coord(field(fields, 0), field(fields, 1), 2)?,
        lon: parse_coord(field(fields, 2), field(fields, 3), 3)?,
        time: parse_time(field(fields, 4))?,
        active: field(fields, 5) == "A",
    })
}

fn parse_number(value: &str) -> Field<f64> {
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| Malformed)
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere into signed decimal degrees
fn parse_coord(value: &str, hemisphere: &str, degree_digits: usize) -> Field<f64> {
    if value.is_empty() {
        return Ok(None);
    }
    if value.len() < degree_digits || !value.is_char_boundary(degree_digits) {
        return Err(Malformed);
    }
    let degrees: f64 = value[..degree_digits].parse().map_err(|_| Malformed)?;
    let minutes: f64 = value[degree_digits..].parse().map_err(|_| Malformed)?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        _ => Err(Malformed),
    }
}

/// `hhmmss[.sss]`
fn parse_time(value: &str) -> Field<NaiveTime> {
    if value.is_empty() {
        return Ok(None);
    }
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    if whole.len() != 6 || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Malformed);
    }
    let num = |range: std::ops::Range<usize>| whole[range].parse::<u32>().map_err(|_| Malformed);
    let millis = if frac.is_empty() {
        0
    } else {
        let secs: f64 = format!("0.{frac}").parse().map_err(|_| Malformed)?;
        (secs * 1000.0).round() as u32
    };
    NaiveTime::from_hms_milli_opt(num(0..2)?, num(2..4)?, num(4..6)?, millis.min(999))
        .map(Some)
        .ok_or(Malformed)
}

/// `ddmmyy`
fn parse_date(value: &str) -> Field<NaiveDate> {
    if value.is_empty() {
        return Ok(None);
    }
    if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Malformed);
    }
    let num = |range: std::ops::Range<usize>| value[range].parse::<u32>().map_err(|_| Malformed);
    NaiveDate::from_ymd_opt(2000 + num(4..6)? as i32, num(2..4)?, num(0..2)?)
        .map(Some)
        .ok_or(Malformed)
}

/// Frame a sentence body with `$`, checksum and CRLF
#[cfg(test)]
pub(crate) fn frame(body: &str) -> String {
    let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{sum:02X}\r\n")
}

#[cfg(test)]
mod tests {
    use chrono::Timelike;

    use super::*;

    #[test]
    fn known_gga_checksum() {
        let mut parser = NmeaParser::new();
        let reports = parser.update(
            b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n",
        );
        assert_eq!(reports.len(), 1);
        let state = reports[0].state;
        assert_eq!(state.fix, Some(Fix::Gps));
        assert!((state.lat.unwrap() - 48.1173).abs() < 1e-4);
        assert!((state.lon.unwrap() - 11.516_666).abs() < 1e-4);
        assert_eq!(state.alt, Some(545.4));
        assert_eq!(state.time.unwrap().hour(), 12);
    }

    #[test]
    fn accumulates_across_chunks() {
        let mut parser = NmeaParser::new();
        let line = frame("GPGGA,010203,3700.0000,N,11500.0000,W,1,05,1.0,10.0,M,0.0,M,,");
        let (a, b) = line.split_at(20);
        assert!(parser.update(a.as_bytes()).is_empty());
        assert_eq!(parser.state().fix, None);
        let reports = parser.update(b.as_bytes());
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state.lat, Some(37.0));
        assert_eq!(reports[0].state.lon, Some(-115.0));
    }

    #[test]
    fn bad_checksum_is_absorbed() {
        let mut parser = NmeaParser::new();
        let mut line = frame("GPGSA,A,3,04,05,,,,,,,,,,,2.5,1.3,2.1");
        line.replace_range(line.len() - 4..line.len() - 2, "00");
        assert!(parser.update(line.as_bytes()).is_empty());
        assert_eq!(parser.state().fix, None);
    }

    #[test]
    fn garbage_and_unknown_sentences_are_absorbed() {
        let mut parser = NmeaParser::new();
        let mut input = b"\xff\xfe garbage\r\n$GPGGA,not,a,sentence\r\n".to_vec();
        input.extend_from_slice(frame("GPGSV,3,1,11,03,03,111,00").as_bytes());
        input.extend_from_slice(frame("GPGGA,123519,48x7.038,N,01131.000,E,1,08,0.9,545.4,M,,M,,").as_bytes());
        assert!(parser.update(&input).is_empty());
        assert_eq!(parser.state(), &ReceiverState::default());
    }

    #[test]
    fn unterminated_input_is_bounded() {
        let mut parser = NmeaParser::new();
        parser.update(&[b'x'; MAX_PENDING + 1]);
        assert!(parser.pending.is_empty());
    }

    #[test]
    fn rmc_sets_date_and_speed() {
        let mut parser = NmeaParser::new();
        let reports = parser.update(
            frame("GPRMC,225446,A,4916.45,N,12311.12,W,000.5,054.7,191194,020.3,E").as_bytes(),
        );
        let state = reports[0].state;
        assert_eq!(
            state.time.unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2094, 11, 19).unwrap()
        );
        assert!((state.speed.unwrap() - 0.5 * KNOTS_TO_KMH).abs() < 1e-9);
        assert!(state.lon.unwrap() < 0.0);
        // RMC never touches the fix indicator
        assert_eq!(state.fix, None);
    }

    #[test]
    fn date_rolls_over_at_midnight() {
        let mut parser = NmeaParser::new();
        parser.update(
            frame("GPRMC,235959,A,4916.45,N,12311.12,W,000.5,054.7,191194,020.3,E").as_bytes(),
        );
        parser.update(frame("GPGGA,000001,4916.45,N,12311.12,W,1,08,0.9,5.0,M,,M,,").as_bytes());
        let next_day = NaiveDate::from_ymd_opt(2094, 11, 20).unwrap();
        assert_eq!(parser.state().time.unwrap().date_naive(), next_day);

        parser.update(frame("GPGGA,000002,4916.45,N,12311.12,W,1,08,0.9,5.0,M,,M,,").as_bytes());
        assert_eq!(parser.state().time.unwrap().date_naive(), next_day);

        // the next RMC confirms the date without moving it again
        parser.update(
            frame("GPRMC,000003,A,4916.45,N,12311.12,W,000.5,054.7,201194,020.3,E").as_bytes(),
        );
        assert_eq!(parser.state().time.unwrap().date_naive(), next_day);
    }

    #[test]
    fn void_rmc_keeps_position() {
        let mut parser = NmeaParser::new();
        parser.update(frame("GPGLL,3700.0000,N,11500.0000,W,010203,A").as_bytes());
        parser.update(frame("GPRMC,010204,V,,,,,,,010124,,").as_bytes());
        assert_eq!(parser.state().lat, Some(37.0));
        assert_eq!(parser.state().speed, None);
    }

    #[test]
    fn gsa_and_gga_drive_fix() {
        let mut parser = NmeaParser::new();
        parser.update(frame("GPGSA,A,3,04,05,,,,,,,,,,,2.5,1.3,2.1").as_bytes());
        assert_eq!(parser.state().fix, Some(Fix::ThreeD));
        parser.update(frame("GPGSA,A,1,,,,,,,,,,,,,,,").as_bytes());
        assert_eq!(parser.state().fix, None);
        parser.update(frame("GNGGA,010203,,,,,2,00,,,M,,M,,").as_bytes());
        assert_eq!(parser.state().fix, Some(Fix::Dgps));
    }

    #[test]
    fn vtg_prefers_kmh() {
        let mut parser = NmeaParser::new();
        parser.update(frame("GPVTG,054.7,T,034.4,M,005.5,N,010.2,K").as_bytes());
        assert_eq!(parser.state().speed, Some(10.2));
        parser.update(frame("GPVTG,054.7,T,034.4,M,001.0,N,,K").as_bytes());
        assert_eq!(parser.state().speed, Some(KNOTS_TO_KMH));
    }

    #[test]
    fn fractional_seconds() {
        assert_eq!(
            parse_time("235959.25").unwrap(),
            NaiveTime::from_hms_milli_opt(23, 59, 59, 250)
        );
        assert!(parse_time("2359").is_err());
        assert!(parse_time("246000").is_err());
    }
}
