//! Parser for the two NMEA 0183 sentence kinds the tracker consumes: GGA
//! (fix quality, satellites, position) and RMC (position, validity).
//!
//! Any talker prefix is accepted (`GP`, `GN`, `GL`, ...). Other sentence
//! types parse to [`Sentence::Other`] and are ignored by the tracker.

use super::fix::FixQuality;

const MAX_SENTENCE_LEN: usize = 120;

#[derive(Debug, Clone, PartialEq)]
pub struct GgaSentence {
    pub utc_time: String,
    pub position: Option<(f64, f64)>,
    pub quality: FixQuality,
    pub satellites: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RmcSentence {
    pub utc_time: String,
    pub active: bool,
    pub position: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga(GgaSentence),
    Rmc(RmcSentence),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingStart,
    #[error("sentence exceeds {MAX_SENTENCE_LEN} bytes")]
    TooLong,
    #[error("checksum mismatch: expected {expected:02X}, computed {computed:02X}")]
    Checksum { expected: u8, computed: u8 },
    #[error("malformed {0} field")]
    Malformed(&'static str),
}

pub fn parse_sentence(line: &str) -> Result<Sentence, NmeaError> {
    let line = line.trim();
    if line.len() > MAX_SENTENCE_LEN {
        return Err(NmeaError::TooLong);
    }
    let body = line.strip_prefix('$').ok_or(NmeaError::MissingStart)?;
    let body = verify_checksum(body)?;

    let fields: Vec<&str> = body.split(',').collect();
    let address = fields[0];
    if address.len() != 5 || !address.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(NmeaError::Malformed("address"));
    }

    match &address[2..] {
        "GGA" => parse_gga(&fields).map(Sentence::Gga),
        "RMC" => parse_rmc(&fields).map(Sentence::Rmc),
        _ => Ok(Sentence::Other(address.to_string())),
    }
}

/// Returns the payload without its `*hh` suffix. Sentences without a
/// checksum are accepted as-is.
fn verify_checksum(body: &str) -> Result<&str, NmeaError> {
    let Some((payload, checksum)) = body.split_once('*') else {
        return Ok(body);
    };

    // from_str_radix alone would take a sign ("+5").
    if checksum.len() != 2 || !checksum.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(NmeaError::Malformed("checksum"));
    }
    let expected =
        u8::from_str_radix(checksum, 16).map_err(|_| NmeaError::Malformed("checksum"))?;
    let computed = checksum_of(payload);
    if computed != expected {
        return Err(NmeaError::Checksum { expected, computed });
    }
    Ok(payload)
}

pub fn checksum_of(payload: &str) -> u8 {
    payload.bytes().fold(0u8, |acc, byte| acc ^ byte)
}

fn parse_gga(fields: &[&str]) -> Result<GgaSentence, NmeaError> {
    if fields.len() < 8 {
        return Err(NmeaError::Malformed("GGA length"));
    }

    let indicator = if fields[6].is_empty() {
        0
    } else {
        fields[6]
            .parse::<u8>()
            .map_err(|_| NmeaError::Malformed("GGA quality"))?
    };
    let satellites = if fields[7].is_empty() {
        0
    } else {
        fields[7]
            .parse::<u32>()
            .map_err(|_| NmeaError::Malformed("GGA satellites"))?
    };

    Ok(GgaSentence {
        utc_time: fields[1].to_string(),
        position: parse_position(fields[2], fields[3], fields[4], fields[5])?,
        quality: FixQuality::from_gga_indicator(indicator),
        satellites,
    })
}

fn parse_rmc(fields: &[&str]) -> Result<RmcSentence, NmeaError> {
    if fields.len() < 7 {
        return Err(NmeaError::Malformed("RMC length"));
    }

    let active = match fields[2] {
        "A" => true,
        "V" | "" => false,
        _ => return Err(NmeaError::Malformed("RMC status")),
    };

    Ok(RmcSentence {
        utc_time: fields[1].to_string(),
        active,
        position: parse_position(fields[3], fields[4], fields[5], fields[6])?,
    })
}

/// Empty coordinate fields mean "no position"; garbage in them is an error.
fn parse_position(
    lat: &str,
    lat_dir: &str,
    lon: &str,
    lon_dir: &str,
) -> Result<Option<(f64, f64)>, NmeaError> {
    if lat.is_empty() || lon.is_empty() {
        return Ok(None);
    }
    let latitude = parse_coordinate(lat, lat_dir, 'N', 'S', 90.0).ok_or(NmeaError::Malformed("latitude"))?;
    let longitude =
        parse_coordinate(lon, lon_dir, 'E', 'W', 180.0).ok_or(NmeaError::Malformed("longitude"))?;
    Ok(Some((latitude, longitude)))
}

/// `DDMM.MMMM` / `DDDMM.MMMM` to signed decimal degrees.
fn parse_coordinate(
    raw: &str,
    direction: &str,
    positive: char,
    negative: char,
    limit: f64,
) -> Option<f64> {
    if !raw.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    let dot = raw.find('.').unwrap_or(raw.len());
    if dot < 3 {
        return None;
    }
    let degrees: f64 = raw[..dot - 2].parse().ok()?;
    let minutes: f64 = raw[dot - 2..].parse().ok()?;
    if minutes >= 60.0 {
        return None;
    }

    let value = degrees + minutes / 60.0;
    if value > limit {
        return None;
    }

    let mut chars = direction.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c == positive => Some(value),
        (Some(c), None) if c == negative => Some(-value),
        _ => None,
    }
}

/// Appends `*hh` to a payload. Used by tests and simulators.
pub fn with_checksum(payload: &str) -> String {
    format!("${payload}*{:02X}", checksum_of(payload))
}
