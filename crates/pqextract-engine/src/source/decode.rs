//! `PostgreSQL` wire values -> [`Value`].
//!
//! The client always receives results in binary format. Native `FromSql`
//! impls handle the common types; NUMERIC, INTERVAL, TIMETZ, MONEY, network
//! addresses and one-dimensional arrays are rendered to their usual text
//! form here. Enums (and domains over text) are sent as text. Anything else
//! is kept as raw bytes rather than guessed at.

use std::error::Error;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::types::{FromSql, Kind, Type};

use crate::batch::Value;

type DecodeResult<T> = Result<T, Box<dyn Error + Sync + Send>>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

impl<'a> FromSql<'a> for Value {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        let value = match *ty {
            Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
            Type::CHAR => Value::Int16(i16::from(i8::from_sql(ty, raw)?)),
            Type::INT2 => Value::Int16(i16::from_sql(ty, raw)?),
            Type::INT4 => Value::Int32(i32::from_sql(ty, raw)?),
            Type::INT8 => Value::Int64(i64::from_sql(ty, raw)?),
            Type::OID => Value::Int64(i64::from(u32::from_sql(ty, raw)?)),
            Type::FLOAT4 => Value::Float32(f32::from_sql(ty, raw)?),
            Type::FLOAT8 => Value::Float64(f64::from_sql(ty, raw)?),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                Value::Text(String::from_sql(ty, raw)?)
            }
            Type::BYTEA => Value::Bytes(Vec::<u8>::from_sql(ty, raw)?),
            Type::DATE => Value::Date(NaiveDate::from_sql(ty, raw)?),
            Type::TIME => Value::Time(NaiveTime::from_sql(ty, raw)?),
            Type::TIMESTAMP => Value::Timestamp(NaiveDateTime::from_sql(ty, raw)?),
            Type::TIMESTAMPTZ => Value::TimestampTz(DateTime::<Utc>::from_sql(ty, raw)?),
            Type::JSON | Type::JSONB => {
                Value::Text(serde_json::Value::from_sql(ty, raw)?.to_string())
            }
            Type::UUID => Value::Text(uuid::Uuid::from_sql(ty, raw)?.hyphenated().to_string()),
            Type::NUMERIC => Value::Text(numeric_to_string(raw)?),
            Type::INTERVAL => Value::Text(interval_to_string(raw)?),
            Type::TIMETZ => Value::Text(timetz_to_string(raw)?),
            Type::MONEY => Value::Text(money_to_string(raw)?),
            Type::INET | Type::CIDR => Value::Text(inet_to_string(raw, *ty == Type::CIDR)?),
            Type::MACADDR | Type::MACADDR8 => Value::Text(hex_join(raw, ":")),
            Type::XML | Type::JSONPATH => Value::Text(String::from_utf8(raw.to_vec())?),
            _ => match ty.kind() {
                Kind::Enum(_) => Value::Text(String::from_utf8(raw.to_vec())?),
                Kind::Domain(base) => Self::from_sql(base, raw)?,
                Kind::Array(_) => match Vec::<Option<Value>>::from_sql(ty, raw) {
                    Ok(items) => Value::Text(array_to_string(&items)),
                    Err(_) => Value::Bytes(raw.to_vec()),
                },
                // citext and similar extension types use the text wire format.
                _ if is_text_extension(ty) => Value::Text(String::from_utf8(raw.to_vec())?),
                _ => Value::Bytes(raw.to_vec()),
            },
        };
        Ok(value)
    }

    fn from_sql_null(_: &Type) -> DecodeResult<Self> {
        Ok(Value::Null)
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// Render a binary NUMERIC payload as exact decimal text.
///
/// Layout: `ndigits`, `weight`, `sign`, `dscale` (all 16-bit big-endian),
/// followed by `ndigits` base-10000 digit groups.
pub(crate) fn numeric_to_string(raw: &[u8]) -> DecodeResult<String> {
    if raw.len() < 8 {
        return Err("numeric payload shorter than its header".into());
    }
    let word = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
    let ndigits = usize::from(word(0));
    let weight = i32::from(i16::from_be_bytes([raw[2], raw[3]]));
    let sign = word(4);
    let dscale = usize::from(word(6));

    if raw.len() != 8 + ndigits * 2 {
        return Err(format!(
            "numeric payload length {} does not match {ndigits} digit groups",
            raw.len()
        )
        .into());
    }

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("invalid numeric sign 0x{other:04x}").into()),
    }

    let digits: Vec<u16> = (0..ndigits).map(|i| word(8 + 2 * i)).collect();
    let group = |idx: i32| -> u16 {
        usize::try_from(idx)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for idx in 0..=weight {
            if idx == 0 {
                out.push_str(&group(idx).to_string());
            } else {
                out.push_str(&format!("{:04}", group(idx)));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(idx)));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}

fn is_text_extension(ty: &Type) -> bool {
    matches!(ty.name(), "citext" | "ltree" | "lquery")
}

fn be_i64(raw: &[u8], at: usize) -> DecodeResult<i64> {
    raw.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(i64::from_be_bytes)
        .ok_or_else(|| "payload too short".into())
}

fn be_i32(raw: &[u8], at: usize) -> DecodeResult<i32> {
    raw.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_be_bytes)
        .ok_or_else(|| "payload too short".into())
}

/// `[-]HH:MM:SS[.ffffff]` with trailing fractional zeros trimmed.
fn clock_text(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let micros = micros.unsigned_abs();
    let secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    let mut out = format!(
        "{sign}{:02}:{:02}:{:02}",
        secs / 3600,
        secs / 60 % 60,
        secs % 60
    );
    if frac != 0 {
        let digits = format!("{frac:06}");
        out.push('.');
        out.push_str(digits.trim_end_matches('0'));
    }
    out
}

/// INTERVAL: microseconds (i64), days (i32), months (i32).
fn interval_to_string(raw: &[u8]) -> DecodeResult<String> {
    if raw.len() != 16 {
        return Err(format!("interval payload must be 16 bytes, got {}", raw.len()).into());
    }
    let micros = be_i64(raw, 0)?;
    let days = be_i32(raw, 8)?;
    let months = be_i32(raw, 12)?;

    let unit = |n: i32, name: &str| {
        if n.abs() == 1 {
            format!("{n} {name}")
        } else {
            format!("{n} {name}s")
        }
    };
    let mut parts = Vec::new();
    if months / 12 != 0 {
        parts.push(unit(months / 12, "year"));
    }
    if months % 12 != 0 {
        parts.push(unit(months % 12, "mon"));
    }
    if days != 0 {
        parts.push(unit(days, "day"));
    }
    if micros != 0 || parts.is_empty() {
        parts.push(clock_text(micros));
    }
    Ok(parts.join(" "))
}

/// TIMETZ: microseconds since midnight (i64), zone offset in seconds west of UTC (i32).
fn timetz_to_string(raw: &[u8]) -> DecodeResult<String> {
    if raw.len() != 12 {
        return Err(format!("timetz payload must be 12 bytes, got {}", raw.len()).into());
    }
    let micros = be_i64(raw, 0)?;
    let east = -be_i32(raw, 8)?;
    let sign = if east < 0 { '-' } else { '+' };
    let east = east.unsigned_abs();
    let mut out = format!("{}{sign}{:02}", clock_text(micros), east / 3600);
    if east % 3600 != 0 {
        let _ = write!(out, ":{:02}", east / 60 % 60);
    }
    Ok(out)
}

/// MONEY: i64 count of cents.
fn money_to_string(raw: &[u8]) -> DecodeResult<String> {
    if raw.len() != 8 {
        return Err(format!("money payload must be 8 bytes, got {}", raw.len()).into());
    }
    let cents = be_i64(raw, 0)?;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    Ok(format!("{sign}{}.{:02}", cents / 100, cents % 100))
}

/// INET/CIDR: family, bits, is_cidr, address length, address bytes.
fn inet_to_string(raw: &[u8], cidr: bool) -> DecodeResult<String> {
    const AF_INET: u8 = 2;
    const AF_INET6: u8 = 3;
    let [family, bits, _, len, addr @ ..] = raw else {
        return Err("inet payload shorter than its header".into());
    };
    if usize::from(*len) != addr.len() {
        return Err("inet address length does not match payload".into());
    }
    let (text, max_bits) = match (*family, addr) {
        (AF_INET, &[a, b, c, d]) => (Ipv4Addr::new(a, b, c, d).to_string(), 32),
        (AF_INET6, bytes) if bytes.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            (Ipv6Addr::from(octets).to_string(), 128)
        }
        (other, _) => return Err(format!("unsupported inet family {other}").into()),
    };
    if cidr || *bits != max_bits {
        Ok(format!("{text}/{bits}"))
    } else {
        Ok(text)
    }
}

fn hex_join(raw: &[u8], sep: &str) -> String {
    raw.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(sep)
}

/// `{a,b,NULL}` in the server's array output syntax.
fn array_to_string(items: &[Option<Value>]) -> String {
    let rendered: Vec<String> = items
        .iter()
        .map(|item| match item {
            None | Some(Value::Null) => "NULL".to_string(),
            Some(v) => quote_array_element(&v.to_string()),
        })
        .collect();
    format!("{{{}}}", rendered.join(","))
}

fn quote_array_element(text: &str) -> String {
    let needs_quotes = text.is_empty()
        || text.eq_ignore_ascii_case("null")
        || text
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
    if !needs_quotes {
        return text.to_string();
    }
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut buf = Vec::new();
        let ndigits = u16::try_from(digits.len()).unwrap();
        buf.extend_from_slice(&ndigits.to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&sign.to_be_bytes());
        buf.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            buf.extend_from_slice(&d.to_be_bytes());
        }
        buf
    }

    #[test]
    fn numeric_with_fraction() {
        let raw = numeric(0, NUMERIC_POS, 2, &[123, 4500]);
        assert_eq!(numeric_to_string(&raw).unwrap(), "123.45");
    }

    #[test]
    fn numeric_negative_multi_group() {
        // -12345678.9
        let raw = numeric(1, NUMERIC_NEG, 1, &[1234, 5678, 9000]);
        assert_eq!(numeric_to_string(&raw).unwrap(), "-12345678.9");
    }

    #[test]
    fn numeric_small_fraction() {
        let raw = numeric(-1, NUMERIC_POS, 3, &[10]);
        assert_eq!(numeric_to_string(&raw).unwrap(), "0.001");
    }

    #[test]
    fn numeric_trailing_zero_groups() {
        let raw = numeric(1, NUMERIC_POS, 0, &[1]);
        assert_eq!(numeric_to_string(&raw).unwrap(), "10000");
    }

    #[test]
    fn numeric_zero_and_specials() {
        assert_eq!(numeric_to_string(&numeric(0, NUMERIC_POS, 0, &[])).unwrap(), "0");
        assert_eq!(numeric_to_string(&numeric(0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
        assert_eq!(
            numeric_to_string(&numeric(0, NUMERIC_NINF, 0, &[])).unwrap(),
            "-Infinity"
        );
    }

    #[test]
    fn numeric_rejects_truncated_payload() {
        let mut raw = numeric(0, NUMERIC_POS, 0, &[1, 2]);
        raw.pop();
        assert!(numeric_to_string(&raw).is_err());
        assert!(numeric_to_string(&[0, 1]).is_err());
    }

    #[test]
    fn null_decodes_to_null() {
        assert_eq!(Value::from_sql_null(&Type::INT4).unwrap(), Value::Null);
    }

    #[test]
    fn native_types_decode() {
        assert_eq!(
            Value::from_sql(&Type::INT8, &42i64.to_be_bytes()).unwrap(),
            Value::Int64(42)
        );
        assert_eq!(
            Value::from_sql(&Type::TEXT, b"hello").unwrap(),
            Value::Text("hello".into())
        );
        assert_eq!(Value::from_sql(&Type::BOOL, &[1]).unwrap(), Value::Bool(true));
    }

    fn interval(micros: i64, days: i32, months: i32) -> Vec<u8> {
        let mut buf = micros.to_be_bytes().to_vec();
        buf.extend_from_slice(&days.to_be_bytes());
        buf.extend_from_slice(&months.to_be_bytes());
        buf
    }

    #[test]
    fn interval_binary_payload_renders_as_text() {
        let decode = |raw: Vec<u8>| Value::from_sql(&Type::INTERVAL, &raw).unwrap();
        assert_eq!(decode(interval(0, 1, 0)), Value::Text("1 day".into()));
        assert_eq!(
            decode(interval(3_723_500_000, 2, 14)),
            Value::Text("1 year 2 mons 2 days 01:02:03.5".into())
        );
        assert_eq!(decode(interval(0, 0, 0)), Value::Text("00:00:00".into()));
        assert_eq!(decode(interval(-90_000_000, 0, 0)), Value::Text("-00:01:30".into()));
        assert!(Value::from_sql(&Type::INTERVAL, &[0; 4]).is_err());
    }

    #[test]
    fn inet_and_cidr_binary_payloads() {
        let host = [2, 32, 0, 4, 10, 0, 0, 1];
        assert_eq!(
            Value::from_sql(&Type::INET, &host).unwrap(),
            Value::Text("10.0.0.1".into())
        );
        let net = [2, 8, 1, 4, 10, 0, 0, 0];
        assert_eq!(
            Value::from_sql(&Type::CIDR, &net).unwrap(),
            Value::Text("10.0.0.0/8".into())
        );
        let mut v6 = vec![3, 128, 0, 16];
        v6.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        assert_eq!(
            Value::from_sql(&Type::INET, &v6).unwrap(),
            Value::Text("::1".into())
        );
        assert!(Value::from_sql(&Type::INET, &[2, 32]).is_err());
    }

    #[test]
    fn timetz_money_and_macaddr() {
        // 12:30:00 at UTC+02 (stored as 7200 seconds west, negated).
        let mut timetz = 45_000_000_000i64.to_be_bytes().to_vec();
        timetz.extend_from_slice(&(-7200i32).to_be_bytes());
        assert_eq!(
            Value::from_sql(&Type::TIMETZ, &timetz).unwrap(),
            Value::Text("12:30:00+02".into())
        );
        assert_eq!(
            Value::from_sql(&Type::MONEY, &(-1234i64).to_be_bytes()).unwrap(),
            Value::Text("-12.34".into())
        );
        assert_eq!(
            Value::from_sql(&Type::MACADDR, &[0x08, 0x00, 0x2b, 0x01, 0x02, 0x03]).unwrap(),
            Value::Text("08:00:2b:01:02:03".into())
        );
    }

    #[test]
    fn int_array_renders_with_nulls() {
        // ndim, has_null, element oid, dim length, lower bound, then elements.
        let mut raw = Vec::new();
        for word in [1i32, 1, 23, 3, 1] {
            raw.extend_from_slice(&word.to_be_bytes());
        }
        raw.extend_from_slice(&4i32.to_be_bytes());
        raw.extend_from_slice(&1i32.to_be_bytes());
        raw.extend_from_slice(&(-1i32).to_be_bytes());
        raw.extend_from_slice(&4i32.to_be_bytes());
        raw.extend_from_slice(&3i32.to_be_bytes());
        assert_eq!(
            Value::from_sql(&Type::INT4_ARRAY, &raw).unwrap(),
            Value::Text("{1,NULL,3}".into())
        );
    }

    #[test]
    fn array_elements_are_quoted_when_needed() {
        let items = vec![
            Some(Value::Text("plain".into())),
            Some(Value::Text("a b".into())),
            Some(Value::Text("say \"hi\"".into())),
            Some(Value::Text(String::new())),
            None,
        ];
        assert_eq!(
            array_to_string(&items),
            r#"{plain,"a b","say \"hi\"","",NULL}"#
        );
    }

    #[test]
    fn enum_and_domain_types_decode_as_text() {
        let mood = Type::new(
            "mood".into(),
            90_001,
            Kind::Enum(vec!["happy".into(), "sad".into()]),
            "public".into(),
        );
        assert_eq!(
            Value::from_sql(&mood, b"happy").unwrap(),
            Value::Text("happy".into())
        );
        let email = Type::new("email".into(), 90_002, Kind::Domain(Type::TEXT), "public".into());
        assert_eq!(
            Value::from_sql(&email, b"a@b.c").unwrap(),
            Value::Text("a@b.c".into())
        );
    }

    #[test]
    fn unknown_binary_types_stay_bytes() {
        // POINT is two float8s; never reinterpret that as text.
        let mut point = 1.5f64.to_be_bytes().to_vec();
        point.extend_from_slice(&2.0f64.to_be_bytes());
        assert_eq!(
            Value::from_sql(&Type::POINT, &point).unwrap(),
            Value::Bytes(point.clone())
        );
    }
}
