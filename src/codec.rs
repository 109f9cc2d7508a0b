//! Application payload codecs
//!
//! The codec is chosen per application. Uplink decode failures are reported to the
//! caller which logs them and keeps the raw bytes; encode failures fail the enqueue.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PayloadCodec {
    #[default]
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "CAYENNE_LPP")]
    CayenneLpp,
    #[serde(rename = "CUSTOM_JS")]
    CustomJs,
}

impl PayloadCodec {
    /// Decode an uplink payload. `Ok(None)` when the application has no codec.
    pub fn decode(&self, f_port: u8, data: &[u8]) -> Result<Option<Value>> {
        match self {
            PayloadCodec::None => Ok(None),
            PayloadCodec::CayenneLpp => lpp_decode(data).map(Some),
            PayloadCodec::CustomJs => Err(script_unsupported(f_port)),
        }
    }

    /// Encode a structured downlink object into bytes.
    pub fn encode(&self, f_port: u8, object: &Value) -> Result<Vec<u8>> {
        match self {
            PayloadCodec::None => Err(Error::CodecFailed(
                "application has no payload codec configured".into(),
            )),
            PayloadCodec::CayenneLpp => lpp_encode(object),
            PayloadCodec::CustomJs => Err(script_unsupported(f_port)),
        }
    }
}

fn script_unsupported(f_port: u8) -> Error {
    Error::CodecFailed(format!(
        "custom-js codec (fPort {}) requires a script engine, which this build does not include",
        f_port
    ))
}

/// A GPS position found in a decoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Extract a position from a decoded object.
///
/// Understands the Cayenne LPP `gpsLocation` layout (first channel wins) and plain
/// objects carrying `latitude` / `longitude` (and optionally `altitude`) numbers.
pub fn location(decoded: &Value) -> Option<Location> {
    let obj = decoded.as_object()?;
    if let Some(gps) = obj.get("gpsLocation").and_then(Value::as_object) {
        if let Some(loc) = gps.values().find_map(point) {
            return Some(loc);
        }
    }
    point(decoded)
}

fn point(v: &Value) -> Option<Location> {
    Some(Location {
        latitude: v.get("latitude")?.as_f64()?,
        longitude: v.get("longitude")?.as_f64()?,
        altitude: v.get("altitude").and_then(Value::as_f64).unwrap_or(0.0),
    })
}

// Cayenne Low Power Payload: repeated `channel | type | value`, values big-endian.

struct Field {
    name: Option<&'static str>,
    width: usize,
    signed: bool,
    scale: f64,
}

struct LppType {
    id: u8,
    key: &'static str,
    fields: &'static [Field],
}

const fn scalar(width: usize, signed: bool, scale: f64) -> Field {
    Field {
        name: None,
        width,
        signed,
        scale,
    }
}

const fn named(name: &'static str, width: usize, scale: f64) -> Field {
    Field {
        name: Some(name),
        width,
        signed: true,
        scale,
    }
}

const LPP_TYPES: &[LppType] = &[
    LppType { id: 0, key: "digitalInput", fields: &[scalar(1, false, 1.0)] },
    LppType { id: 1, key: "digitalOutput", fields: &[scalar(1, false, 1.0)] },
    LppType { id: 2, key: "analogInput", fields: &[scalar(2, true, 100.0)] },
    LppType { id: 3, key: "analogOutput", fields: &[scalar(2, true, 100.0)] },
    LppType { id: 101, key: "illuminanceSensor", fields: &[scalar(2, false, 1.0)] },
    LppType { id: 102, key: "presenceSensor", fields: &[scalar(1, false, 1.0)] },
    LppType { id: 103, key: "temperatureSensor", fields: &[scalar(2, true, 10.0)] },
    LppType { id: 104, key: "humiditySensor", fields: &[scalar(1, false, 2.0)] },
    LppType {
        id: 113,
        key: "accelerometer",
        fields: &[named("x", 2, 1000.0), named("y", 2, 1000.0), named("z", 2, 1000.0)],
    },
    LppType { id: 115, key: "barometer", fields: &[scalar(2, false, 10.0)] },
    LppType {
        id: 134,
        key: "gyrometer",
        fields: &[named("x", 2, 100.0), named("y", 2, 100.0), named("z", 2, 100.0)],
    },
    LppType {
        id: 136,
        key: "gpsLocation",
        fields: &[
            named("latitude", 3, 10000.0),
            named("longitude", 3, 10000.0),
            named("altitude", 3, 100.0),
        ],
    },
];

impl LppType {
    fn size(&self) -> usize {
        self.fields.iter().map(|f| f.width).sum()
    }
}

fn read_raw(b: &[u8], signed: bool) -> i64 {
    let v = b.iter().fold(0i64, |acc, x| (acc << 8) | i64::from(*x));
    if signed {
        let shift = 64 - 8 * b.len() as u32;
        (v << shift) >> shift
    } else {
        v
    }
}

fn field_value(field: &Field, raw: i64) -> Value {
    if field.scale == 1.0 {
        json!(raw)
    } else {
        json!(raw as f64 / field.scale)
    }
}

fn lpp_decode(data: &[u8]) -> Result<Value> {
    let mut out = Map::new();
    let mut i = 0;
    while i < data.len() {
        if i + 2 > data.len() {
            return Err(Error::CodecFailed(format!("truncated LPP header at byte {}", i)));
        }
        let channel = data[i];
        let type_id = data[i + 1];
        let ty = LPP_TYPES
            .iter()
            .find(|t| t.id == type_id)
            .ok_or_else(|| Error::CodecFailed(format!("unknown LPP type {}", type_id)))?;
        i += 2;
        if i + ty.size() > data.len() {
            return Err(Error::CodecFailed(format!(
                "truncated LPP {} on channel {}",
                ty.key, channel
            )));
        }

        let mut pos = i;
        let value = if ty.fields.len() == 1 && ty.fields[0].name.is_none() {
            let f = &ty.fields[0];
            field_value(f, read_raw(&data[pos..pos + f.width], f.signed))
        } else {
            let mut m = Map::new();
            for f in ty.fields {
                let raw = read_raw(&data[pos..pos + f.width], f.signed);
                pos += f.width;
                m.insert(f.name.unwrap_or_default().to_string(), field_value(f, raw));
            }
            Value::Object(m)
        };
        i += ty.size();

        let entry = out
            .entry(ty.key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(channels) = entry {
            channels.insert(channel.to_string(), value);
        }
    }
    Ok(Value::Object(out))
}

fn write_raw(out: &mut Vec<u8>, field: &Field, v: &Value, what: &str) -> Result<()> {
    let n = v
        .as_f64()
        .ok_or_else(|| Error::CodecFailed(format!("{} must be a number", what)))?;
    let raw = (n * field.scale).round() as i64;
    let bits = 8 * field.width as u32;
    let (min, max) = if field.signed {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    } else {
        (0, (1i64 << bits) - 1)
    };
    if raw < min || raw > max {
        return Err(Error::CodecFailed(format!("{} value {} out of range", what, n)));
    }
    out.extend_from_slice(&raw.to_be_bytes()[8 - field.width..]);
    Ok(())
}

fn lpp_encode(object: &Value) -> Result<Vec<u8>> {
    let obj = object
        .as_object()
        .ok_or_else(|| Error::CodecFailed("LPP object must be a JSON object".into()))?;

    let mut out = Vec::new();
    for (key, channels) in obj {
        let ty = LPP_TYPES
            .iter()
            .find(|t| t.key == key)
            .ok_or_else(|| Error::CodecFailed(format!("unknown LPP field {}", key)))?;
        let channels = channels
            .as_object()
            .ok_or_else(|| Error::CodecFailed(format!("{} must map channels to values", key)))?;

        for (channel, value) in channels {
            let channel: u8 = channel
                .parse()
                .map_err(|_| Error::CodecFailed(format!("invalid LPP channel {}", channel)))?;
            out.push(channel);
            out.push(ty.id);
            if ty.fields.len() == 1 && ty.fields[0].name.is_none() {
                write_raw(&mut out, &ty.fields[0], value, key)?;
            } else {
                for f in ty.fields {
                    let name = f.name.unwrap_or_default();
                    let v = value.get(name).cloned().unwrap_or(json!(0));
                    write_raw(&mut out, f, &v, name)?;
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lpp_decode_temperatures() {
        let data = [0x03, 0x67, 0x01, 0x10, 0x05, 0x67, 0x00, 0xFF];
        let v = PayloadCodec::CayenneLpp.decode(1, &data).unwrap().unwrap();
        assert_eq!(
            v,
            json!({"temperatureSensor": {"3": 27.2, "5": 25.5}})
        );
    }

    #[test]
    fn test_lpp_decode_gps_and_location() {
        let data = [0x01, 0x88, 0x06, 0x76, 0x5F, 0xF2, 0x96, 0x0A, 0x00, 0x03, 0xE8];
        let v = PayloadCodec::CayenneLpp.decode(2, &data).unwrap().unwrap();
        let loc = location(&v).unwrap();
        assert!((loc.latitude - 42.3519).abs() < 1e-9);
        assert!((loc.longitude + 87.9094).abs() < 1e-9);
        assert!((loc.altitude - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_lpp_decode_errors() {
        assert!(matches!(
            PayloadCodec::CayenneLpp.decode(1, &[0x01, 0x67, 0x01]),
            Err(Error::CodecFailed(_))
        ));
        assert!(matches!(
            PayloadCodec::CayenneLpp.decode(1, &[0x01, 0x42, 0x00]),
            Err(Error::CodecFailed(_))
        ));
    }

    #[test]
    fn test_lpp_encode() {
        let obj = json!({"digitalOutput": {"4": 1}, "analogOutput": {"1": -1.5}});
        let bytes = PayloadCodec::CayenneLpp.encode(10, &obj).unwrap();
        // keys in map order: analogOutput before digitalOutput
        assert_eq!(bytes, vec![0x01, 0x03, 0xFF, 0x6A, 0x04, 0x01, 0x01]);
    }

    #[test]
    fn test_lpp_encode_out_of_range() {
        let obj = json!({"humiditySensor": {"1": 200.0}});
        assert!(PayloadCodec::CayenneLpp.encode(1, &obj).is_err());
    }

    #[test]
    fn test_no_codec_and_script_codec() {
        assert_eq!(PayloadCodec::None.decode(1, &[1, 2]).unwrap(), None);
        assert!(PayloadCodec::None.encode(1, &json!({})).is_err());
        assert!(matches!(
            PayloadCodec::CustomJs.decode(1, &[1]),
            Err(Error::CodecFailed(_))
        ));
    }

    #[test]
    fn test_plain_location() {
        let v = json!({"latitude": 52.1, "longitude": 5.2});
        assert_eq!(
            location(&v),
            Some(Location {
                latitude: 52.1,
                longitude: 5.2,
                altitude: 0.0
            })
        );
        assert_eq!(location(&json!({"temperature": 21})), None);
    }

    #[test]
    fn test_codec_serde_names() {
        let c: PayloadCodec = serde_json::from_str("\"CAYENNE_LPP\"").unwrap();
        assert_eq!(c, PayloadCodec::CayenneLpp);
        assert_eq!(PayloadCodec::default(), PayloadCodec::None);
    }
}
