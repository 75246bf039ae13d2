//! Per-kind capability descriptors: target table, natural key and field mapping.

use crate::model::{ColumnValue, RecordKind, Row, UpdatePolicy};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("missing natural key '{0}'")]
    MissingKey(&'static str),

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

type Mapper = fn(&Value, &FixedOffset) -> Result<Option<Row>, RecordError>;

pub struct KindDescriptor {
    /// Payload field holding the natural key.
    pub key_field: &'static str,
    mapper: Mapper,
}

impl KindDescriptor {
    /// Maps a payload into a row; `Ok(None)` means the record is of a
    /// category this deployment does not store.
    pub fn map(&self, record: &Value, display_tz: &FixedOffset) -> Result<Option<Row>, RecordError> {
        (self.mapper)(record, display_tz)
    }

    /// Natural key as it appears in the payload, for diagnostics.
    pub fn record_id(&self, record: &Value) -> String {
        match record.get(self.key_field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "<none>".to_string(),
            Some(other) => other.to_string(),
        }
    }
}

static TRIPS: KindDescriptor = KindDescriptor {
    key_field: "TripId",
    mapper: map_trip,
};

static EVENTS: KindDescriptor = KindDescriptor {
    key_field: "EventId",
    mapper: map_event,
};

static DRIVERS: KindDescriptor = KindDescriptor {
    key_field: "DriverId",
    mapper: map_driver,
};

pub fn descriptor(kind: RecordKind) -> &'static KindDescriptor {
    match kind {
        RecordKind::Trips => &TRIPS,
        RecordKind::Events => &EVENTS,
        RecordKind::Drivers => &DRIVERS,
    }
}

/// Driving-behaviour category; each has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventType {
    pub id: i64,
    pub table: &'static str,
    pub label: &'static str,
}

pub const EVENT_TYPES: [EventType; 20] = [
    EventType { id: -614457561876096876, table: "event_harsh_acceleration", label: "Harsh acceleration" },
    EventType { id: 3296322604872944138, table: "event_harsh_cornering", label: "Harsh cornering" },
    EventType { id: -1988381093544824498, table: "event_improper_clutch_use", label: "Improper clutch use" },
    EventType { id: 2164520525956490666, table: "event_stationary_over_revving", label: "Over-revving while stationary" },
    EventType { id: 74735825877637374, table: "event_speeding_20kmh", label: "Speeding 20 km/h" },
    EventType { id: -6248653914463313400, table: "event_speeding_30kmh", label: "Speeding 30 km/h" },
    EventType { id: 6474504604434952727, table: "event_speeding_40kmh_a", label: "Speeding 40 km/h (A)" },
    EventType { id: -1992910974424714295, table: "event_speeding_40kmh_b", label: "Speeding 40 km/h (B)" },
    EventType { id: 5511057473630489154, table: "event_speeding_50kmh", label: "Speeding 50 km/h" },
    EventType { id: 6580201539568389304, table: "event_speeding_55kmh_a", label: "Speeding 55 km/h (A)" },
    EventType { id: -9050647299058098294, table: "event_speeding_55kmh_b", label: "Speeding 55 km/h (B)" },
    EventType { id: 908787025131282024, table: "event_speeding_60kmh", label: "Speeding 60 km/h" },
    EventType { id: -6437542951044419628, table: "event_outside_green_band", label: "Outside green band" },
    EventType { id: 337658916843834225, table: "event_harsh_braking", label: "Harsh braking" },
    EventType { id: -1150311268842644462, table: "event_severe_harsh_braking", label: "Severe harsh braking" },
    EventType { id: 6314588935029952465, table: "event_coasting", label: "Coasting" },
    EventType { id: 2561992611692992861, table: "event_idling", label: "Idling" },
    EventType { id: -154632669554799975, table: "event_idling_over_5min", label: "Idling over 5 minutes" },
    EventType { id: 8889515098300962737, table: "event_over_revving", label: "Over-revving" },
    EventType { id: -4465594527070247088, table: "event_transmission_knock", label: "Transmission knock" },
];

pub fn event_type(id: i64) -> Option<&'static EventType> {
    EVENT_TYPES.iter().find(|t| t.id == id)
}

/// Converts a UTC wire timestamp to wall-clock time in `tz`.
/// Missing, non-string or unparseable values map to `None`.
pub fn to_display_time(value: Option<&Value>, tz: &FixedOffset) -> Option<NaiveDateTime> {
    let raw = value?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }

    let utc = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            let naive = raw.trim_end_matches('Z');
            NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f"))
                .ok()
                .map(|naive| naive.and_utc())
        })?;

    Some(utc.with_timezone(tz).naive_local())
}

/// Reads an integer sent as a JSON number (whole floats included) or a
/// numeric string.
fn loose_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts integers sent as JSON numbers, whole floats or numeric strings.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => loose_i64(&value)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("{value} is not a 64-bit integer"))),
    }
}

fn text(value: Option<Value>) -> ColumnValue {
    ColumnValue::Text(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn json(value: Option<Value>) -> ColumnValue {
    ColumnValue::Json(value.filter(|v| !v.is_null()))
}

fn decode<T: DeserializeOwned>(record: &Value) -> Result<T, RecordError> {
    Ok(T::deserialize(record)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TripPayload {
    #[serde(default, deserialize_with = "lenient_i64")]
    trip_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    asset_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    driver_id: Option<i64>,
    start_time: Option<Value>,
    end_time: Option<Value>,
    distance: Option<f64>,
    average_speed: Option<f64>,
    max_speed: Option<f64>,
    fuel_used: Option<f64>,
    start_location: Option<Value>,
    end_location: Option<Value>,
    idle_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    harsh_events: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    speeding_events: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    stop_count: Option<i64>,
}

fn map_trip(record: &Value, tz: &FixedOffset) -> Result<Option<Row>, RecordError> {
    let trip: TripPayload = decode(record)?;
    let key = trip.trip_id.ok_or(RecordError::MissingKey("TripId"))?;

    Ok(Some(Row {
        table: "trips",
        key_column: "trip_id",
        key,
        update: UpdatePolicy::AllColumns,
        columns: vec![
            ("trip_id", ColumnValue::BigInt(Some(key))),
            ("asset_id", ColumnValue::BigInt(trip.asset_id)),
            ("driver_id", ColumnValue::BigInt(trip.driver_id)),
            ("start_time", ColumnValue::Timestamp(to_display_time(trip.start_time.as_ref(), tz))),
            ("end_time", ColumnValue::Timestamp(to_display_time(trip.end_time.as_ref(), tz))),
            ("distance", ColumnValue::Double(trip.distance)),
            ("average_speed", ColumnValue::Double(trip.average_speed)),
            ("max_speed", ColumnValue::Double(trip.max_speed)),
            ("fuel_used", ColumnValue::Double(trip.fuel_used)),
            ("start_location", json(trip.start_location)),
            ("end_location", json(trip.end_location)),
            ("idle_time", ColumnValue::Double(trip.idle_time)),
            ("harsh_events", ColumnValue::BigInt(trip.harsh_events)),
            ("speeding_events", ColumnValue::BigInt(trip.speeding_events)),
            ("stop_count", ColumnValue::BigInt(trip.stop_count)),
        ],
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EventPayload {
    #[serde(default, deserialize_with = "lenient_i64")]
    event_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    asset_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    driver_id: Option<i64>,
    event_category: Option<Value>,
    start_date_time: Option<Value>,
    start_latitude: Option<f64>,
    start_longitude: Option<f64>,
    start_speed_kph: Option<f64>,
    start_odometer: Option<f64>,
    end_date_time: Option<Value>,
    end_latitude: Option<f64>,
    end_longitude: Option<f64>,
    end_speed_kph: Option<f64>,
    end_odometer: Option<f64>,
    value: Option<f64>,
    fuel_used_litres: Option<f64>,
    value_type: Option<Value>,
    value_units: Option<Value>,
    total_time_seconds: Option<f64>,
    // Vendor spelling.
    #[serde(default, deserialize_with = "lenient_i64")]
    total_occurances: Option<i64>,
    speed_limit: Option<f64>,
}

fn map_event(record: &Value, tz: &FixedOffset) -> Result<Option<Row>, RecordError> {
    // Categories we do not store are skipped whatever the rest of the payload holds.
    let Some(event_type) = record
        .get("EventTypeId")
        .and_then(loose_i64)
        .and_then(event_type)
    else {
        return Ok(None);
    };
    let event: EventPayload = decode(record)?;
    let key = event.event_id.ok_or(RecordError::MissingKey("EventId"))?;

    Ok(Some(Row {
        table: event_type.table,
        key_column: "event_id",
        key,
        update: UpdatePolicy::Immutable,
        columns: vec![
            ("event_id", ColumnValue::BigInt(Some(key))),
            ("event_type_id", ColumnValue::BigInt(Some(event_type.id))),
            ("asset_id", ColumnValue::BigInt(event.asset_id)),
            ("driver_id", ColumnValue::BigInt(event.driver_id)),
            ("event_category", text(event.event_category)),
            ("start_date_time", ColumnValue::Timestamp(to_display_time(event.start_date_time.as_ref(), tz))),
            ("start_latitude", ColumnValue::Double(event.start_latitude)),
            ("start_longitude", ColumnValue::Double(event.start_longitude)),
            ("start_speed_kph", ColumnValue::Double(event.start_speed_kph)),
            ("start_odometer", ColumnValue::Double(event.start_odometer)),
            ("end_date_time", ColumnValue::Timestamp(to_display_time(event.end_date_time.as_ref(), tz))),
            ("end_latitude", ColumnValue::Double(event.end_latitude)),
            ("end_longitude", ColumnValue::Double(event.end_longitude)),
            ("end_speed_kph", ColumnValue::Double(event.end_speed_kph)),
            ("end_odometer", ColumnValue::Double(event.end_odometer)),
            ("value", ColumnValue::Double(event.value)),
            ("fuel_used_litres", ColumnValue::Double(event.fuel_used_litres)),
            ("value_type", text(event.value_type)),
            ("value_units", text(event.value_units)),
            ("total_time_seconds", ColumnValue::Double(event.total_time_seconds)),
            ("total_occurrences", ColumnValue::BigInt(event.total_occurances)),
            ("speed_limit", ColumnValue::Double(event.speed_limit)),
        ],
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DriverPayload {
    #[serde(default, deserialize_with = "lenient_i64")]
    driver_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    site_id: Option<i64>,
    name: Option<Value>,
    image_uri: Option<Value>,
    #[serde(default, deserialize_with = "lenient_i64")]
    fm_driver_id: Option<i64>,
    employee_number: Option<Value>,
    is_system_driver: Option<bool>,
    mobile_number: Option<Value>,
    email: Option<Value>,
    extended_driver_id: Option<Value>,
    extended_driver_id_type: Option<Value>,
    country: Option<Value>,
    additional_detail_fields: Option<Value>,
}

fn map_driver(record: &Value, _tz: &FixedOffset) -> Result<Option<Row>, RecordError> {
    let driver: DriverPayload = decode(record)?;
    let key = driver.driver_id.ok_or(RecordError::MissingKey("DriverId"))?;

    Ok(Some(Row {
        table: "drivers",
        key_column: "driver_id",
        key,
        update: UpdatePolicy::AllColumns,
        columns: vec![
            ("driver_id", ColumnValue::BigInt(Some(key))),
            ("site_id", ColumnValue::BigInt(driver.site_id)),
            ("name", text(driver.name)),
            ("image_uri", text(driver.image_uri)),
            ("fm_driver_id", ColumnValue::BigInt(driver.fm_driver_id)),
            ("employee_number", text(driver.employee_number)),
            ("is_system_driver", ColumnValue::Bool(driver.is_system_driver)),
            ("mobile_number", text(driver.mobile_number)),
            ("email", text(driver.email)),
            ("extended_driver_id", text(driver.extended_driver_id)),
            ("extended_driver_id_type", text(driver.extended_driver_id_type)),
            ("country", text(driver.country)),
            ("additional_detail_fields", json(driver.additional_detail_fields)),
        ],
    }))
}
