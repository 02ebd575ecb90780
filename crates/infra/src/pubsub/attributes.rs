//! Event metadata carried as message attributes.

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use chronicle_core::EventId;
use chronicle_events::{AggregateRef, EventRecord};

use super::transport::Attributes;

pub const EVENT_ID: &str = "id";
pub const EVENT_NAME: &str = "name";
pub const OCCURRED_AT: &str = "time";
pub const AGGREGATE_ID: &str = "aggID";
pub const AGGREGATE_NAME: &str = "aggName";
pub const AGGREGATE_VERSION: &str = "aggVer";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing attribute {0}")]
    Missing(&'static str),

    #[error("malformed attribute {attribute}={value:?}: {reason}")]
    Malformed {
        attribute: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything of a record except its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub id: EventId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
    pub aggregate: AggregateRef,
}

pub fn encode(record: &EventRecord) -> Attributes {
    let aggregate = record.aggregate();
    Attributes::from([
        (EVENT_ID.to_string(), record.id().to_string()),
        (EVENT_NAME.to_string(), record.name().to_string()),
        (
            OCCURRED_AT.to_string(),
            record.occurred_at().to_rfc3339_opts(SecondsFormat::Nanos, true),
        ),
        (AGGREGATE_ID.to_string(), aggregate.id.clone()),
        (AGGREGATE_NAME.to_string(), aggregate.name.clone()),
        (AGGREGATE_VERSION.to_string(), aggregate.version.to_string()),
    ])
}

/// `aggName` may be absent; every other attribute is required.
pub fn decode(attributes: &Attributes) -> Result<EventHeader, ParseError> {
    let id = required(attributes, EVENT_ID)?;
    let id = id.parse::<EventId>().map_err(|err| malformed(EVENT_ID, id, err))?;

    let name = required(attributes, EVENT_NAME)?;
    if name.trim().is_empty() {
        return Err(malformed(EVENT_NAME, name, "empty event name"));
    }

    let time = required(attributes, OCCURRED_AT)?;
    let occurred_at = DateTime::parse_from_rfc3339(time)
        .map_err(|err| malformed(OCCURRED_AT, time, err))?
        .with_timezone(&Utc);

    let aggregate_id = required(attributes, AGGREGATE_ID)?;
    let version = required(attributes, AGGREGATE_VERSION)?;
    let version = version
        .parse::<u64>()
        .map_err(|err| malformed(AGGREGATE_VERSION, version, err))?;
    let aggregate_name = attributes.get(AGGREGATE_NAME).cloned().unwrap_or_default();

    Ok(EventHeader {
        id,
        name: name.to_string(),
        occurred_at,
        aggregate: AggregateRef::new(aggregate_id, aggregate_name, version),
    })
}

fn required<'a>(attributes: &'a Attributes, key: &'static str) -> Result<&'a str, ParseError> {
    attributes
        .get(key)
        .map(String::as_str)
        .ok_or(ParseError::Missing(key))
}

fn malformed(attribute: &'static str, value: &str, reason: impl ToString) -> ParseError {
    ParseError::Malformed {
        attribute,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
