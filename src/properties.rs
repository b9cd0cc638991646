// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope ⇄ AMQP Properties
//!
//! Builds [`Envelope`]s from delivery properties and renders them back into
//! `BasicProperties` for publishing. Well-known header keys (`x-death`,
//! `x-received-from`, `rejected`, `exception`) are recognized by exact name;
//! every other header is kept as a generic key/value pair.

use crate::{
    delivery_queue::QueuedDelivery,
    envelope::{
        ContractKey, DeadLetterInfo, Envelope, Header, ReceivedFromInfo, HEADER_DEAD_LETTER,
        HEADER_EXCEPTION, HEADER_RECEIVED_FROM, HEADER_REJECTED,
    },
};
use lapin::{
    message::Delivery,
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::time::{Duration, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

/// Header carrying the contract namespace; the name travels in the `type` property.
pub const HEADER_CONTRACT_NAMESPACE: &str = "x-contract-namespace";

/// Builds the queue item for a lapin delivery.
pub fn decode_delivery(delivery: &Delivery) -> QueuedDelivery {
    QueuedDelivery::new(
        delivery.delivery_tag,
        envelope_from_properties(&delivery.properties, delivery.data.clone()),
        delivery.redelivered,
    )
}

/// Builds an envelope from wire properties and the raw body.
pub fn envelope_from_properties(props: &AMQPProperties, data: Vec<u8>) -> Envelope {
    let table = props.headers().clone().unwrap_or_default();

    let namespace = table
        .inner()
        .get(HEADER_CONTRACT_NAMESPACE)
        .and_then(value_to_string)
        .unwrap_or_default();

    let name = props
        .kind()
        .as_ref()
        .map(|k| k.to_string())
        .unwrap_or_default();

    Envelope {
        data,
        headers: headers_from_table(&table),
        bus_id: props.app_id().as_ref().map(|v| v.to_string()),
        sent: props
            .timestamp()
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        contract: ContractKey::new(name, namespace),
    }
}

/// Decodes the header table, recognizing well-known keys.
pub fn headers_from_table(table: &FieldTable) -> Vec<Header> {
    let mut headers = Vec::new();

    for (key, value) in table.inner() {
        match key.as_str() {
            HEADER_CONTRACT_NAMESPACE => {}
            HEADER_DEAD_LETTER => headers.push(Header::DeadLetter(
                tables_of(value).map(dead_letter_info).collect(),
            )),
            HEADER_RECEIVED_FROM => headers.push(Header::ReceivedFrom(
                tables_of(value).map(received_from_info).collect(),
            )),
            HEADER_REJECTED => headers.push(Header::Rejected),
            HEADER_EXCEPTION => headers.push(Header::Exception(
                value_to_string(value).unwrap_or_default(),
            )),
            other => match value_to_string(value) {
                Some(v) => headers.push(Header::new(other, v)),
                None => debug!(header = other, "skipping header with unsupported value type"),
            },
        }
    }

    headers
}

/// Renders the envelope as publish properties.
///
/// AMQP header tables are keyed maps: envelope headers are written in order,
/// so a later header replaces an earlier one with the same key, and the wire
/// order is the table's key order rather than the envelope's.
pub fn properties_from_envelope(env: &Envelope) -> BasicProperties {
    let mut table = FieldTable::default();
    if !env.contract.namespace.is_empty() {
        table.insert(
            ShortString::from(HEADER_CONTRACT_NAMESPACE),
            AMQPValue::LongString(LongString::from(env.contract.namespace.as_str())),
        );
    }
    for header in &env.headers {
        let (key, value) = header_to_amqp(header);
        if table.contains_key(key) {
            debug!(header = key, "duplicate header key, keeping the last value");
        }
        table.insert(ShortString::from(key), value);
    }

    let message_id = env
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut props = BasicProperties::default()
        .with_kind(ShortString::from(env.contract.name.as_str()))
        .with_message_id(ShortString::from(message_id))
        .with_headers(table);

    if let Some(ct) = &env.content_type {
        props = props.with_content_type(ShortString::from(ct.as_str()));
    }
    if let Some(id) = &env.correlation_id {
        props = props.with_correlation_id(ShortString::from(id.as_str()));
    }
    if let Some(reply_to) = &env.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(bus_id) = &env.bus_id {
        props = props.with_app_id(ShortString::from(bus_id.as_str()));
    }
    if let Some(secs) = env
        .sent
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
    {
        props = props.with_timestamp(secs);
    }

    props
}

fn header_to_amqp(header: &Header) -> (&str, AMQPValue) {
    let value = match header {
        Header::DeadLetter(entries) => AMQPValue::FieldArray(FieldArray::from(
            entries
                .iter()
                .map(|e| {
                    let mut t = FieldTable::default();
                    t.insert("reason".into(), long_string(&e.reason));
                    t.insert("queue".into(), long_string(&e.queue));
                    t.insert("exchange".into(), long_string(&e.exchange));
                    t.insert("count".into(), AMQPValue::LongLongInt(e.count));
                    if let Some(time) = e.time {
                        t.insert("time".into(), AMQPValue::Timestamp(time));
                    }
                    t.insert(
                        "routing-keys".into(),
                        AMQPValue::FieldArray(FieldArray::from(
                            e.routing_keys.iter().map(|k| long_string(k)).collect::<Vec<_>>(),
                        )),
                    );
                    AMQPValue::FieldTable(t)
                })
                .collect::<Vec<_>>(),
        )),
        Header::ReceivedFrom(entries) => AMQPValue::FieldArray(FieldArray::from(
            entries
                .iter()
                .map(|e| {
                    let mut t = FieldTable::default();
                    t.insert("uri".into(), long_string(&e.uri));
                    t.insert("exchange".into(), long_string(&e.exchange));
                    t.insert("redelivered".into(), AMQPValue::Boolean(e.redelivered));
                    t.insert("cluster-name".into(), long_string(&e.cluster_name));
                    AMQPValue::FieldTable(t)
                })
                .collect::<Vec<_>>(),
        )),
        Header::Rejected => AMQPValue::Boolean(true),
        Header::Exception(msg) => long_string(msg),
        Header::Generic { value, .. } => long_string(value),
    };

    (header.key(), value)
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

fn tables_of(value: &AMQPValue) -> impl Iterator<Item = &FieldTable> {
    let items: &[AMQPValue] = match value {
        AMQPValue::FieldArray(arr) => arr.as_slice(),
        _ => &[],
    };
    items.iter().filter_map(|v| match v {
        AMQPValue::FieldTable(t) => Some(t),
        _ => None,
    })
}

fn field(table: &FieldTable, key: &str) -> String {
    table
        .inner()
        .get(key)
        .and_then(value_to_string)
        .unwrap_or_default()
}

fn dead_letter_info(table: &FieldTable) -> DeadLetterInfo {
    let inner = table.inner();
    DeadLetterInfo {
        reason: field(table, "reason"),
        queue: field(table, "queue"),
        exchange: field(table, "exchange"),
        time: match inner.get("time") {
            Some(AMQPValue::Timestamp(t)) => Some(*t),
            _ => None,
        },
        routing_keys: match inner.get("routing-keys") {
            Some(AMQPValue::FieldArray(arr)) => {
                arr.as_slice().iter().filter_map(value_to_string).collect()
            }
            _ => Vec::new(),
        },
        count: match inner.get("count") {
            Some(AMQPValue::LongLongInt(c)) => *c,
            Some(AMQPValue::LongInt(c)) => i64::from(*c),
            _ => 0,
        },
    }
}

fn received_from_info(table: &FieldTable) -> ReceivedFromInfo {
    ReceivedFromInfo {
        uri: field(table, "uri"),
        exchange: field(table, "exchange"),
        redelivered: matches!(
            table.inner().get("redelivered"),
            Some(AMQPValue::Boolean(true))
        ),
        cluster_name: field(table, "cluster-name"),
    }
}

fn value_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::Float(v) => Some(v.to_string()),
        AMQPValue::Double(v) => Some(v.to_string()),
        AMQPValue::Timestamp(v) => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn death_table() -> FieldTable {
        let mut entry = FieldTable::default();
        entry.insert("reason".into(), long_string("rejected"));
        entry.insert("queue".into(), long_string("orders"));
        entry.insert("exchange".into(), long_string("orders.x"));
        entry.insert("count".into(), AMQPValue::LongLongInt(3));
        entry.insert("time".into(), AMQPValue::Timestamp(1_700_000_000));
        entry.insert(
            "routing-keys".into(),
            AMQPValue::FieldArray(FieldArray::from(vec![long_string("orders.created")])),
        );

        let mut table = FieldTable::default();
        table.insert(
            HEADER_DEAD_LETTER.into(),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(entry)])),
        );
        table.insert("retries".into(), AMQPValue::LongInt(2));
        table.insert(HEADER_REJECTED.into(), AMQPValue::Boolean(true));
        table
    }

    #[test]
    fn test_well_known_headers_are_recognized() {
        let headers = headers_from_table(&death_table());

        assert!(headers.contains(&Header::DeadLetter(vec![DeadLetterInfo {
            reason: "rejected".to_owned(),
            queue: "orders".to_owned(),
            exchange: "orders.x".to_owned(),
            time: Some(1_700_000_000),
            routing_keys: vec!["orders.created".to_owned()],
            count: 3,
        }])));
        assert!(headers.contains(&Header::Rejected));
        assert!(headers.contains(&Header::new("retries", "2")));
    }

    #[test]
    fn test_repeated_header_key_keeps_last_value() {
        let env = Envelope::new(ContractKey::new("Foo", "ns"), vec![])
            .with_header(Header::new("tenant", "acme"))
            .with_header(Header::new("tenant", "globex"));

        let props = properties_from_envelope(&env);
        let headers = headers_from_table(&props.headers().clone().unwrap_or_default());

        assert_eq!(
            headers
                .iter()
                .filter(|h| matches!(h, Header::Generic { .. }))
                .collect::<Vec<_>>(),
            vec![&Header::new("tenant", "globex")]
        );
    }

    #[test]
    fn test_envelope_metadata_survives_the_wire() {
        let env = Envelope::new(ContractKey::new("Foo", "ns"), b"boo".to_vec())
            .with_correlation_id("c-7")
            .with_reply_to("amq.rabbitmq.reply-to")
            .with_content_type("application/json")
            .with_bus_id("bus-1")
            .with_header(Header::Exception("failed".to_owned()))
            .with_header(Header::new("tenant", "acme"));

        let props = properties_from_envelope(&env);
        let decoded = envelope_from_properties(&props, env.data.clone());

        assert_eq!(decoded.contract, ContractKey::new("Foo", "ns"));
        assert_eq!(decoded.correlation_id.as_deref(), Some("c-7"));
        assert_eq!(decoded.reply_to.as_deref(), Some("amq.rabbitmq.reply-to"));
        assert_eq!(decoded.bus_id.as_deref(), Some("bus-1"));
        assert_eq!(decoded.exception(), Some("failed"));
        assert!(decoded.message_id.is_some());
        assert!(decoded.sent.is_some());
        // the namespace rides in a header but is not exposed as one
        assert_eq!(decoded.headers.len(), 2);
    }
}
