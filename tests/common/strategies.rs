//! Proptest strategies for response streams and client descriptions.

#![allow(dead_code)]

use proptest::prelude::*;

use huntsman_core::models::{ClientId, ClientInfo, FlowId, FlowResponse, Payload, Status};

/// Message count of a response stream
pub fn message_count_strategy() -> impl Strategy<Value = usize> {
    0usize..12
}

/// A complete response stream for request 1 in a random arrival order
pub fn shuffled_stream_strategy() -> impl Strategy<Value = Vec<FlowResponse>> {
    message_count_strategy()
        .prop_flat_map(|count| Just(stream(count)).prop_shuffle())
}

pub fn stream(count: usize) -> Vec<FlowResponse> {
    let client = ClientId::new("C.1");
    let flow = FlowId::new("F1");
    let mut rows: Vec<FlowResponse> = (1..=count as u64)
        .map(|id| {
            FlowResponse::message(
                client.clone(),
                flow.clone(),
                1,
                id,
                Payload::new("Message", id.to_be_bytes().to_vec()),
            )
        })
        .collect();
    rows.push(FlowResponse::status(client, flow, 1, count as u64 + 1, Status::ok()));
    rows
}

pub fn os_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Linux".to_string()),
        Just("Windows".to_string()),
        Just("Darwin".to_string()),
    ]
}

pub fn label_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,8}"
}

pub fn client_strategy() -> impl Strategy<Value = ClientInfo> {
    (
        os_strategy(),
        prop::collection::btree_set(label_strategy(), 0..4),
        "[a-z0-9-]{1,16}",
    )
        .prop_map(|(os, labels, hostname)| {
            let mut client = ClientInfo::new("C.1")
                .with_os(&os)
                .with_attribute("hostname", hostname.as_str());
            for label in labels {
                client = client.with_label(label);
            }
            client
        })
}
