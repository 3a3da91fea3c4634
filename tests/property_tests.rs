mod common;

use chrono::Utc;
use common::strategies::*;
use proptest::prelude::*;

use huntsman_core::models::{ClientId, FlowId, FlowRequest, FlowResponse, Payload, RequestWithResponses};
use huntsman_core::orchestration::correlate;
use huntsman_core::rules::{ClientRule, IntegerOperator};

fn with_request(mut responses: Vec<FlowResponse>) -> RequestWithResponses {
    responses.sort_by_key(|r| r.response_id);
    RequestWithResponses {
        request: FlowRequest {
            client_id: ClientId::new("C.1"),
            flow_id: FlowId::new("F1"),
            request_id: 1,
            action: "ListProcesses".to_string(),
            args: Payload::empty("ListProcessesRequest"),
            next_state: "Done".to_string(),
            callback_state: Some("ReceiveProcesses".to_string()),
            next_response_id: 1,
            created_at: Utc::now(),
        },
        responses,
    }
}

fn message_ids(payloads: impl Iterator<Item = Payload>) -> Vec<u64> {
    payloads
        .map(|p| u64::from_be_bytes(p.data.as_slice().try_into().unwrap()))
        .collect()
}

proptest! {
    #[test]
    fn prop_arrival_order_does_not_change_correlation(rows in shuffled_stream_strategy()) {
        let count = rows.len() - 1;
        let responses = correlate(1, &rows).unwrap();
        prop_assert!(responses.success());
        prop_assert_eq!(responses.len(), count);

        let ordered = with_request(rows);
        prop_assert!(ordered.is_complete());
        let correlated = correlate(1, &ordered.responses).unwrap();
        let ids = message_ids(correlated.iter().cloned());
        prop_assert_eq!(ids, (1..=count as u64).collect::<Vec<_>>());
    }

    #[test]
    fn prop_any_missing_row_leaves_request_incomplete(
        rows in shuffled_stream_strategy(),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut rows = rows;
        let removed = rows.remove(pick.index(rows.len()));
        let pending = with_request(rows);
        prop_assert!(!pending.is_complete());

        // callbacks see every message up to the first gap
        let delivered = pending.undelivered_messages().len() as u64;
        prop_assert_eq!(delivered, removed.response_id - 1);
    }

    #[test]
    fn prop_not_inverts(client in client_strategy(), os in os_strategy()) {
        let rule = ClientRule::os(os);
        prop_assert_eq!(ClientRule::not(rule.clone()).matches(&client), !rule.matches(&client));
    }

    #[test]
    fn prop_and_or_follow_boolean_logic(
        client in client_strategy(),
        os in os_strategy(),
        label in label_strategy(),
    ) {
        let a = ClientRule::os(os);
        let b = ClientRule::label(label);
        let (ma, mb) = (a.matches(&client), b.matches(&client));
        prop_assert_eq!(ClientRule::and(vec![a.clone(), b.clone()]).matches(&client), ma && mb);
        prop_assert_eq!(ClientRule::or(vec![a.clone(), b.clone()]).matches(&client), ma || mb);
        // De Morgan
        prop_assert_eq!(
            ClientRule::not(ClientRule::and(vec![a.clone(), b.clone()])).matches(&client),
            ClientRule::or(vec![ClientRule::not(a), ClientRule::not(b)]).matches(&client)
        );
    }

    #[test]
    fn prop_empty_combinators(client in client_strategy()) {
        prop_assert!(ClientRule::match_all().matches(&client));
        prop_assert!(!ClientRule::or(vec![]).matches(&client));
    }

    #[test]
    fn prop_os_match_ignores_case(client in client_strategy()) {
        let os = client.os().unwrap().to_string();
        prop_assert!(ClientRule::os(os.to_uppercase()).matches(&client));
        prop_assert!(ClientRule::os(os.to_lowercase()).matches(&client));
    }

    #[test]
    fn prop_hostname_regex_matches_itself(client in client_strategy()) {
        let hostname = client.attribute("hostname").unwrap().render();
        let rule = ClientRule::regex("hostname", format!("^{}$", regex::escape(&hostname)));
        prop_assert!(rule.matches(&client));
        prop_assert!(!ClientRule::regex("missing", ".*").matches(&client));
    }

    #[test]
    fn prop_integer_compare(actual in -1000i64..1000, expected in -1000i64..1000) {
        let client = huntsman_core::models::ClientInfo::new("C.1").with_attribute("uptime", actual);
        let check = |operator| ClientRule::integer("uptime", operator, expected).matches(&client);
        prop_assert_eq!(check(IntegerOperator::LessThan), actual < expected);
        prop_assert_eq!(check(IntegerOperator::GreaterThan), actual > expected);
        prop_assert_eq!(check(IntegerOperator::Equal), actual == expected);
    }
}
