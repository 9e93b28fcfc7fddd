//! Property-based tests for connection composition.
//!
//! Uses proptest to verify invariants across random descriptors:
//! - A literal URI short-circuits composition
//! - Cluster hosts keep input order without trailing separators
//! - The first configured database wins
//! - Validation is synchronous and classifies missing fields

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use pipconnect::config::ConfigParams;
use pipconnect::{BackendKind, ConnectionComposer, ConnectionDescriptor, CredentialDescriptor};
use pipconnect::ErrorCode;
use proptest::prelude::*;
use test_case::test_case;

fn host_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,10}"
}

fn cluster_strategy() -> impl Strategy<Value = Vec<(String, Option<u16>)>> {
    prop::collection::vec((host_strategy(), prop::option::of(1_u16..65535)), 1..6)
}

proptest! {
    /// Property: a literal URI is returned as-is whatever else is set.
    #[test]
    fn prop_literal_uri_short_circuits(
        host in host_strategy(),
        port in 1_u16..65535,
        db in "[a-z]{1,8}",
    ) {
        let uri = format!("mongodb://{host}:{port}/{db}");
        let connections = vec![
            ConnectionDescriptor::new()
                .with_uri(uri.clone())
                .with_host("ignored")
                .with_port(1),
        ];
        let credential = CredentialDescriptor::new().with_username("u").with_password("p");
        let composed = ConnectionComposer::for_backend(BackendKind::MongoDb)
            .compose(&connections, Some(&credential))
            .unwrap();
        prop_assert_eq!(composed.uri(), uri.as_str());
        prop_assert_eq!(composed.database(), Some(db.as_str()));
    }

    /// Property: Couchbase cluster URIs list hosts in input order.
    #[test]
    fn prop_cluster_keeps_order(cluster in cluster_strategy()) {
        let mut connections: Vec<ConnectionDescriptor> = cluster
            .iter()
            .map(|(host, port)| {
                let descriptor = ConnectionDescriptor::new().with_host(host.clone());
                match port {
                    Some(port) => descriptor.with_port(*port),
                    None => descriptor,
                }
            })
            .collect();
        connections[0] = connections[0].clone().with("bucket", "b1");

        let composed = ConnectionComposer::for_backend(BackendKind::Couchbase)
            .compose(&connections, None)
            .unwrap();
        let expected: Vec<String> = cluster
            .iter()
            .map(|(host, port)| port.map_or_else(|| host.clone(), |p| format!("{host}:{p}")))
            .collect();
        prop_assert_eq!(composed.uri(), format!("couchbase://{}/b1", expected.join(",")));
        prop_assert!(!composed.uri().contains(",/"));
        prop_assert!(!composed.uri().contains(",,"));
    }

    /// Property: the first descriptor carrying a database wins.
    #[test]
    fn prop_first_database_wins(
        cluster in cluster_strategy(),
        dbs in prop::collection::vec(prop::option::of("[a-z]{1,6}"), 1..6),
    ) {
        let connections: Vec<ConnectionDescriptor> = cluster
            .iter()
            .zip(dbs.iter().chain(std::iter::repeat(&None)))
            .map(|((host, _), db)| {
                let descriptor = ConnectionDescriptor::new().with_host(host.clone()).with_port(8091);
                match db {
                    Some(db) => descriptor.with("bucket", db.clone()),
                    None => descriptor,
                }
            })
            .collect();
        let expected = dbs.iter().take(cluster.len()).flatten().next().cloned();

        let result = ConnectionComposer::for_backend(BackendKind::Couchbase)
            .compose(&connections, None);
        match expected {
            Some(db) => {
                let composed = result.unwrap();
                prop_assert_eq!(composed.database(), Some(db.as_str()));
            }
            None => prop_assert_eq!(result.unwrap_err().code(), ErrorCode::NoDatabase),
        }
    }

    /// Property: passwords never appear in the redacted URI.
    #[test]
    fn prop_redacted_uri_hides_password(password in "[a-zA-Z0-9]{8,16}") {
        let connections = vec![
            ConnectionDescriptor::new().with_host("h").with_port(1433).with_database("db"),
        ];
        let credential = CredentialDescriptor::new().with_username("sa").with_password(password.clone());
        let composed = ConnectionComposer::for_backend(BackendKind::SqlServer)
            .compose(&connections, Some(&credential))
            .unwrap();
        prop_assert!(composed.uri().contains(&password));
        prop_assert!(!composed.redacted_uri().contains(&password));
        let debugged = format!("{composed:?}");
        prop_assert!(!debugged.contains(&password));
    }
}

#[test_case(BackendKind::MongoDb, &[], ErrorCode::NoConnection; "mongodb empty")]
#[test_case(BackendKind::MongoDb, &[("connection.port", "27017"), ("connection.database", "d")], ErrorCode::NoHost; "mongodb no host")]
#[test_case(BackendKind::MongoDb, &[("connection.host", "h"), ("connection.database", "d")], ErrorCode::NoPort; "mongodb no port")]
#[test_case(BackendKind::SqlServer, &[("connection.host", "h"), ("connection.port", "1433")], ErrorCode::NoDatabase; "sqlserver no database")]
#[test_case(BackendKind::Couchbase, &[("connection.host", "h"), ("connection.port", "8091")], ErrorCode::NoDatabase; "couchbase no bucket")]
#[test_case(BackendKind::Mqtt, &[("connection.host", "h"), ("connection.protocol", " ")], ErrorCode::NoProtocol; "mqtt blank protocol")]
#[test_case(BackendKind::Mqtt, &[("connection.host", "h"), ("connection.protocol", "amqp")], ErrorCode::UnsupportedProtocol; "mqtt unsupported protocol")]
fn test_validation_errors(kind: BackendKind, pairs: &[(&str, &str)], expected: ErrorCode) {
    let err = ConnectionComposer::for_backend(kind)
        .resolve(&ConfigParams::from_tuples(pairs))
        .unwrap_err();
    assert_eq!(err.code(), expected);
}

#[test_case(BackendKind::Mqtt, &[("connection.host", "broker")], "mqtt://broker:1883"; "mqtt default port")]
#[test_case(BackendKind::Mqtt, &[("connection.host", "broker"), ("connection.port", "8883"), ("connection.protocol", "mqtts")], "mqtts://broker:8883"; "mqtts override")]
#[test_case(BackendKind::Http, &[("connection.protocol", "https"), ("connection.host", "api"), ("connection.port", "8443")], "https://api:8443"; "https endpoint")]
fn test_single_host_uris(kind: BackendKind, pairs: &[(&str, &str)], expected: &str) {
    let composed = ConnectionComposer::for_backend(kind)
        .resolve(&ConfigParams::from_tuples(pairs))
        .unwrap();
    assert_eq!(composed.uri(), expected);
}

#[test]
fn test_indexed_connections_from_config() {
    let config = ConfigParams::from_tuples(&[
        ("connections.0.host", "h1"),
        ("connections.0.port", "8091"),
        ("connections.1.host", "h2"),
        ("connections.1.bucket", "test"),
    ]);
    let composed = ConnectionComposer::for_backend(BackendKind::Couchbase)
        .resolve(&config)
        .unwrap();
    assert_eq!(composed.uri(), "couchbase://h1:8091,h2/test");
}
