//! Integration tests for telemetry initialization and span helpers.

use watcher_base::model::Change;
use watcher_base::telemetry::change::{Outcome, record_outcome, start_change_span};
use watcher_base::telemetry::{TelemetryConfig, init_telemetry};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so a second
    // init in the same binary reports an error instead of panicking.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "watcher-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = init_telemetry(config);

    let again = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "watcher-test".to_string(),
        log_level: "info".to_string(),
    });
    assert!(again.is_err());
}

#[test]
fn change_span_records_each_outcome() {
    for outcome in [Outcome::Succeeded, Outcome::Requeued, Outcome::Dropped] {
        let span = start_change_span(&Change::update("a"), 0, 2);
        record_outcome(&span, outcome);
    }
}

#[test]
fn outcome_names() {
    assert_eq!(Outcome::Succeeded.as_str(), "succeeded");
    assert_eq!(Outcome::Requeued.as_str(), "requeued");
    assert_eq!(Outcome::Dropped.as_str(), "dropped");
}
