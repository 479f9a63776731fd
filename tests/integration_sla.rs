use anyhow::Result;
use stats_aggregator::{
    Benchmark, Failure, PhaseDef, SlaRule, Snapshot, StatisticsStore, StoreConfig,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const METRIC: &str = "request";

/// Store whose live callback collects failure messages
fn store_with_rule(
    rule: SlaRule,
    config: StoreConfig,
) -> Result<(StatisticsStore, Arc<Mutex<Vec<String>>>)> {
    let benchmark = Benchmark::new("sla")
        .with_collection_period(Duration::from_secs(1))
        .with_phase(PhaseDef::new(0, "steady").with_sla(METRIC, rule));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let store = StatisticsStore::with_config(benchmark, config, move |failure: &Failure| {
        sink.lock().unwrap().push(failure.message().to_owned());
    })?;
    Ok((store, seen))
}

fn interval(sample_id: u32, requests: u64, invalid: u64, latency: Duration) -> Snapshot {
    let start = 1_000 * u64::from(sample_id);
    let mut snapshot = Snapshot::for_interval(sample_id, start, start + 1_000);
    for _ in 0..requests {
        snapshot.record_request();
        snapshot.record_response(latency);
    }
    snapshot.invalid = invalid;
    snapshot
}

/// A phase-total rule is only evaluated when the phase completes.
#[test]
fn total_rule_fails_only_at_completion() -> Result<()> {
    let rule = SlaRule::phase_total().error_ratio(0.01).invalid_ratio(0.01);
    let (mut store, seen) = store_with_rule(rule, StoreConfig::default())?;

    // 1000 requests and 20 invalid responses spread over ten intervals
    for id in 0..10 {
        store.record("a1", 0, 0, METRIC, interval(id, 100, 2, Duration::from_millis(1)))?;
        assert!(seen.lock().unwrap().is_empty());
        assert!(store.validate_slas());
    }

    store.complete_phase("steady");
    let failures = store.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].message(),
        "Invalid response ratio exceeded: required 0.010, actual 0.020"
    );
    assert_eq!(failures[0].statistics().request_count, 1000);
    assert_eq!(seen.lock().unwrap().len(), 1);

    let total = store.total_summary();
    assert_eq!(total[0].failed_slas, vec![failures[0].message().to_owned()]);
    Ok(())
}

/// A windowed rule stays silent until its window has been filled once.
#[test]
fn windowed_rule_waits_for_full_window() -> Result<()> {
    let rule = SlaRule::windowed(Duration::from_secs(5)).mean_response_time(Duration::from_millis(10));
    let config = StoreConfig {
        merge_delay: 2,
        ..StoreConfig::default()
    };
    let (mut store, seen) = store_with_rule(rule, config)?;

    // ids 0..=4 are finalized by the report of id 6
    for id in 0..=5 {
        store.record("a1", 0, 0, METRIC, interval(id, 10, 0, Duration::from_millis(50)))?;
    }
    assert_eq!(store.series("steady", 0, METRIC).map(<[_]>::len), Some(4));
    assert!(seen.lock().unwrap().is_empty());

    store.record("a1", 0, 0, METRIC, interval(6, 10, 0, Duration::from_millis(50)))?;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("Mean response time exceeded"));
    assert_eq!(store.failures()[0].statistics().request_count, 50);
    Ok(())
}

/// A window that recovers stops producing failures once the bad samples are evicted.
#[test]
fn windowed_rule_recovers_after_eviction() -> Result<()> {
    let rule = SlaRule::windowed(Duration::from_secs(2)).error_ratio(0.1);
    let config = StoreConfig {
        merge_delay: 0,
        ..StoreConfig::default()
    };
    let (mut store, _) = store_with_rule(rule, config)?;

    let mut bad = interval(0, 10, 0, Duration::from_millis(1));
    bad.connection_errors = 5;
    store.record("a1", 0, 0, METRIC, bad)?;
    store.record("a1", 0, 0, METRIC, interval(1, 10, 0, Duration::from_millis(1)))?;
    assert_eq!(store.failures().len(), 1);

    for id in 2..6 {
        store.record("a1", 0, 0, METRIC, interval(id, 10, 0, Duration::from_millis(1)))?;
    }
    assert_eq!(store.failures().len(), 1);
    Ok(())
}

/// Idle ticks evict bad samples from a window just like busy ones.
#[test]
fn windowed_rule_slides_over_idle_samples() -> Result<()> {
    let rule = SlaRule::windowed(Duration::from_secs(2)).error_ratio(0.1);
    let config = StoreConfig {
        merge_delay: 0,
        ..StoreConfig::default()
    };
    let (mut store, seen) = store_with_rule(rule, config)?;

    let mut bad = interval(0, 10, 0, Duration::from_millis(1));
    bad.connection_errors = 5;
    store.record("a1", 0, 0, METRIC, bad)?;
    store.record("a1", 0, 0, METRIC, interval(1, 0, 0, Duration::ZERO))?;
    // window over ids 0..=1
    assert_eq!(seen.lock().unwrap().len(), 1);

    store.record("a1", 0, 0, METRIC, interval(2, 0, 0, Duration::ZERO))?;
    store.record("a1", 0, 0, METRIC, interval(3, 10, 0, Duration::from_millis(1)))?;
    assert_eq!(seen.lock().unwrap().len(), 1);

    let failures = store.failures();
    assert_eq!(failures[0].statistics().start_time(), Some(0));
    assert_eq!(failures[0].statistics().end_time(), Some(2_000));
    assert_eq!(store.series("steady", 0, METRIC).map(<[_]>::len), Some(2));
    Ok(())
}

/// Sample ids without any report count toward filling a window.
#[test]
fn idle_samples_fill_the_window() -> Result<()> {
    let rule = SlaRule::windowed(Duration::from_secs(3)).mean_response_time(Duration::from_millis(10));
    let config = StoreConfig {
        merge_delay: 0,
        ..StoreConfig::default()
    };
    let (mut store, seen) = store_with_rule(rule, config)?;

    store.record("a1", 0, 0, METRIC, interval(0, 5, 0, Duration::from_millis(50)))?;
    assert!(seen.lock().unwrap().is_empty());

    // ids 1 and 2 were never reported
    store.record("a1", 0, 0, METRIC, interval(3, 5, 0, Duration::from_millis(1)))?;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("Mean response time exceeded"));
    assert_eq!(store.failures()[0].statistics().request_count, 5);
    Ok(())
}

/// Only the first failures are retained; all of them reach the callback.
#[test]
fn failure_list_is_capped_but_callback_sees_all() -> Result<()> {
    let rule = SlaRule::windowed(Duration::from_secs(1)).mean_response_time(Duration::from_millis(1));
    let config = StoreConfig {
        merge_delay: 0,
        max_failures: 100,
        ..StoreConfig::default()
    };
    let (mut store, seen) = store_with_rule(rule, config)?;

    for id in 0..150 {
        store.record("a1", 0, 0, METRIC, interval(id, 1, 0, Duration::from_millis(20)))?;
    }

    assert_eq!(store.failures().len(), 100);
    assert_eq!(seen.lock().unwrap().len(), 150);
    assert!(!store.validate_slas());
    Ok(())
}

/// Step statistics use the rules provided by the step, not the phase's.
#[test]
fn step_rules_apply_to_step_statistics() -> Result<()> {
    let benchmark = Benchmark::new("steps")
        .with_phase(PhaseDef::new(0, "steady").with_sla(
            METRIC,
            SlaRule::phase_total().mean_response_time(Duration::from_secs(10)),
        ))
        .with_step_sla(
            4,
            SlaRule::phase_total().mean_response_time(Duration::from_millis(1)),
        );
    let mut store = StatisticsStore::new(benchmark, |_| {})?;

    store.record("a1", 0, 0, METRIC, interval(0, 5, 0, Duration::from_millis(5)))?;
    store.record("a1", 0, 4, METRIC, interval(0, 5, 0, Duration::from_millis(5)))?;
    store.complete_phase("steady");

    assert_eq!(store.failures().len(), 1);
    let summaries = store.total_summary();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].step_id, 0);
    assert_eq!(summaries[1].step_id, 4);
    Ok(())
}

/// SLA rules loaded from JSON behave like the ones built in code.
#[test]
fn rules_from_json_definition() -> Result<()> {
    let benchmark = Benchmark::from_json_str(
        r#"{
            "name": "json",
            "statistics_collection_period": "1s",
            "phases": [ { "id": 0, "name": "steady", "custom_slas": {
                "request": [ { "checks": [
                    { "check": "percentile", "percentile": 0.99, "max": "2ms" } ] } ] } } ]
        }"#,
    )?;
    let mut store = StatisticsStore::new(benchmark, |_| {})?;
    store.record("a1", 0, 0, METRIC, interval(0, 100, 0, Duration::from_millis(3)))?;
    store.complete_phase("steady");

    assert_eq!(store.failures().len(), 1);
    assert!(store.failures()[0]
        .message()
        .starts_with("Response time at percentile 0.99 exceeded"));
    Ok(())
}
