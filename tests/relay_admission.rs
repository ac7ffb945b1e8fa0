/// Relay queue admission control and drain scheduling.
use std::time::Instant;

use quakemesh::relay::{classify, Admission, PriorityClass, QueuedMessage, RelayQueue, RelayQueueConfig};

fn queue(capacity: usize) -> RelayQueue {
    RelayQueue::new(RelayQueueConfig {
        capacity,
        congestion_threshold_pct: 70,
        batch_size: 5,
    })
}

#[test]
fn test_alert_admitted_at_95_percent() {
    let mut q = queue(100);
    let now = Instant::now();
    for i in 0..95 {
        let payload = format!(r#"{{"type":"mesh_data","earthquake":{{"si":{i}}}}}"#);
        assert_eq!(q.offer(payload, now), Admission::Admitted(PriorityClass::High));
    }
    assert_eq!(q.occupancy_pct(), 95);
    assert!(q.is_congested());

    let alert = r#"{"type":"sensor_data","alert":"strong shaking"}"#.to_string();
    assert_eq!(q.offer(alert, now), Admission::Admitted(PriorityClass::High));
    assert_eq!(q.priority_len(), 96);
}

#[test]
fn test_routine_dropped_when_congested() {
    let mut q = queue(10);
    let now = Instant::now();
    for i in 0..7 {
        let msg = QueuedMessage::new(format!(r#"{{"type":"node_status","n":{i}}}"#), PriorityClass::Normal, now);
        assert!(matches!(q.admit(msg), Admission::Admitted(_)));
    }
    // 70% is still admissible, anything above is not
    assert!(!q.is_congested());
    let eighth = QueuedMessage::new(r#"{"type":"node_status"}"#.into(), PriorityClass::Status, now);
    assert_eq!(q.admit(eighth), Admission::Admitted(PriorityClass::Status));
    assert!(q.is_congested());

    let dropped = QueuedMessage::new(r#"{"type":"node_status"}"#.into(), PriorityClass::Normal, now);
    assert_eq!(q.admit(dropped), Admission::Dropped);
    assert_eq!(q.stats().dropped, 1);
    assert_eq!(q.len(), 8);
}

#[test]
fn test_priority_drains_before_normal_batches() {
    let mut q = queue(100);
    let now = Instant::now();
    for i in 0..7 {
        q.offer(format!(r#"{{"type":"heartbeat","seq":{i}}}"#), now);
        if i % 3 == 0 {
            q.offer(format!(r#"{{"type":"mesh_data","earthquake":true,"seq":{i}}}"#), now);
        }
    }
    assert_eq!(q.priority_len(), 3);
    assert_eq!(q.normal_len(), 7);

    let first = q.drain_pass();
    let classes: Vec<PriorityClass> = first.iter().map(|m| m.priority).collect();
    assert_eq!(
        classes,
        vec![
            PriorityClass::High,
            PriorityClass::High,
            PriorityClass::High,
            PriorityClass::Normal,
            PriorityClass::Normal,
            PriorityClass::Normal,
            PriorityClass::Normal,
            PriorityClass::Normal,
        ]
    );
    assert!(first[3].payload.contains(r#""seq":0"#));

    let second = q.drain_pass();
    assert_eq!(second.len(), 2);
    assert!(q.is_empty());
    assert_eq!(q.stats().forwarded, 10);
}

#[test]
fn test_classification_markers() {
    assert_eq!(classify(r#"{"type":"sensor_data","earthquake":{"si":3}}"#), PriorityClass::High);
    assert_eq!(classify(r#"{"emergency":1}"#), PriorityClass::High);
    assert_eq!(classify(r#"{"pga":12}"#), PriorityClass::High);
    assert_eq!(classify(r#"{"type":"heartbeat_response"}"#), PriorityClass::Normal);
}
