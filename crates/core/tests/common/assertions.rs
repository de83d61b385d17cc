//! Assertion helpers for resource records.

use gp_protocol::{ErrorCode, ResourceRecord, ResourceStatus};

/// Assert a finished record with one log entry per step, all successful.
#[allow(dead_code)]
pub fn assert_finished(record: &ResourceRecord, steps: usize) {
    assert_eq!(
        record.status,
        ResourceStatus::Finished,
        "Expected finished record, got: {record:#?}"
    );
    assert_eq!(record.process_log.len(), steps);
    assert_eq!(record.progress.step, steps);
    assert_eq!(record.progress.num_of_steps, steps);
    assert!(record.process_log.iter().all(|e| e.return_code == Some(0)));
    assert!(record.exception.is_none());
    assert!(record.finished_at.is_some());
}

/// Assert an error record carrying `code`.
#[allow(dead_code)]
pub fn assert_failed_with(record: &ResourceRecord, code: ErrorCode) {
    assert_eq!(
        record.status,
        ResourceStatus::Error,
        "Expected error record, got: {record:#?}"
    );
    let exception = record
        .exception
        .as_ref()
        .expect("Error record without exception");
    assert_eq!(exception.code, code, "Unexpected exception: {exception:?}");
}

/// Log entry ids in order.
#[allow(dead_code)]
pub fn log_ids(record: &ResourceRecord) -> Vec<&str> {
    record.process_log.iter().map(|e| e.id.as_str()).collect()
}
