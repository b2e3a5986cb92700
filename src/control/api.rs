use crate::{BridgeError, SourceStatus, pop_log, source_statuses, with_source};

/// Apply pending server notifications on every live source, then snapshot
/// them.
pub fn get_status() -> Vec<SourceStatus> {
    for status in source_statuses() {
        with_source(status.id, |manager| manager.poll_events());
    }
    source_statuses()
}

/// Release the client of the specified source. Returns `false` for unknown
/// ids.
pub fn deactivate(source_id: u64) -> bool {
    with_source(source_id, |manager| manager.deactivate()).is_some()
}

/// Re-open the client of the specified source with its applied
/// configuration. `None` for unknown ids.
pub fn reactivate(source_id: u64) -> Option<Result<(), BridgeError>> {
    with_source(source_id, |manager| {
        manager
            .applied_config()
            .map_or(Ok(()), |config| manager.activate(config))
    })
}

/// Replace the ports feeding `slot` of the specified source. Returns the
/// ports the server rejected; `None` for unknown ids.
pub fn bind(
    source_id: u64,
    slot: usize,
    ports: &[String],
) -> Option<Result<Vec<String>, BridgeError>> {
    with_source(source_id, |manager| {
        manager.bind(slot, ports).map(|report| report.rejected)
    })
}

/// Drain the event log.
pub fn drain_log() -> Vec<String> {
    std::iter::from_fn(pop_log).collect()
}
