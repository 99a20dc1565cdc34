pub const RECORDS_RECEIVED: &str = "playback_records_received_total";
pub const RECORDS_REJECTED: &str = "playback_records_rejected_total";
pub const EVENTS_STORED: &str = "playback_events_stored_total";
pub const RECORDS_DEAD_LETTERED: &str = "playback_records_dead_lettered_total";
pub const STORE_ERRORS: &str = "playback_store_errors_total";
pub const STREAM_ERRORS: &str = "playback_stream_errors_total";

pub const BATCH_SIZE: &str = "playback_batch_size";
pub const BATCH_ROUNDS: &str = "playback_batch_rounds";
pub const BISECTION_DEPTH: &str = "playback_bisection_depth";
pub const STORE_PUT_LATENCY: &str = "playback_store_put_duration_seconds";
pub const BATCH_RESOLUTION_LATENCY: &str = "playback_batch_resolution_duration_seconds";

pub const COMMITTED_OFFSET: &str = "playback_committed_offset";
