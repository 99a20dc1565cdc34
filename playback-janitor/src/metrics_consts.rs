pub const RUN_STARTS: &str = "playback_janitor_run_starts_total";
pub const RUN_ENDS: &str = "playback_janitor_run_ends_total";
pub const RUN_TIME: &str = "playback_janitor_run_duration_seconds";
pub const SWEPT_COUNT: &str = "playback_janitor_rows_swept_total";
pub const SWEEP_ERRORS: &str = "playback_janitor_sweep_errors_total";
