// Jobs module - Scheduled housekeeping

pub mod challenge_cleanup;
