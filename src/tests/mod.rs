
mod determinism_tests;
mod event_tests;
