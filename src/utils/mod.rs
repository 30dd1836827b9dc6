//! Process-level helpers for the binary

pub mod signal;
pub mod terminal;

pub use signal::wait_for_shutdown;
pub use terminal::prompt_passphrase;

// vim: ts=4
