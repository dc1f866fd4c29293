//! MWPLU chat client.
//!
//! One dependency for embedders: `config` loads the webhook and polling
//! settings, `core` runs turns through [`core::TurnReconciler`] against a
//! [`core::ChatSession`], and `protocol` holds the messages and events a UI
//! renders.

pub use mwplu_chat_config as config;
pub use mwplu_chat_core as core;
pub use mwplu_chat_protocol as protocol;

/// Route `log` output to stderr, honouring `RUST_LOG`.
///
/// Safe to call more than once. Does nothing without the `logging` feature.
pub fn init_logging() {
    #[cfg(feature = "logging")]
    {
        let _ = env_logger::builder()
            .format_timestamp_millis()
            .parse_default_env()
            .try_init();
    }
}
