//! Integration tests for the broker client.
//!
//! Scenarios run a real `BrokerClient` against an in-memory broker:
//!
//! - `harness.rs`   - MockBroker and client helpers
//! - `delivery.rs`  - healthy link, ordering and admission rules
//! - `reconnect.rs` - connection cut before and during a burst
//! - `timeout.rs`   - broker stops confirming for a while
//! - `latency.rs`   - slow confirms with jitter
//! - `nack.rs`      - broker rejects and resend policy
//! - `channel.rs`   - channel-level shutdown, lost confirms and missing exchanges
//! - `config.rs`    - initialize, reconfiguration and invalid parameters

mod config;
mod delivery;
mod timeout;
