//! Pontoon relay bridging client.
//!
//! Widgets embedded in the host CRM cannot reach external services
//! directly; a relay brokers their calls over batched, polled HTTP
//! exchanges. This crate is the client half of that protocol: session
//! key lifecycle, call queues, the batch engine with retry and
//! recovery, and an observable connection state for UI surfaces.
//!
//! ```no_run
//! use pontoon_client::{HostCall, RelayClient, RelayConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> pontoon_client::RelayResult<()> {
//! let client = RelayClient::new(RelayConfig::new("https://relay.example.com/bridge")?)?;
//! client.set_key(Some("session-key-from-operator")).await?;
//! let record = client
//!     .execute_or_fallback(
//!         HostCall::new("crm.record.get", json!({"id": 42})),
//!         || async { Ok(json!(null)) },
//!     )
//!     .await?;
//! # let _ = record;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod state;
pub mod store;
pub mod transport;

pub use client::{HostCall, RelayClient};
pub use config::{RelayConfig, DEFAULT_POLL_INTERVAL};
pub use error::{RelayError, RelayResult};
pub use state::RelayState;
