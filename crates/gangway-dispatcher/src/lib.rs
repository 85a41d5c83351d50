//! gangway-dispatcher — the central hub of the deployment pipeline.
//!
//! ```text
//! CI client ──Deploy──▶ ┌────────────────────────────┐
//! CI client ◀─Status─── │  admission · persistence   │ ──Deployments──▶ agent (dev)
//!                       │  routing   · status fanout │ ──Deployments──▶ agent (prod)
//!                       └────────────────────────────┘ ◀─ReportStatus──
//! ```
//!
//! One agent stream may be registered per cluster; requests for offline
//! clusters are refused at admission so nothing is persisted for them.
//! Every inbound agent status is persisted first, then copied to all
//! subscribed clients, which filter by request ID.

pub mod fanout;
pub mod metrics;
pub mod router;
pub mod server;
pub mod spans;

pub use fanout::StatusFanout;
pub use metrics::Metrics;
pub use router::{ClusterRouter, RouterError};
pub use server::Dispatcher;
pub use spans::SpanRegistry;
