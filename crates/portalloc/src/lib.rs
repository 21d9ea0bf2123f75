//! Conflict-free port allocation for Waypoint services.
//!
//! Ports are drawn from named ranges so that each class of service
//! (databases, caches, APIs, RPC endpoints, metrics exporters) lands in a
//! predictable, firewall-friendly interval. Anything without a class falls
//! into the default catch-all range.
//!
//! Allocation is first-fit lowest-available and deterministic. Exhausting a
//! range is an ordinary [`common::Error::PortRangeExhausted`] error.
//!
//! # Example
//!
//! ```
//! use portalloc::{PortAllocator, PortAllocatorConfig};
//!
//! let allocator = PortAllocator::new(PortAllocatorConfig::default());
//! let port = allocator.allocate("billing-api", Some("api")).unwrap();
//! assert_eq!(port, 8081);
//!
//! allocator.release(port);
//! assert!(allocator.is_port_available(port));
//! ```

pub mod allocator;
pub mod types;

pub use allocator::{PortAllocator, PortLease, classify};
pub use types::{DEFAULT_RANGE, PortAllocation, PortAllocatorConfig, PortRange};
