//! mysql-relay
//!
//! Protocol-aware TCP reverse proxy for the MySQL wire protocol.
//!
//! The relay accepts client connections on a bound address, picks a backend
//! server from a configured destination set (round-robin for read-only
//! routes, failover-ordered for read-write routes), and splices bytes
//! between the two sockets until either side closes. While the connection
//! handshake is in flight it validates packet framing, counts handshake
//! failures per source address, and blocks sources that fail too often. An
//! optional out-of-band access-control service can veto new connections and
//! revoke established ones.

pub mod config;
pub mod proxy;

pub use config::{parse_config, ConfigError, ConfigSection, RoutingConfig};
pub use proxy::{
    AbacClient, AbacConfig, AccessMode, BlockTable, DestinationSet, Router, RouterError,
    SessionRegistry, SourceKey, TcpEndpoint,
};
