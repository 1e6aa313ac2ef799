//! Metric names recorded by the server through the `metrics` facade.
//!
//! Nothing is exported unless the process installs a recorder.

/// Connections accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "linkup_connections_total";
/// Live connections, signed in or not (gauge).
pub const CONNECTIONS_ACTIVE: &str = "linkup_connections_active";
/// Sign-in and restore attempts (counter, labels: outcome).
pub const SIGN_INS_TOTAL: &str = "linkup_sign_ins_total";
/// Connections evicted by a newer owner of the same id (counter).
pub const TAKEOVERS_TOTAL: &str = "linkup_takeovers_total";
/// Application packets routed (counter, labels: route).
pub const PACKETS_ROUTED_TOTAL: &str = "linkup_packets_routed_total";
/// Connections closed (counter, labels: reason).
pub const DISCONNECTIONS_TOTAL: &str = "linkup_disconnections_total";
