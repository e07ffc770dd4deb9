//! Session bus filtering: the rule set and the proxy that enforces it.

pub mod proxy;
pub mod rules;

pub use proxy::{bus_flags, launch_proxy, proxy_args, wait_for_socket};
pub use rules::{BusFlags, BusOp, BusRule, build_rules};
