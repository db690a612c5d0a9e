//! Multi-node integration flows.

#[cfg(test)]
mod support;

#[cfg(test)]
mod mesh_flows;

#[cfg(test)]
mod tcp_loopback;
