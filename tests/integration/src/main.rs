//! Multi-node scenario tests. Everything lives behind `cfg(test)`; the
//! binary itself is an empty shell so `cargo test` owns this crate.

#[cfg(test)]
mod helpers;

#[cfg(test)]
mod failover;
#[cfg(test)]
mod membership;
#[cfg(test)]
mod persistence;
#[cfg(test)]
mod routing;

fn main() {}
