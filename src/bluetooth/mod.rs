//! Bluetooth side of the printer link.
//!
//! The connection core (`manager`, `scanner`, `scheduler`) only talks to
//! the `Radio` trait; `bluez` is the production radio and `testing` the
//! scripted one used by the unit tests.

pub mod bluez;
pub mod link;
pub mod manager;
pub mod radio;
pub mod recognition;
pub mod scanner;
pub mod scheduler;

#[cfg(test)]
pub mod testing;
