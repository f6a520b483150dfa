//! Broker for a small fleet of VDV-300/IBIS passenger-information displays.
//!
//! See the module docs for the three tightly-coupled subsystems: the wire
//! protocol encoder (`charset`, `telegram`, `serial`), the broker
//! (`controller`, `persistence`), and the request dispatcher (`datagram`,
//! `dispatcher`).

pub mod addrmap;
pub mod charset;
pub mod controller;
pub mod datagram;
pub mod dispatcher;
pub mod error;
pub mod gpio;
pub mod model;
pub mod persistence;
pub mod serial;
pub mod telegram;
