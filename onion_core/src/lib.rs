/*!
Core of the onion relay overlay.

A client builds a `Circuit` of relay nodes taken from a `NodeDirectory`,
wraps its request in one onion layer per hop and hands the onion to the first
hop. Every `RelayNode` peels its layer, forwards the rest to the next hop and
routes the response back along the reverse path.
*/

#![forbid(unsafe_code)]

#[macro_use]
extern crate log;

pub mod circuit;
pub mod client;
pub mod directory;
pub mod relay;
pub mod stats;
pub mod time;
