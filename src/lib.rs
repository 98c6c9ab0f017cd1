#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
extern crate bitcoin;

pub mod error;
pub mod market;
pub mod protocol;
pub mod taker;
pub mod utill;
pub mod wallet;
pub mod watch_tower;
