#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod catalog;
pub mod config;
pub mod data;

#[path = "../shared/linalg.rs"]
pub mod linalg;

#[path = "../net/mod.rs"]
pub mod net;

#[path = "../survival/mod.rs"]
pub mod survival;

#[path = "../benefit/mod.rs"]
pub mod benefit;

#[path = "../evaluate/mod.rs"]
pub mod evaluate;
