pub mod balancer;
pub mod client;
pub mod resolver;
pub mod xclient;

pub use balancer::*;
pub use client::*;
pub use resolver::*;
pub use xclient::*;
