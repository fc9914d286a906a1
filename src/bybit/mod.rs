pub mod rest;
pub mod ws;

pub use rest::{BybitRestClient, KlineSource};
