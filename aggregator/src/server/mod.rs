//! Service endpoints

pub mod http;
