pub mod http;
pub mod wiring;
