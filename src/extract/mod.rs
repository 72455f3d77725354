//! Key and cost extraction from request and response contexts.

mod cost;
pub mod expr;
mod jsonpath;
mod key;

pub use cost::{Cost, CostExtractor};
pub use expr::Expression;
pub use jsonpath::JsonPath;
pub use key::{client_ip, KeyExtractor};
