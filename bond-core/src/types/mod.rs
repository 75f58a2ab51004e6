//! Ledger Types
//!
//! Entity definitions shared by the engines, the store and the service.

mod account;
mod bond;
mod common;
mod rate;
mod token;

pub use account::*;
pub use bond::*;
pub use common::*;
pub use rate::*;
pub use token::*;
