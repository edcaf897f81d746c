pub mod clock;
pub mod compare;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod poll;
pub mod reference;
pub mod snapshot;
pub mod traits;
