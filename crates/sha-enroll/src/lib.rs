pub mod broker;
pub mod error;

pub use broker::{EnrollmentBroker, PairingCode};
pub use error::EnrollError;
