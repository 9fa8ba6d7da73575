pub mod agent;
pub mod otp_code;

pub use agent::Agent;
pub use otp_code::{OtpChannel, OtpCode};
