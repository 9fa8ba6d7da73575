pub mod agent;
pub mod otp_code;

pub use agent::{AgentDirectory, AgentRepository};
pub use otp_code::{OtpCodeRepository, OtpStore};
