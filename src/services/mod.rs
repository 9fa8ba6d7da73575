pub mod email;
pub mod identity;
pub mod login;
pub mod otp;
pub mod sms;

pub use email::EmailClient;
pub use identity::{IdentityClient, IdentityProvider, IdentitySession, IdentityUser};
pub use login::{LoginOutcome, LoginService};
pub use otp::{OtpSender, OtpService};
pub use sms::SmsClient;
