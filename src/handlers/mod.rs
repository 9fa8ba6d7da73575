pub mod health;
pub mod login;
pub mod logout;
pub mod otp;
pub mod session;

pub use health::health_check;
pub use login::{login, resend_otp, verify_otp};
pub use logout::logout;
pub use otp::{email_otp, sms_otp};
pub use session::{activity, logout_now, me, status, stay_logged_in};
