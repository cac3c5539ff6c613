// Services module - Business logic

pub mod audit;
pub mod authenticator;
pub mod device_hash;
pub mod license_admin;
pub mod license_key;
pub mod license_validator;
pub mod mailer;
pub mod password;
pub mod session_token;
pub mod verification_code;
