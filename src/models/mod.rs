// Models module - Database entity representations

pub mod activation;
pub mod admin_user;
pub mod audit_log;
pub mod challenge;
pub mod license;

pub use activation::{Activation, ActivationStatus};
pub use admin_user::AdminUser;
pub use audit_log::{AuditLog, RequestContext};
pub use challenge::{ChallengeKind, ChallengePayload, VerificationChallenge};
pub use license::{License, LicenseEntitlement, LicenseStatus};
