//! Webhook delivery: encrypted secrets, HMAC-signed posts, and the
//! at-least-once retry loop.

pub mod crypto;
pub mod dispatcher;
pub mod signing;

pub use {
    crypto::SecretCipher,
    dispatcher::{WebhookDispatcher, job_event_payload},
    signing::{SIGNATURE_HEADER, sign_body},
};
