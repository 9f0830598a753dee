pub mod admin;
pub mod extract;
pub mod jobs;
pub mod llm;
pub mod webhooks;
