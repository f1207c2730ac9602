pub mod error;
pub mod gateway;
pub mod jobs;
pub mod oauth;
pub mod queue;
pub mod scopes;
pub mod storage;
pub mod toolkit;
pub mod types;
pub mod worker;
