pub mod authority;
pub mod engine;
pub mod intent;
pub mod tick;
