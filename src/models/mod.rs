pub mod event;
pub mod transcript;
