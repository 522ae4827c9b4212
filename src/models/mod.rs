pub mod agent;
pub mod event;
pub mod order;
pub mod otp;
