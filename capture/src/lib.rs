pub mod session;
pub mod source;
