pub mod broadcast;
pub mod framing;
pub mod gateway;
pub mod protocol;
pub mod session;
