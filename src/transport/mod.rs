pub mod tcp;
pub mod websocket;
