mod connection;
mod handshake;
mod pause_requests;
mod stepping;
