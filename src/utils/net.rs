use std::net::TcpListener;

use tokio::net::TcpStream;

/// Bind test: true when nothing currently listens on `host:port`.
pub fn is_port_free(
    host: &str,
    port: u16,
) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

pub async fn is_server_ready(
    host: &str,
    port: u16,
) -> bool {
    TcpStream::connect((host, port)).await.is_ok()
}
