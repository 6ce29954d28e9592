//! Shared sender-socket setup: every UDP sender binds through here so they
//! all get the same reuse-address and larger send-buffer sizing.

use std::net::UdpSocket;

use socket2::{Domain, Protocol, Socket, Type};

use screamrouter_core::error::{Error, Result};

const SEND_BUFFER_BYTES: usize = 1024 * 1024;

pub fn bind_sender_socket(sink_id: &str) -> Result<UdpSocket> {
    let setup_failed = |e: std::io::Error| Error::SenderSetupFailed {
        sink_id: sink_id.to_string(),
        reason: e.to_string(),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(setup_failed)?;
    socket.set_reuse_address(true).map_err(setup_failed)?;
    let _ = socket.set_send_buffer_size(SEND_BUFFER_BYTES);
    socket
        .bind(&"0.0.0.0:0".parse::<std::net::SocketAddr>().unwrap().into())
        .map_err(setup_failed)?;
    socket.set_broadcast(true).ok();
    Ok(socket.into())
}
