//! Listeners: open or accept a transport, then run one [`Session`] per
//! attached device.

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket},
    thread,
    time::Duration,
};

use rosserial_link::{LinkError, RECV_BUFFER_SIZE, serial, set_recv_buffer, tcp, udp};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info};

use crate::{
    Session, ShutdownFlag,
    config::{SerialConfig, TcpConfig, UdpConfig},
    middleware::BridgeContext,
};

const SERIAL_RETRY_PAUSE: Duration = Duration::from_secs(3);
const ACCEPT_PAUSE: Duration = Duration::from_secs(1);

/// Opens the configured serial port (retrying until it appears or shutdown
/// is signalled) and runs one session over it.
pub fn serve_serial(cfg: &SerialConfig, ctx: BridgeContext, shutdown: ShutdownFlag) {
    let pair = loop {
        if shutdown.is_set() {
            return;
        }
        match serial::open(&cfg.port, cfg.baud, cfg.session.link_timeout) {
            Ok(pair) => break pair,
            Err(err) => {
                error!(%err, port = %cfg.port, "error opening serial port, retrying");
                thread::sleep(SERIAL_RETRY_PAUSE);
            }
        }
    };

    info!(port = %cfg.port, baud = cfg.baud, "serial link up");
    let end = Session::new(pair, ctx, cfg.session.clone(), shutdown).run();
    info!(?end, port = %cfg.port, "serial session ended");
}

/// Accepts TCP connections and runs a session over each, inline or on a
/// thread per connection. Returns on shutdown or a listener-level error.
pub fn serve_tcp(cfg: &TcpConfig, ctx: BridgeContext, shutdown: ShutdownFlag) -> Result<(), LinkError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port));
    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(LinkError::from_io)?;
    socket.set_reuse_address(true).map_err(LinkError::from_io)?;
    socket.bind(&addr.into()).map_err(LinkError::from_io)?;
    // One device per port; anything beyond the next connection can wait.
    socket.listen(1).map_err(LinkError::from_io)?;
    let listener: TcpListener = socket.into();
    set_recv_buffer(&listener, RECV_BUFFER_SIZE);
    listener.set_nonblocking(true).map_err(LinkError::from_io)?;
    info!(port = cfg.port, "waiting for socket connections");

    let mut workers = Vec::new();
    while !shutdown.is_set() {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_PAUSE);
                continue;
            }
            Err(err) => return Err(LinkError::from_io(err)),
        };

        info!(%peer, "established a socket connection");
        if let Err(err) = stream.set_nonblocking(false) {
            error!(%err, %peer, "couldn't configure accepted socket");
            continue;
        }
        let pair = match tcp::from_stream(stream, cfg.session.link_timeout) {
            Ok(pair) => pair,
            Err(err) => {
                error!(%err, %peer, "couldn't configure accepted socket");
                continue;
            }
        };

        let session = Session::new(pair, ctx.clone(), cfg.session.clone(), shutdown.clone());
        if cfg.spawn_sessions {
            let spawned = thread::Builder::new()
                .name(format!("rosserial-{peer}"))
                .spawn(move || {
                    let end = session.run();
                    info!(?end, %peer, "session ended");
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => error!(%err, "couldn't spawn session thread"),
            }
        } else {
            let end = session.run();
            info!(?end, %peer, "session ended");
        }
    }

    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

/// Waits for a first datagram, pins its sender as the client and runs a
/// session over the flow; on session end goes back to waiting. Returns on
/// shutdown or a listener-level error.
pub fn serve_udp(cfg: &UdpConfig, ctx: BridgeContext, shutdown: ShutdownFlag) -> Result<(), LinkError> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port)))
        .map_err(LinkError::from_io)?;
    set_recv_buffer(&socket, RECV_BUFFER_SIZE);
    info!(port = cfg.port, "udp server listening");

    while !shutdown.is_set() {
        socket.set_read_timeout(Some(cfg.session.link_timeout)).map_err(LinkError::from_io)?;

        let mut probe = [0u8; 1];
        let peer = match socket.peek_from(&mut probe) {
            Ok((_, peer)) => peer,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => return Err(LinkError::from_io(err)),
        };

        info!(%peer, "client connected");
        let cloned = socket.try_clone().map_err(LinkError::from_io)?;
        match udp::pinned(cloned, peer, cfg.session.link_timeout) {
            Ok(pair) => {
                let end =
                    Session::new(pair, ctx.clone(), cfg.session.clone(), shutdown.clone()).run();
                info!(?end, %peer, "udp session ended");
            }
            Err(err) => error!(%err, %peer, "couldn't set up udp flow"),
        }
    }
    Ok(())
}
