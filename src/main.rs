mod cache;
mod chinaip;
mod classify;
mod config;
mod resolver;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::resolver::Transport;
use crate::server::Server;

#[derive(Parser, Debug)]
#[command(author, version, about = "Anti-pollution dual-upstream DNS forwarder", long_about = None)]
struct Args {
    /// 配置文件路径（JSON），缺省走内置默认值
    #[arg(short = 'C', long = "config")]
    config: Option<PathBuf>,
    /// 监听地址，覆盖配置文件
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,
    /// 近端上游，覆盖配置文件
    #[arg(short = 'f', long = "fast-dns")]
    fast_dns: Option<String>,
    /// 可信上游，覆盖配置文件
    #[arg(short = 'c', long = "clean-dns")]
    clean_dns: Option<String>,
    /// 缓存容量（条），覆盖配置文件
    #[arg(long = "cache-size")]
    cache_size: Option<u64>,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut cfg = match &args.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if let Some(fast) = args.fast_dns {
        cfg.fast_dns = fast;
    }
    if let Some(clean) = args.clean_dns {
        cfg.clean_dns = clean;
    }
    if let Some(size) = args.cache_size {
        cfg.cache_size = size;
    }
    let cfg = cfg.normalize();

    let bind_addr: SocketAddr = cfg.listen.parse().context("parse listen addr")?;
    let server = Server::new(&cfg)?;

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(
        listen = %bind_addr,
        fast_dns = %cfg.fast_dns,
        clean_dns = %cfg.clean_dns,
        cache_size = cfg.cache_size,
        udp_workers = udp_workers,
        "dns forwarder started"
    );

    let mut handles = Vec::with_capacity(udp_workers + 1);

    #[cfg(unix)]
    {
        // On Unix create individual sockets with SO_REUSEPORT so kernel distributes packets
        for worker_id in 0..udp_workers {
            let server = server.clone();
            let std_socket = create_reuseport_udp_socket(bind_addr)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            let socket = UdpSocket::from_std(std_socket)?;
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(Arc::new(socket), server).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    #[cfg(not(unix))]
    {
        // Non-Unix: one shared socket, workers compete on recv
        let socket = Arc::new(
            UdpSocket::bind(bind_addr)
                .await
                .context("bind udp socket")?,
        );
        for worker_id in 0..udp_workers {
            let server = server.clone();
            let socket = Arc::clone(&socket);
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(socket, server).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .context("bind tcp listener")?;
    let tcp_server = server.clone();
    handles.push(tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_server).await {
            error!(error = %err, "tcp server exited");
        }
    }));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("signal received, stopping listeners");
    for handle in &handles {
        handle.abort();
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// 在 Unix 上创建带 SO_REUSEPORT 的 UDP socket，多 worker 共享端口
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[allow(unused_imports)]
    use libc::{c_int, c_void, setsockopt, socklen_t, SOL_SOCKET, SO_REUSEPORT};
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // non-fatal: continue without reuseport
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn run_udp_worker(socket: Arc<UdpSocket>, server: Server) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if buf.capacity() < 4096 {
            buf.reserve(4096 - buf.len());
        }
        match socket.recv_buf_from(&mut buf).await {
            Ok((_len, peer)) => {
                let packet = buf.split().freeze();
                let server = server.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    let req = match Message::from_vec(&packet) {
                        Ok(req) => req,
                        // 非 DNS 流量直接丢弃
                        Err(_) => return,
                    };
                    let reply = server.handle(req, Transport::Udp).await;
                    match reply.to_vec() {
                        Ok(bytes) => {
                            let _ = socket.send_to(&bytes, peer).await;
                        }
                        Err(err) => {
                            warn!(op = "udp_send", error = %err, "encode reply failed");
                        }
                    }
                });
            }
            Err(err) => {
                error!(op = "udp_recv", error = %err, "udp recv failed");
                buf.clear();
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, server: Server) -> anyhow::Result<()> {
    loop {
        let (stream, _peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, server).await;
        });
    }
}

async fn handle_tcp_conn(mut stream: TcpStream, server: Server) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let req = match Message::from_vec(&buf) {
            Ok(req) => req,
            Err(_) => return Ok(()),
        };
        let reply = server.handle(req, Transport::Tcp).await;
        let resp = match reply.to_vec() {
            Ok(bytes) => bytes,
            Err(_) => return Ok(()),
        };

        if resp.len() <= u16::MAX as usize {
            let len_bytes = (resp.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&resp).await.is_err() {
                return Ok(());
            }
        }
    }
}
