use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::error;

use crate::cache::{CacheKey, ReplyCache};
use crate::classify::Classifier;

/// 竞速总期限。到点后两侧一律按「无应答」处理。
pub const RACE_DEADLINE: Duration = Duration::from_secs(2);

const MAX_UDP_PAYLOAD: usize = 4096;

/// 客户端进来的传输方式，上游侧照搬。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Dual-upstream race. The fast upstream wins whenever its reply survives
/// the pollution check; the clean upstream is the fallback and is trusted
/// by definition, so it is never classified.
#[derive(Clone)]
pub struct RaceResolver {
    fast: SocketAddr,
    clean: SocketAddr,
    fast_label: Arc<str>,
    clean_label: Arc<str>,
    cache: ReplyCache,
    classifier: Classifier,
}

impl RaceResolver {
    pub fn new(
        fast: SocketAddr,
        clean: SocketAddr,
        cache: ReplyCache,
        classifier: Classifier,
    ) -> Self {
        Self {
            fast,
            clean,
            fast_label: Arc::from(fast.to_string()),
            clean_label: Arc::from(clean.to_string()),
            cache,
            classifier,
        }
    }

    /// Resolve through both upstreams concurrently and pick a winner. Never
    /// fails: total loss yields a synthesized SERVFAIL. Returns the reply
    /// together with the label of the upstream that produced it.
    pub async fn resolve_net(&self, req: &Message, transport: Transport) -> (Message, Arc<str>) {
        let deadline = Instant::now() + RACE_DEADLINE;

        let (fast_tx, fast_rx) = oneshot::channel();
        {
            let req = req.clone();
            let upstream = self.fast;
            let label = self.fast_label.clone();
            let classifier = self.classifier.clone();
            tokio::spawn(async move {
                let reply = query_upstream(&req, upstream, transport, &label).await;
                // fast 的应答必须同时满足：传输成功、NOERROR、通过污染判定
                let accepted = reply.filter(|r| {
                    r.response_code() == ResponseCode::NoError && !classifier.maybe_polluted(r)
                });
                let _ = fast_tx.send(accepted);
            });
        }

        let (clean_tx, clean_rx) = oneshot::channel();
        {
            let req = req.clone();
            let upstream = self.clean;
            let label = self.clean_label.clone();
            tokio::spawn(async move {
                let _ = clean_tx.send(query_upstream(&req, upstream, transport, &label).await);
            });
        }

        // 无论到达顺序如何，先看 fast 一侧
        let fast = match timeout_at(deadline, fast_rx).await {
            Ok(Ok(reply)) => reply,
            _ => None,
        };
        if let Some(reply) = fast {
            self.store(req, transport, &reply);
            return (reply, self.fast_label.clone());
        }

        let clean = match timeout_at(deadline, clean_rx).await {
            Ok(Ok(reply)) => reply,
            _ => None,
        };
        match clean {
            Some(reply) => {
                if reply.response_code() == ResponseCode::NoError {
                    self.store(req, transport, &reply);
                }
                (reply, self.clean_label.clone())
            }
            None => (response_for(req, ResponseCode::ServFail), self.clean_label.clone()),
        }
    }

    fn store(&self, req: &Message, transport: Transport, reply: &Message) {
        if let Some(key) = CacheKey::from_request(req, transport) {
            self.cache.insert(key, reply.clone());
        }
    }
}

/// One upstream leg: deadline-bounded exchange, transport failures collapse
/// to None after an error log.
async fn query_upstream(
    req: &Message,
    upstream: SocketAddr,
    transport: Transport,
    label: &str,
) -> Option<Message> {
    let result = match timeout(RACE_DEADLINE, exchange(req, upstream, transport)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("upstream timed out")),
    };
    match result {
        Ok(reply) => Some(reply),
        Err(err) => {
            let domain = req
                .queries()
                .first()
                .map(|q| q.name().to_string())
                .unwrap_or_default();
            error!(op = "resolve", upstream = %label, domain = %domain, error = %err, "upstream exchange failed");
            None
        }
    }
}

static NEXT_ID: AtomicU16 = AtomicU16::new(1);

/// Send a copy of the request with a fresh transaction ID over a dedicated
/// socket and await the peer's reply; the original ID is restored on the way
/// back.
async fn exchange(req: &Message, upstream: SocketAddr, transport: Transport) -> anyhow::Result<Message> {
    let leg_id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let packet = {
        let mut leg = req.clone();
        leg.set_id(leg_id);
        leg.to_vec().context("encode upstream query")?
    };

    let raw = match transport {
        Transport::Udp => exchange_udp(&packet, upstream, leg_id).await?,
        Transport::Tcp => exchange_tcp(&packet, upstream).await?,
    };

    let mut reply = Message::from_vec(&raw).context("parse upstream reply")?;
    reply.set_id(req.id());
    Ok(reply)
}

async fn exchange_udp(packet: &[u8], upstream: SocketAddr, leg_id: u16) -> anyhow::Result<Vec<u8>> {
    let domain = if upstream.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    let bind_addr: SocketAddr = if upstream.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    socket.bind(&bind_addr.into()).context("bind")?;
    let socket = tokio::net::UdpSocket::from_std(socket.into()).context("from_std")?;

    socket.connect(upstream).await.context("connect upstream")?;
    socket.send(packet).await.context("send query")?;

    let mut buf = [0u8; MAX_UDP_PAYLOAD];
    loop {
        let len = socket.recv(&mut buf).await.context("recv reply")?;
        // 专用 socket 上仍可能收到迟到的陈旧包，按事务 ID 过滤
        if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) != leg_id {
            continue;
        }
        return Ok(buf[..len].to_vec());
    }
}

async fn exchange_tcp(packet: &[u8], upstream: SocketAddr) -> anyhow::Result<Vec<u8>> {
    if packet.len() > u16::MAX as usize {
        anyhow::bail!("dns packet too large for tcp framing");
    }

    let mut stream = TcpStream::connect(upstream).await.context("connect upstream")?;

    let mut framed = Vec::with_capacity(2 + packet.len());
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(packet);
    stream.write_all(&framed).await.context("send query")?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.context("read reply length")?;
    let resp_len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; resp_len];
    stream.read_exact(&mut buf).await.context("read reply body")?;
    Ok(buf)
}

/// 以 req 的事务 ID 与 Question 合成一条指定 rcode 的应答。
pub(crate) fn response_for(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);

    let queries: Vec<Query> = req.queries().to_vec();
    msg.add_queries(queries);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HintStore;
    use crate::chinaip::ChinaIp;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use tokio::net::UdpSocket;

    fn build_query(qname: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(4321);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(qname).expect("name"), qtype));
        msg
    }

    fn answer_a(req: &Message, ip: Ipv4Addr) -> Message {
        let mut reply = response_for(req, ResponseCode::NoError);
        let name = req.queries()[0].name().clone();
        reply.add_answer(Record::from_rdata(name, 300, RData::A(A(ip))));
        reply
    }

    fn answer_aaaa(req: &Message) -> Message {
        let mut reply = response_for(req, ResponseCode::NoError);
        let name = req.queries()[0].name().clone();
        reply.add_answer(Record::from_rdata(
            name,
            300,
            RData::AAAA(AAAA("2400:da00::6666".parse().unwrap())),
        ));
        reply
    }

    /// 起一个脚本化的 UDP 上游：对收到的每个查询回 make_reply 的结果。
    async fn scripted_upstream<F>(make_reply: F) -> SocketAddr
    where
        F: Fn(&Message) -> Message + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = socket.local_addr().expect("local addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = Message::from_vec(&buf[..len]) else {
                    continue;
                };
                let mut reply = make_reply(&query);
                reply.set_id(query.id());
                let bytes = reply.to_vec().expect("encode reply");
                let _ = socket.send_to(&bytes, peer).await;
            }
        });
        addr
    }

    fn resolver_with(fast: SocketAddr, clean: SocketAddr) -> (RaceResolver, ReplyCache, HintStore) {
        let cache = ReplyCache::new(64);
        let hints = HintStore::new(64);
        let classifier = Classifier::new(
            hints.clone(),
            Arc::new(ChinaIp::from_builtin().expect("builtin table")),
        );
        (
            RaceResolver::new(fast, clean, cache.clone(), classifier),
            cache,
            hints,
        )
    }

    fn answered_a(reply: &Message) -> Vec<Ipv4Addr> {
        reply
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::A(a)) => Some(a.0),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn clean_reply_wins_when_fast_points_abroad() {
        let fast = scripted_upstream(|q| answer_a(q, Ipv4Addr::new(8, 8, 8, 8))).await;
        let clean = scripted_upstream(|q| answer_a(q, Ipv4Addr::new(93, 184, 216, 34))).await;
        let (resolver, cache, _) = resolver_with(fast, clean);

        let req = build_query("example.com.", RecordType::A);
        let (reply, upstream) = resolver.resolve_net(&req, Transport::Udp).await;

        assert_eq!(answered_a(&reply), vec![Ipv4Addr::new(93, 184, 216, 34)]);
        assert_eq!(upstream.as_ref(), clean.to_string());
        assert_eq!(reply.id(), req.id());

        let key = CacheKey::from_request(&req, Transport::Udp).unwrap();
        let (cached, _) = cache.lookup(&key).expect("clean reply cached");
        assert_eq!(answered_a(&cached), vec![Ipv4Addr::new(93, 184, 216, 34)]);
    }

    #[tokio::test]
    async fn fast_reply_wins_for_china_answer() {
        let fast = scripted_upstream(|q| answer_a(q, Ipv4Addr::new(220, 181, 38, 148))).await;
        let clean = scripted_upstream(|q| answer_a(q, Ipv4Addr::new(1, 2, 3, 4))).await;
        let (resolver, _, hints) = resolver_with(fast, clean);

        let req = build_query("baidu.com.", RecordType::A);
        let (reply, upstream) = resolver.resolve_net(&req, Transport::Udp).await;

        assert_eq!(answered_a(&reply), vec![Ipv4Addr::new(220, 181, 38, 148)]);
        assert_eq!(upstream.as_ref(), fast.to_string());
        assert_eq!(hints.get("baidu.com."), Some(true));
    }

    #[tokio::test]
    async fn stripped_aaaa_for_known_china_name_falls_to_clean() {
        let fast = scripted_upstream(answer_aaaa).await;
        let clean = scripted_upstream(answer_aaaa).await;
        let (resolver, _, hints) = resolver_with(fast, clean);
        hints.set("baidu.com.".to_string(), true);

        let req = build_query("baidu.com.", RecordType::AAAA);
        let (_, upstream) = resolver.resolve_net(&req, Transport::Udp).await;
        assert_eq!(upstream.as_ref(), clean.to_string());
    }

    #[tokio::test]
    async fn fast_non_noerror_is_suppressed() {
        let fast = scripted_upstream(|q| response_for(q, ResponseCode::NXDomain)).await;
        let clean = scripted_upstream(|q| answer_a(q, Ipv4Addr::new(93, 184, 216, 34))).await;
        let (resolver, _, _) = resolver_with(fast, clean);

        let req = build_query("example.com.", RecordType::A);
        let (reply, upstream) = resolver.resolve_net(&req, Transport::Udp).await;
        assert_eq!(upstream.as_ref(), clean.to_string());
        assert_eq!(reply.response_code(), ResponseCode::NoError);
    }

    #[tokio::test]
    async fn clean_non_noerror_is_returned_but_not_cached() {
        let fast = scripted_upstream(|q| answer_a(q, Ipv4Addr::new(8, 8, 8, 8))).await;
        let clean = scripted_upstream(|q| response_for(q, ResponseCode::NXDomain)).await;
        let (resolver, cache, _) = resolver_with(fast, clean);

        let req = build_query("nonexistent.example.com.", RecordType::A);
        let (reply, upstream) = resolver.resolve_net(&req, Transport::Udp).await;
        assert_eq!(upstream.as_ref(), clean.to_string());
        assert_eq!(reply.response_code(), ResponseCode::NXDomain);

        let key = CacheKey::from_request(&req, Transport::Udp).unwrap();
        assert!(cache.lookup(&key).is_none());
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_independently() {
        use futures::future::join_all;

        let fast = scripted_upstream(|q| answer_a(q, Ipv4Addr::new(220, 181, 38, 148))).await;
        let clean = scripted_upstream(|q| answer_a(q, Ipv4Addr::new(1, 2, 3, 4))).await;
        let (resolver, _, _) = resolver_with(fast, clean);

        let tasks = (0..16)
            .map(|i| {
                let resolver = resolver.clone();
                async move {
                    let req = build_query(&format!("host{i}.baidu.com."), RecordType::A);
                    resolver.resolve_net(&req, Transport::Udp).await
                }
            })
            .collect::<Vec<_>>();

        for (reply, upstream) in join_all(tasks).await {
            assert_eq!(answered_a(&reply), vec![Ipv4Addr::new(220, 181, 38, 148)]);
            assert_eq!(upstream.as_ref(), fast.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn servfail_when_both_upstreams_stay_dark() {
        // 绑定但从不应答的上游
        let fast_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let clean_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (resolver, cache, _) =
            resolver_with(fast_sock.local_addr().unwrap(), clean_sock.local_addr().unwrap());

        let req = build_query("example.com.", RecordType::A);
        let (reply, _) = resolver.resolve_net(&req, Transport::Udp).await;
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(reply.id(), req.id());

        let key = CacheKey::from_request(&req, Transport::Udp).unwrap();
        assert!(cache.lookup(&key).is_none());
    }

    #[tokio::test]
    async fn tcp_transport_is_mirrored_upstream() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                    if stream.read_exact(&mut buf).await.is_err() {
                        return;
                    }
                    let query = Message::from_vec(&buf).expect("parse query");
                    let reply = answer_a(&query, Ipv4Addr::new(220, 181, 38, 148));
                    let bytes = reply.to_vec().expect("encode");
                    let mut out = Vec::with_capacity(2 + bytes.len());
                    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    out.extend_from_slice(&bytes);
                    let _ = stream.write_all(&out).await;
                });
            }
        });

        let (resolver, _, _) = resolver_with(addr, addr);
        let req = build_query("baidu.com.", RecordType::A);
        let (reply, _) = resolver.resolve_net(&req, Transport::Tcp).await;
        assert_eq!(answered_a(&reply), vec![Ipv4Addr::new(220, 181, 38, 148)]);
    }
}
