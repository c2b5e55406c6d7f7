use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use tracing::{info, warn};

use crate::cache::{CacheKey, HintStore, ReplyCache};
use crate::chinaip::ChinaIp;
use crate::classify::Classifier;
use crate::config::Config;
use crate::resolver::{response_for, RaceResolver, Transport};

/// Forwarder core. Owns the reply cache, the hint store, the pollution
/// classifier and the race resolver; the listeners hand it one request at a
/// time and write back whatever it returns.
#[derive(Clone)]
pub struct Server {
    cache: ReplyCache,
    resolver: RaceResolver,
}

impl Server {
    /// 构造失败（地址不合法、内置 IP 表损坏）是致命的，由 main 终止进程。
    pub fn new(cfg: &Config) -> Result<Self> {
        let fast = cfg
            .fast_dns
            .parse()
            .with_context(|| format!("invalid fast_dns address: {}", cfg.fast_dns))?;
        let clean = cfg
            .clean_dns
            .parse()
            .with_context(|| format!("invalid clean_dns address: {}", cfg.clean_dns))?;

        let china = Arc::new(ChinaIp::from_builtin().context("compile china ip table")?);
        let cache = ReplyCache::new(cfg.cache_size);
        let hints = HintStore::new(cfg.cache_size);
        let classifier = Classifier::new(hints, china);
        let resolver = RaceResolver::new(fast, clean, cache.clone(), classifier);

        Ok(Self { cache, resolver })
    }

    /// 处理一条请求，总是恰好产出一条应答。
    /// 探测顺序 hosts → cache → net，先命中者短路。
    pub async fn handle(&self, req: Message, transport: Transport) -> Message {
        if req.queries().is_empty() {
            let reply = response_for(&req, ResponseCode::FormErr);
            warn!(
                op = "handle_request",
                domain = "[request without questions]",
                status = ?reply.response_code(),
            );
            return reply;
        }

        let question = &req.queries()[0];
        let domain = question.name().to_string();
        let qtype = question.query_type();

        let (mut reply, upstream): (Message, Arc<str>) =
            if let Some(hit) = self.lookup_hosts(&req) {
                (hit, Arc::from("hosts"))
            } else if let Some(hit) = self.lookup_cache(&req, transport) {
                (hit, Arc::from("cache"))
            } else {
                self.resolver.resolve_net(&req, transport).await
            };

        finalize(&req, &mut reply);

        let status = reply.response_code();
        if status == ResponseCode::NoError {
            info!(
                op = "handle_request",
                domain = %domain,
                qtype = ?qtype,
                upstream = %upstream,
                status = ?status,
            );
        } else {
            warn!(
                op = "handle_request",
                domain = %domain,
                qtype = ?qtype,
                upstream = %upstream,
                status = ?status,
            );
        }
        reply
    }

    /// Hosts override probe. Reserved extension point: always a miss.
    fn lookup_hosts(&self, _req: &Message) -> Option<Message> {
        None
    }

    /// Cache probe with read-time TTL rewrite. When any record TTL hit the
    /// floor the entry is served as-is and a detached refresh races the
    /// upstreams in the background; its result lands in the cache through
    /// the normal insertion path.
    fn lookup_cache(&self, req: &Message, transport: Transport) -> Option<Message> {
        let key = CacheKey::from_request(req, transport)?;
        let (reply, refresh) = self.cache.lookup(&key)?;

        if refresh {
            let resolver = self.resolver.clone();
            let req = req.clone();
            tokio::spawn(async move {
                let (res, upstream) = resolver.resolve_net(&req, transport).await;
                let domain = req
                    .queries()
                    .first()
                    .map(|q| q.name().to_string())
                    .unwrap_or_default();
                let qtype = req.queries().first().map(|q| q.query_type());
                let status = res.response_code();
                if status == ResponseCode::NoError {
                    info!(
                        op = "cache_refresh",
                        domain = %domain,
                        qtype = ?qtype,
                        upstream = %upstream,
                        status = ?status,
                    );
                } else {
                    warn!(
                        op = "cache_refresh",
                        domain = %domain,
                        qtype = ?qtype,
                        upstream = %upstream,
                        status = ?status,
                    );
                }
            });
        }

        Some(reply)
    }
}

/// 把客户端视角盖回出站应答：事务 ID、响应标志与最终 rcode。
fn finalize(req: &Message, reply: &mut Message) {
    let rcode = reply.response_code();
    reply.set_id(req.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(req.op_code());
    reply.set_recursion_desired(req.recursion_desired());
    reply.set_response_code(rcode);
    if reply.queries().is_empty() {
        let queries = req.queries().to_vec();
        reply.add_queries(queries);
    }
}
