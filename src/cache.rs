use std::time::Instant;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use moka::sync::Cache;
use rustc_hash::FxBuildHasher;

use crate::resolver::Transport;

/// 缓存应答对外可见的最小 TTL（秒）。低于该值即钳到此值并触发后台刷新。
pub const MIN_SERVED_TTL_SECS: u32 = 3;

/// Query fingerprint. Transaction ID and qname case never reach the key, so
/// retries and case-randomized queries share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    qname: String,
    qtype: RecordType,
    recursion_desired: bool,
    transport: Transport,
}

impl CacheKey {
    /// 以请求的第一个 Question 构造指纹；无 Question 时没有可指纹的内容。
    pub fn from_request(req: &Message, transport: Transport) -> Option<Self> {
        let q = req.queries().first()?;
        Some(Self {
            qname: q.name().to_lowercase().to_string(),
            qtype: q.query_type(),
            recursion_desired: req.recursion_desired(),
            transport,
        })
    }
}

#[derive(Clone)]
struct CacheEntry {
    inserted_at: Instant,
    reply: Message,
}

/// Bounded reply cache. Stored TTLs are the values observed at insertion;
/// the decrement happens on read, never on write. Entries are replaced
/// wholesale on refresh, not updated in place.
#[derive(Clone)]
pub struct ReplyCache {
    entries: Cache<CacheKey, CacheEntry, FxBuildHasher>,
}

impl ReplyCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .build_with_hasher(FxBuildHasher::default()),
        }
    }

    pub fn insert(&self, key: CacheKey, reply: Message) {
        self.entries.insert(
            key,
            CacheEntry {
                inserted_at: Instant::now(),
                reply,
            },
        );
    }

    /// Returns an age-adjusted copy of the stored reply, plus a flag telling
    /// the caller that a background refresh is due because some record TTL
    /// hit the floor.
    pub fn lookup(&self, key: &CacheKey) -> Option<(Message, bool)> {
        let mut entry = self.entries.get(key)?;
        let delta = entry.inserted_at.elapsed().as_secs() as u32;
        let refresh = decrement_ttl(&mut entry.reply, delta);
        Some((entry.reply, refresh))
    }

    #[cfg(test)]
    fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

/// 从 answer/authority/additional 三段的每条记录扣减 delta 秒；
/// 任何一条落到下限即钳住并报告需要刷新。
fn decrement_ttl(reply: &mut Message, delta: u32) -> bool {
    let mut refresh = adjust_section(reply.answers_mut(), delta);
    refresh |= adjust_section(reply.name_servers_mut(), delta);
    refresh |= adjust_section(reply.additionals_mut(), delta);
    refresh
}

fn adjust_section(records: &mut [hickory_proto::rr::Record], delta: u32) -> bool {
    let mut clamped = false;
    for record in records {
        let remaining = record.ttl().saturating_sub(delta);
        if remaining < MIN_SERVED_TTL_SECS {
            record.set_ttl(MIN_SERVED_TTL_SECS);
            clamped = true;
        } else {
            record.set_ttl(remaining);
        }
    }
    clamped
}

/// 域名 → 「最近一次带 A 记录的应答是否指向中国 IP」。
/// 缺项表示从未观察到该域名的 A 应答。
#[derive(Clone)]
pub struct HintStore {
    entries: Cache<String, bool, FxBuildHasher>,
}

impl HintStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .build_with_hasher(FxBuildHasher::default()),
        }
    }

    pub fn set(&self, qname: String, china: bool) {
        self.entries.insert(qname, china);
    }

    pub fn get(&self, qname: &str) -> Option<bool> {
        self.entries.get(qname)
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn query(qname: &str, qtype: RecordType, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(qname).expect("name"), qtype));
        msg
    }

    fn reply_with_ttls(qname: &str, ttls: &[u32]) -> Message {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_response_code(ResponseCode::NoError);
        let name = Name::from_str(qname).expect("name");
        msg.add_query(Query::query(name.clone(), RecordType::A));
        for (i, ttl) in ttls.iter().enumerate() {
            msg.add_answer(Record::from_rdata(
                name.clone(),
                *ttl,
                RData::A(A(Ipv4Addr::new(192, 0, 2, i as u8))),
            ));
        }
        msg
    }

    #[test]
    fn fingerprint_ignores_transaction_id_and_case() {
        let a = CacheKey::from_request(&query("Example.COM.", RecordType::A, 1), Transport::Udp);
        let b = CacheKey::from_request(&query("example.com.", RecordType::A, 999), Transport::Udp);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_separates_qtype_rd_and_transport() {
        let base = query("example.com.", RecordType::A, 1);
        let udp = CacheKey::from_request(&base, Transport::Udp).unwrap();
        let tcp = CacheKey::from_request(&base, Transport::Tcp).unwrap();
        assert_ne!(udp, tcp);

        let aaaa = CacheKey::from_request(&query("example.com.", RecordType::AAAA, 1), Transport::Udp);
        assert_ne!(Some(udp.clone()), aaaa);

        let mut no_rd = query("example.com.", RecordType::A, 1);
        no_rd.set_recursion_desired(false);
        assert_ne!(Some(udp), CacheKey::from_request(&no_rd, Transport::Udp));
    }

    #[test]
    fn fingerprint_requires_a_question() {
        assert!(CacheKey::from_request(&Message::new(), Transport::Udp).is_none());
    }

    #[test]
    fn fresh_entry_keeps_ttls_and_needs_no_refresh() {
        let cache = ReplyCache::new(16);
        let req = query("example.com.", RecordType::A, 7);
        let key = CacheKey::from_request(&req, Transport::Udp).unwrap();
        cache.insert(key.clone(), reply_with_ttls("example.com.", &[60, 120]));

        let (reply, refresh) = cache.lookup(&key).expect("hit");
        assert!(!refresh);
        let ttls: Vec<u32> = reply.answers().iter().map(|r| r.ttl()).collect();
        assert_eq!(ttls, vec![60, 120]);
    }

    #[test]
    fn decrement_is_monotonic_and_floored() {
        let mut reply = reply_with_ttls("example.com.", &[60]);
        assert!(!decrement_ttl(&mut reply, 10));
        assert_eq!(reply.answers()[0].ttl(), 50);

        // 再扣 45 秒：50 - 45 = 5，仍在下限之上
        assert!(!decrement_ttl(&mut reply, 45));
        assert_eq!(reply.answers()[0].ttl(), 5);

        // 超过剩余值：钳到下限并要求刷新
        assert!(decrement_ttl(&mut reply, 65));
        assert_eq!(reply.answers()[0].ttl(), MIN_SERVED_TTL_SECS);
    }

    #[test]
    fn every_served_ttl_stays_at_or_above_floor() {
        for delta in [0u32, 1, 2, 59, 60, 61, 3600] {
            let mut reply = reply_with_ttls("example.com.", &[1, 2, 60]);
            decrement_ttl(&mut reply, delta);
            for record in reply.answers() {
                assert!(record.ttl() >= MIN_SERVED_TTL_SECS, "delta {delta}");
            }
        }
    }

    #[test]
    fn single_expired_record_flags_refresh_for_whole_reply() {
        let mut reply = reply_with_ttls("example.com.", &[5, 600]);
        assert!(decrement_ttl(&mut reply, 10));
        assert_eq!(reply.answers()[0].ttl(), MIN_SERVED_TTL_SECS);
        assert_eq!(reply.answers()[1].ttl(), 590);
    }

    #[test]
    fn stored_reply_is_not_mutated_by_lookup() {
        let cache = ReplyCache::new(16);
        let req = query("example.com.", RecordType::A, 7);
        let key = CacheKey::from_request(&req, Transport::Udp).unwrap();
        cache.insert(key.clone(), reply_with_ttls("example.com.", &[60]));

        let (first, _) = cache.lookup(&key).unwrap();
        let (second, _) = cache.lookup(&key).unwrap();
        // 两次读取都是从插入时值扣减，而不是对上次读取结果继续扣减
        assert_eq!(first.answers()[0].ttl(), second.answers()[0].ttl());
    }

    #[test]
    fn cache_never_exceeds_configured_capacity() {
        let cache = ReplyCache::new(8);
        for i in 0..64u16 {
            let req = query(&format!("host{i}.example.com."), RecordType::A, i);
            let key = CacheKey::from_request(&req, Transport::Udp).unwrap();
            cache.insert(key, reply_with_ttls("example.com.", &[60]));
        }
        assert!(cache.entry_count() <= 8);
    }

    #[test]
    fn hint_store_is_bounded_and_replaces_values() {
        let hints = HintStore::new(8);
        hints.set("baidu.com.".to_string(), true);
        assert_eq!(hints.get("baidu.com."), Some(true));
        hints.set("baidu.com.".to_string(), false);
        assert_eq!(hints.get("baidu.com."), Some(false));
        assert_eq!(hints.get("unseen.com."), None);

        for i in 0..64 {
            hints.set(format!("host{i}.example.com."), true);
        }
        assert!(hints.entry_count() <= 8);
    }
}
