use std::net::Ipv4Addr;
use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record};

use crate::cache::HintStore;
use crate::chinaip::ChinaIp;

/// Judges whether a fast-upstream reply looks injected. Clean-upstream
/// replies are trusted by definition and never pass through here.
///
/// 判定规则按序命中：
/// 1. 三段皆空 → 污染（注入者常用空应答断连）；
/// 2. 带 A 记录 → 记下「是否含中国 IP」的提示，不含即视为污染；
/// 3. 无 A 记录但历史提示该域名解析到中国 → 本次被剥掉了 A，视为污染；
/// 4. 其余（如纯 MX/TXT/AAAA）可信。
#[derive(Clone)]
pub struct Classifier {
    hints: HintStore,
    china: Arc<ChinaIp>,
}

impl Classifier {
    pub fn new(hints: HintStore, china: Arc<ChinaIp>) -> Self {
        Self { hints, china }
    }

    /// The only side effect is the hint-store write in the A-record case.
    pub fn maybe_polluted(&self, reply: &Message) -> bool {
        let records: Vec<&Record> = reply
            .answers()
            .iter()
            .chain(reply.name_servers())
            .chain(reply.additionals())
            .collect();
        if records.is_empty() {
            return true;
        }

        let qname = reply
            .queries()
            .first()
            .map(|q| q.name().to_lowercase().to_string());

        let a_addrs: Vec<Ipv4Addr> = records
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::A(a)) => Some(a.0),
                _ => None,
            })
            .collect();

        if !a_addrs.is_empty() {
            let china = a_addrs.iter().any(|ip| self.china.contains(*ip));
            if let Some(qname) = qname {
                self.hints.set(qname, china);
            }
            return !china;
        }

        if let Some(known_china) = qname.as_deref().and_then(|name| self.hints.get(name)) {
            return known_china;
        }

        false
    }
}
