use std::net::Ipv4Addr;

use anyhow::Context;
use anyhow::Result;
use ipnet::Ipv4Net;

/// 内置的中国运营商 IPv4 段快照。不追求逐段完备，够覆盖主流分配即可；
/// 更新时整体替换此表。
const CHINA_CIDRS: &[&str] = &[
    "1.0.1.0/24",
    "1.0.2.0/23",
    "1.0.8.0/21",
    "1.0.32.0/19",
    "1.2.0.0/23",
    "1.2.4.0/22",
    "1.8.0.0/16",
    "1.12.0.0/14",
    "1.24.0.0/13",
    "1.48.0.0/14",
    "1.56.0.0/13",
    "1.68.0.0/14",
    "1.80.0.0/13",
    "1.92.0.0/15",
    "1.116.0.0/14",
    "1.180.0.0/14",
    "1.184.0.0/15",
    "1.188.0.0/14",
    "1.192.0.0/13",
    "1.202.0.0/15",
    "1.204.0.0/14",
    "14.0.0.0/21",
    "14.16.0.0/12",
    "14.96.0.0/11",
    "14.128.0.0/10",
    "14.192.0.0/15",
    "27.8.0.0/13",
    "27.16.0.0/12",
    "27.36.0.0/14",
    "27.40.0.0/13",
    "27.128.0.0/15",
    "27.144.0.0/16",
    "27.148.0.0/14",
    "27.152.0.0/13",
    "27.184.0.0/13",
    "27.192.0.0/11",
    "27.224.0.0/14",
    "36.0.0.0/10",
    "36.96.0.0/11",
    "36.128.0.0/10",
    "36.192.0.0/11",
    "36.248.0.0/14",
    "39.0.0.0/16",
    "39.64.0.0/11",
    "39.96.0.0/13",
    "39.104.0.0/14",
    "39.128.0.0/10",
    "42.0.0.0/12",
    "42.56.0.0/14",
    "42.80.0.0/15",
    "42.96.0.0/13",
    "42.120.0.0/15",
    "42.128.0.0/12",
    "42.156.0.0/14",
    "42.160.0.0/12",
    "42.176.0.0/13",
    "42.184.0.0/15",
    "42.192.0.0/13",
    "42.202.0.0/15",
    "42.204.0.0/14",
    "42.208.0.0/12",
    "42.224.0.0/12",
    "42.240.0.0/16",
    "42.242.0.0/15",
    "42.244.0.0/14",
    "42.248.0.0/13",
    "49.4.0.0/14",
    "49.64.0.0/11",
    "49.112.0.0/13",
    "49.232.0.0/14",
    "58.14.0.0/15",
    "58.16.0.0/13",
    "58.24.0.0/15",
    "58.30.0.0/15",
    "58.32.0.0/11",
    "58.66.0.0/15",
    "58.68.128.0/17",
    "58.82.0.0/15",
    "58.100.0.0/15",
    "58.116.0.0/14",
    "58.128.0.0/13",
    "58.144.0.0/16",
    "58.154.0.0/15",
    "58.192.0.0/11",
    "59.32.0.0/11",
    "59.64.0.0/14",
    "59.68.0.0/14",
    "59.72.0.0/15",
    "59.74.0.0/15",
    "59.76.0.0/16",
    "59.77.0.0/16",
    "59.78.0.0/15",
    "59.80.0.0/14",
    "59.107.0.0/17",
    "59.108.0.0/15",
    "59.110.0.0/15",
    "59.151.0.0/17",
    "59.155.0.0/16",
    "59.172.0.0/14",
    "59.191.0.0/17",
    "59.192.0.0/10",
    "60.0.0.0/11",
    "60.55.0.0/16",
    "60.63.0.0/16",
    "60.160.0.0/11",
    "60.194.0.0/15",
    "60.200.0.0/13",
    "60.208.0.0/13",
    "60.216.0.0/15",
    "60.220.0.0/14",
    "60.232.0.0/15",
    "60.235.0.0/16",
    "60.245.128.0/17",
    "60.247.0.0/16",
    "60.252.0.0/16",
    "60.255.0.0/16",
    "61.28.0.0/17",
    "61.29.128.0/17",
    "61.45.128.0/18",
    "61.47.128.0/18",
    "61.48.0.0/13",
    "61.87.192.0/18",
    "61.128.0.0/10",
    "61.232.0.0/14",
    "61.236.0.0/15",
    "61.240.0.0/14",
    "101.4.0.0/14",
    "101.16.0.0/12",
    "101.64.0.0/13",
    "101.72.0.0/14",
    "101.76.0.0/15",
    "101.80.0.0/12",
    "101.96.0.0/14",
    "101.192.0.0/14",
    "101.196.0.0/14",
    "101.200.0.0/15",
    "101.204.0.0/14",
    "101.224.0.0/13",
    "101.232.0.0/15",
    "106.2.0.0/15",
    "106.4.0.0/14",
    "106.8.0.0/15",
    "106.11.0.0/16",
    "106.12.0.0/14",
    "106.16.0.0/12",
    "106.32.0.0/12",
    "106.80.0.0/12",
    "106.108.0.0/14",
    "106.112.0.0/13",
    "106.120.0.0/13",
    "110.16.0.0/14",
    "110.40.0.0/14",
    "110.52.0.0/14",
    "110.56.0.0/13",
    "110.64.0.0/11",
    "110.96.0.0/11",
    "110.152.0.0/14",
    "110.166.0.0/15",
    "110.176.0.0/13",
    "110.184.0.0/13",
    "110.192.0.0/11",
    "110.228.0.0/14",
    "110.240.0.0/12",
    "111.0.0.0/10",
    "111.72.0.0/13",
    "111.160.0.0/13",
    "111.170.0.0/16",
    "111.172.0.0/14",
    "111.176.0.0/13",
    "111.192.0.0/12",
    "111.208.0.0/13",
    "111.224.0.0/14",
    "111.228.0.0/14",
    "112.0.0.0/10",
    "112.64.0.0/14",
    "112.80.0.0/12",
    "112.96.0.0/13",
    "112.112.0.0/14",
    "112.122.0.0/15",
    "112.128.0.0/14",
    "112.132.0.0/16",
    "112.224.0.0/11",
    "113.0.0.0/13",
    "113.8.0.0/15",
    "113.12.0.0/14",
    "113.16.0.0/15",
    "113.24.0.0/14",
    "113.44.0.0/14",
    "113.54.0.0/15",
    "113.56.0.0/15",
    "113.62.0.0/15",
    "113.64.0.0/10",
    "113.128.0.0/15",
    "113.132.0.0/14",
    "113.136.0.0/13",
    "113.194.0.0/15",
    "113.200.0.0/15",
    "113.204.0.0/14",
    "113.218.0.0/15",
    "113.220.0.0/14",
    "113.224.0.0/12",
    "113.240.0.0/13",
    "113.248.0.0/14",
    "114.28.0.0/16",
    "114.80.0.0/12",
    "114.96.0.0/13",
    "114.104.0.0/14",
    "114.112.0.0/12",
    "114.132.0.0/14",
    "114.216.0.0/13",
    "114.224.0.0/11",
    "115.24.0.0/14",
    "115.48.0.0/12",
    "115.100.0.0/14",
    "115.148.0.0/14",
    "115.168.0.0/13",
    "115.192.0.0/11",
    "116.0.0.0/14",
    "116.4.0.0/14",
    "116.8.0.0/14",
    "116.13.0.0/16",
    "116.16.0.0/12",
    "116.52.0.0/14",
    "116.56.0.0/15",
    "116.76.0.0/14",
    "116.112.0.0/14",
    "116.116.0.0/15",
    "116.128.0.0/10",
    "117.8.0.0/13",
    "117.22.0.0/15",
    "117.24.0.0/13",
    "117.32.0.0/13",
    "117.40.0.0/14",
    "117.44.0.0/15",
    "117.60.0.0/14",
    "117.64.0.0/13",
    "117.72.0.0/15",
    "117.80.0.0/12",
    "117.112.0.0/13",
    "117.124.0.0/14",
    "117.128.0.0/10",
    "118.24.0.0/13",
    "118.64.0.0/15",
    "118.72.0.0/13",
    "118.80.0.0/15",
    "118.84.0.0/15",
    "118.89.0.0/16",
    "118.112.0.0/13",
    "118.120.0.0/14",
    "118.124.0.0/15",
    "118.126.0.0/16",
    "118.144.0.0/14",
    "118.178.0.0/16",
    "118.180.0.0/14",
    "118.186.0.0/15",
    "118.190.0.0/15",
    "118.192.0.0/13",
    "118.204.0.0/14",
    "118.224.0.0/14",
    "118.244.0.0/14",
    "118.248.0.0/13",
    "119.4.0.0/14",
    "119.27.64.0/18",
    "119.32.0.0/13",
    "119.48.0.0/13",
    "119.57.0.0/16",
    "119.75.208.0/20",
    "119.78.0.0/15",
    "119.84.0.0/14",
    "119.96.0.0/13",
    "119.120.0.0/13",
    "119.128.0.0/12",
    "119.144.0.0/14",
    "119.162.0.0/15",
    "119.164.0.0/14",
    "119.176.0.0/12",
    "119.248.0.0/14",
    "119.254.0.0/15",
    "120.0.0.0/12",
    "120.24.0.0/14",
    "120.32.0.0/13",
    "120.40.0.0/14",
    "120.52.0.0/14",
    "120.64.0.0/14",
    "120.68.0.0/14",
    "120.76.0.0/14",
    "120.80.0.0/13",
    "120.128.0.0/14",
    "120.192.0.0/10",
    "121.4.0.0/14",
    "121.8.0.0/13",
    "121.16.0.0/12",
    "121.32.0.0/13",
    "121.40.0.0/14",
    "121.60.0.0/14",
    "121.68.0.0/14",
    "121.192.0.0/13",
    "121.204.0.0/14",
    "121.224.0.0/12",
    "121.248.0.0/14",
    "122.4.0.0/14",
    "122.51.0.0/16",
    "122.64.0.0/11",
    "122.96.0.0/15",
    "122.112.0.0/14",
    "122.136.0.0/13",
    "122.156.0.0/14",
    "122.188.0.0/14",
    "122.192.0.0/14",
    "122.204.0.0/14",
    "122.224.0.0/12",
    "122.240.0.0/13",
    "123.4.0.0/14",
    "123.8.0.0/13",
    "123.52.0.0/14",
    "123.56.0.0/15",
    "123.58.0.0/16",
    "123.64.0.0/11",
    "123.96.0.0/15",
    "123.112.0.0/12",
    "123.128.0.0/13",
    "123.138.0.0/15",
    "123.144.0.0/12",
    "123.160.0.0/12",
    "123.180.0.0/14",
    "123.184.0.0/13",
    "123.206.0.0/15",
    "123.232.0.0/13",
    "123.244.0.0/14",
    "124.14.0.0/15",
    "124.16.0.0/15",
    "124.64.0.0/15",
    "124.68.0.0/14",
    "124.72.0.0/13",
    "124.88.0.0/13",
    "124.112.0.0/13",
    "124.126.0.0/15",
    "124.128.0.0/13",
    "124.160.0.0/13",
    "124.172.0.0/14",
    "124.192.0.0/15",
    "124.200.0.0/13",
    "124.220.0.0/14",
    "124.224.0.0/13",
    "124.232.0.0/15",
    "124.236.0.0/14",
    "125.32.0.0/12",
    "125.64.0.0/11",
    "125.96.0.0/15",
    "125.104.0.0/13",
    "125.112.0.0/12",
    "125.211.0.0/16",
    "125.216.0.0/13",
    "171.8.0.0/13",
    "171.34.0.0/15",
    "171.36.0.0/14",
    "171.40.0.0/13",
    "171.80.0.0/12",
    "171.104.0.0/13",
    "171.112.0.0/12",
    "171.208.0.0/12",
    "175.0.0.0/12",
    "175.16.0.0/13",
    "175.24.0.0/14",
    "175.30.0.0/15",
    "175.42.0.0/15",
    "175.46.0.0/15",
    "175.48.0.0/12",
    "175.146.0.0/15",
    "175.148.0.0/14",
    "175.152.0.0/13",
    "175.160.0.0/12",
    "175.178.0.0/16",
    "175.186.0.0/15",
    "180.76.0.0/16",
    "180.88.0.0/14",
    "180.96.0.0/11",
    "180.136.0.0/13",
    "180.152.0.0/13",
    "180.160.0.0/12",
    "180.184.0.0/14",
    "182.32.0.0/12",
    "182.61.0.0/16",
    "182.80.0.0/13",
    "182.88.0.0/14",
    "182.92.0.0/16",
    "182.96.0.0/12",
    "182.112.0.0/12",
    "182.128.0.0/12",
    "182.144.0.0/13",
    "182.200.0.0/13",
    "182.240.0.0/13",
    "182.254.0.0/16",
    "183.0.0.0/10",
    "183.64.0.0/13",
    "183.92.0.0/14",
    "183.128.0.0/11",
    "183.160.0.0/13",
    "183.168.0.0/15",
    "183.172.0.0/14",
    "183.184.0.0/13",
    "183.192.0.0/10",
    "202.38.0.0/16",
    "202.96.0.0/12",
    "202.112.0.0/13",
    "202.120.0.0/15",
    "202.192.0.0/13",
    "203.93.0.0/16",
    "210.12.0.0/15",
    "210.21.0.0/16",
    "210.22.0.0/16",
    "210.25.0.0/16",
    "210.26.0.0/15",
    "210.28.0.0/14",
    "210.32.0.0/12",
    "210.51.0.0/16",
    "210.52.0.0/15",
    "210.72.0.0/14",
    "210.76.0.0/14",
    "210.82.0.0/15",
    "211.64.0.0/13",
    "211.80.0.0/12",
    "211.96.0.0/13",
    "211.136.0.0/13",
    "211.144.0.0/12",
    "211.160.0.0/13",
    "218.0.0.0/11",
    "218.56.0.0/13",
    "218.64.0.0/11",
    "218.96.0.0/14",
    "218.104.0.0/14",
    "218.108.0.0/15",
    "218.192.0.0/12",
    "218.240.0.0/13",
    "219.128.0.0/11",
    "219.216.0.0/13",
    "219.224.0.0/11",
    "220.160.0.0/11",
    "220.192.0.0/12",
    "220.248.0.0/14",
    "220.252.0.0/16",
    "221.0.0.0/13",
    "221.8.0.0/14",
    "221.14.0.0/15",
    "221.130.0.0/15",
    "221.172.0.0/14",
    "221.176.0.0/13",
    "221.192.0.0/14",
    "221.196.0.0/15",
    "221.200.0.0/13",
    "221.208.0.0/12",
    "221.224.0.0/12",
    "222.16.0.0/12",
    "222.32.0.0/11",
    "222.64.0.0/10",
    "222.128.0.0/12",
    "222.160.0.0/14",
    "222.176.0.0/12",
    "222.192.0.0/11",
    "222.240.0.0/13",
    "223.4.0.0/14",
    "223.64.0.0/11",
    "223.96.0.0/12",
    "223.112.0.0/14",
    "223.144.0.0/12",
    "223.160.0.0/14",
    "223.166.0.0/15",
    "223.240.0.0/13",
];

/// 判定 IPv4 是否属于中国运营商地址段。表在构造时编译为有序不相交区间，
/// 查询只做一次二分。
pub struct ChinaIp {
    // inclusive (start, end), sorted, non-overlapping
    ranges: Vec<(u32, u32)>,
}

impl ChinaIp {
    pub fn from_builtin() -> Result<Self> {
        Self::from_cidrs(CHINA_CIDRS)
    }

    fn from_cidrs(cidrs: &[&str]) -> Result<Self> {
        let mut ranges = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let net: Ipv4Net = cidr
                .parse()
                .with_context(|| format!("invalid cidr in china table: {cidr}"))?;
            ranges.push((u32::from(net.network()), u32::from(net.broadcast())));
        }
        ranges.sort_unstable();

        // 合并相邻或重叠的区间
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }

        Ok(Self { ranges: merged })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let v = u32::from(ip);
        let idx = self.ranges.partition_point(|&(start, _)| start <= v);
        idx > 0 && v <= self.ranges[idx - 1].1
    }
}
