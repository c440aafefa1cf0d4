//! Startup-cached IP allow-list: GitHub's `/meta` hook ranges unioned with
//! Cloudflare's published CIDRs. Populated once on start (the module-level
//! cache the design notes call out as the one piece of process-wide state
//! besides the background-task registry) and consulted per delivery.

use std::net::IpAddr;

use ipnet::IpNet;

#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    nets: Vec<IpNet>,
}

impl IpAllowList {
    pub fn from_cidrs(cidrs: impl IntoIterator<Item = String>) -> Self {
        let nets = cidrs
            .into_iter()
            .filter_map(|c| c.parse::<IpNet>().ok())
            .collect();
        Self { nets }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&addr))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

/// Fetches GitHub's published hook IP ranges from `/meta`.
pub async fn fetch_github_hook_cidrs(client: &reqwest::Client) -> anyhow::Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct Meta {
        hooks: Vec<String>,
    }
    let meta: Meta = client
        .get("https://api.github.com/meta")
        .header("User-Agent", "webhook-server")
        .send()
        .await?
        .json()
        .await?;
    Ok(meta.hooks)
}

/// Fetches Cloudflare's published IPv4 + IPv6 CIDR ranges.
pub async fn fetch_cloudflare_cidrs(client: &reqwest::Client) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    for url in ["https://www.cloudflare.com/ips-v4", "https://www.cloudflare.com/ips-v6"] {
        let text = client.get(url).send().await?.text().await?;
        out.extend(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_matches_configured_range() {
        let list = IpAllowList::from_cidrs(["192.30.252.0/22".to_string()]);
        assert!(list.contains("192.30.252.1".parse().unwrap()));
        assert!(!list.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn empty_list_reports_empty() {
        let list = IpAllowList::default();
        assert!(list.is_empty());
    }
}
