use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::Context as _;
use pine_dns_lib::{RecordData, RecordType};

/// A statically configured forced answer for a name, consulted before the
/// cache and upstreams. Read-only to the engine; its lifecycle belongs to
/// the configuration layer.
#[derive(Debug, Clone)]
pub struct OverrideRule {
    /// Lowercased domain, optionally prefixed with `*.` for wildcard rules
    pub name: String,
    pub data: RecordData<'static>,
}

impl OverrideRule {
    /// Parses a `name=value` rule, where `value` is an IPv4/IPv6 address
    /// (an A/AAAA answer) or a domain name (a CNAME answer).
    pub fn parse(rule: &str) -> anyhow::Result<OverrideRule> {
        let (name, value) = rule
            .split_once('=')
            .with_context(|| format!("override rule '{}' is missing '='", rule))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        anyhow::ensure!(
            !name.trim_start_matches("*.").is_empty(),
            "override rule '{}' has an empty name",
            rule
        );
        anyhow::ensure!(!value.is_empty(), "override rule '{}' has an empty value", rule);

        let data = match value.parse::<IpAddr>() {
            Ok(IpAddr::V4(address)) => RecordData::A { address },
            Ok(IpAddr::V6(address)) => RecordData::AAAA { address },
            Err(_) => RecordData::CNAME {
                host: value.to_ascii_lowercase().into(),
            },
        };

        Ok(OverrideRule { name, data })
    }
}

#[derive(Default)]
pub struct OverrideTable {
    exact: HashMap<String, Vec<RecordData<'static>>>,
    wildcard: HashMap<String, Vec<RecordData<'static>>>,
}

impl OverrideTable {
    pub fn new(rules: &[OverrideRule]) -> Self {
        let mut table = OverrideTable::default();
        for rule in rules {
            let bucket = match rule.name.strip_prefix("*.") {
                Some(suffix) => table.wildcard.entry(suffix.to_string()),
                None => table.exact.entry(rule.name.clone()),
            };
            bucket.or_default().push(rule.data.clone());
        }
        table
    }

    /// Returns the forced answer data for a question, if any rule matches.
    /// An exact rule wins over a wildcard one; a matching name with no data
    /// of the requested type yields an empty (but authoritative) answer.
    pub fn lookup(&self, qname: &str, qtype: RecordType) -> Option<Vec<RecordData<'static>>> {
        let qname = qname.to_ascii_lowercase();
        let records = self.exact.get(qname.as_str()).or_else(|| {
            wildcard_parts(&qname).find_map(|suffix| self.wildcard.get(suffix))
        })?;

        Some(
            records
                .iter()
                .filter(|data| match qtype {
                    RecordType::ANY => true,
                    qtype => data.rtype() == qtype,
                })
                .cloned()
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }
}

fn wildcard_parts(qname: &str) -> impl Iterator<Item = &str> {
    qname
        .split('.')
        .enumerate()
        .skip(1)
        .filter(|(_, label)| !label.is_empty())
        .filter_map(move |(idx, _)| qname.splitn(idx + 1, '.').last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn table(rules: &[&str]) -> OverrideTable {
        let rules: Vec<_> = rules
            .iter()
            .map(|rule| OverrideRule::parse(rule).expect("rule should parse"))
            .collect();
        OverrideTable::new(&rules)
    }

    #[test]
    fn parse_rejects_junk() {
        assert!(OverrideRule::parse("no-equals-sign").is_err());
        assert!(OverrideRule::parse("=1.2.3.4").is_err());
        assert!(OverrideRule::parse("*.=1.2.3.4").is_err());
        assert!(OverrideRule::parse("example.com=").is_err());
    }

    #[test]
    fn exact_match_by_type() {
        let table = table(&["example.com=1.2.3.4", "example.com=::1"]);

        let a = table.lookup("example.com", RecordType::A).unwrap();
        assert_eq!(
            a,
            vec![RecordData::A {
                address: Ipv4Addr::new(1, 2, 3, 4)
            }]
        );

        let aaaa = table.lookup("example.com", RecordType::AAAA).unwrap();
        assert_eq!(aaaa.len(), 1);

        let any = table.lookup("example.com", RecordType::ANY).unwrap();
        assert_eq!(any.len(), 2);

        assert!(table.lookup("other.com", RecordType::A).is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let table = table(&["Example.COM=1.2.3.4"]);
        assert!(table.lookup("EXAMPLE.com", RecordType::A).is_some());
    }

    #[test]
    fn matching_name_without_matching_type_is_still_a_match() {
        let table = table(&["example.com=1.2.3.4"]);
        let records = table.lookup("example.com", RecordType::AAAA).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let table = table(&["*.example.com=1.2.3.4"]);
        assert!(table.lookup("a.example.com", RecordType::A).is_some());
        assert!(table.lookup("deep.a.example.com", RecordType::A).is_some());
        assert!(table.lookup("example.com", RecordType::A).is_none());
        assert!(table.lookup("notexample.com", RecordType::A).is_none());
    }

    #[test]
    fn exact_rule_wins_over_wildcard() {
        let table = table(&["*.example.com=1.2.3.4", "a.example.com=5.6.7.8"]);
        let records = table.lookup("a.example.com", RecordType::A).unwrap();
        assert_eq!(
            records,
            vec![RecordData::A {
                address: Ipv4Addr::new(5, 6, 7, 8)
            }]
        );
    }

    #[test]
    fn cname_override() {
        let table = table(&["alias.example.com=real.example.com"]);
        let records = table.lookup("alias.example.com", RecordType::CNAME).unwrap();
        assert_eq!(
            records,
            vec![RecordData::CNAME {
                host: "real.example.com".into()
            }]
        );
    }
}
