//! Parser for the `projectcalico.org/policy` pod annotation.
//!
//! An annotation holds `;`-separated inbound rules:
//!
//! ```text
//! allow [tcp|udp|icmp|icmpv6|sctp|udplite] [from (ports P | label K=V | cidr C)...] [to ports P]
//! ```
//!
//! where `P` is a comma-separated list of ports or `lo:hi` ranges. A `label` selector matches the tag the
//! annotation driver gives pods with that label in the same namespace.

use std::iter::Peekable;
use std::str::SplitWhitespace;

use ipnetwork::IpNetwork;
use thiserror::Error;

use crate::datastore::{PortRange, Rule};

const PROTOCOLS: &[&str] = &["tcp", "udp", "icmp", "icmpv6", "sctp", "udplite"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} in policy rule {rule:?}")]
pub struct ParseError {
    pub rule: String,
    pub message: String,
}

/// Parses every rule in an annotation. Rules for `namespace` refer to label tags in that namespace.
pub fn parse_rules(namespace: &str, annotation: &str) -> Result<Vec<Rule>, ParseError> {
    annotation
        .split(';')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| parse_line(namespace, line))
        .collect()
}

/// Parses a single rule.
pub fn parse_line(namespace: &str, line: &str) -> Result<Rule, ParseError> {
    RuleParser {
        namespace,
        line,
        tokens: line.split_whitespace().peekable(),
    }
    .parse()
}

struct RuleParser<'a> {
    namespace: &'a str,
    line: &'a str,
    tokens: Peekable<SplitWhitespace<'a>>,
}

impl<'a> RuleParser<'a> {
    fn parse(mut self) -> Result<Rule, ParseError> {
        match self.tokens.next() {
            Some("allow") => (),
            Some(other) => return Err(self.error(format!("expected 'allow', found {:?}", other))),
            None => return Err(self.error("empty rule")),
        }
        let mut rule = Rule::allow();

        if let Some(protocol) = self.tokens.next_if(|token| PROTOCOLS.contains(token)) {
            rule.protocol = Some(protocol.into());
        }

        if self.tokens.next_if_eq(&"from").is_some() {
            let mut qualifiers = 0;
            while let Some(qualifier) = self.tokens.next_if(|t| matches!(*t, "ports" | "label" | "cidr")) {
                let value = self.value(qualifier)?;
                match qualifier {
                    "ports" => rule.src_ports = self.ports(value)?,
                    "label" => rule.src_tag = Some(self.label_tag(value)?),
                    _ => {
                        rule.src_net = Some(
                            value
                                .parse::<IpNetwork>()
                                .map_err(|_| self.error(format!("invalid CIDR {:?}", value)))?,
                        )
                    }
                }
                qualifiers += 1;
            }
            if qualifiers == 0 {
                return Err(self.error("expected ports, label or cidr after 'from'"));
            }
        }

        if self.tokens.next_if_eq(&"to").is_some() {
            match self.tokens.next() {
                Some("ports") => {
                    let value = self.value("ports")?;
                    rule.dst_ports = self.ports(value)?;
                }
                _ => return Err(self.error("expected ports after 'to'")),
            }
        }

        match self.tokens.next() {
            None => Ok(rule),
            Some(token) => Err(self.error(format!("unexpected {:?}", token))),
        }
    }

    fn value(&mut self, qualifier: &str) -> Result<&'a str, ParseError> {
        match self.tokens.next() {
            Some(value) => Ok(value),
            None => Err(self.error(format!("missing value for {}", qualifier))),
        }
    }

    fn ports(&self, value: &str) -> Result<Vec<PortRange>, ParseError> {
        value
            .split(',')
            .map(|port| port.parse::<PortRange>().map_err(|message| self.error(message)))
            .collect()
    }

    fn label_tag(&self, value: &str) -> Result<String, ParseError> {
        match value.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                Ok(format!("{}_{}_{}", self.namespace, key, value))
            }
            _ => Err(self.error(format!("invalid label selector {:?}", value))),
        }
    }

    fn error<S: Into<String>>(&self, message: S) -> ParseError {
        ParseError {
            rule: self.line.into(),
            message: message.into(),
        }
    }
}
