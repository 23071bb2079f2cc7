//! Anti-automation signature predicates.
//!
//! Signatures are configuration data: per target, a list of regexes over the
//! response body or `status:<code>` status matchers. The `*` key applies to
//! every target.

use crate::executor::RawResponse;
use bastion_core::Error;
use regex::Regex;
use std::collections::HashMap;

const ALL_TARGETS: &str = "*";
const STATUS_PREFIX: &str = "status:";

/// One blocking marker.
#[derive(Debug, Clone)]
pub enum Signature {
    BodyPattern(Regex),
    Status(u16),
}

impl Signature {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if let Some(code) = raw.strip_prefix(STATUS_PREFIX) {
            let code = code
                .trim()
                .parse::<u16>()
                .map_err(|e| Error::InvalidInput(format!("invalid status signature {raw:?}: {e}")))?;
            return Ok(Signature::Status(code));
        }
        Regex::new(raw)
            .map(Signature::BodyPattern)
            .map_err(|e| Error::InvalidInput(format!("invalid body signature {raw:?}: {e}")))
    }

    pub fn matches(&self, response: &RawResponse) -> bool {
        match self {
            Signature::BodyPattern(re) => re.is_match(&response.body),
            Signature::Status(code) => response.status == Some(*code),
        }
    }

    fn describe(&self) -> String {
        match self {
            Signature::BodyPattern(re) => format!("body matched /{}/", re.as_str()),
            Signature::Status(code) => format!("status {code}"),
        }
    }
}

/// Signature lists keyed by target.
#[derive(Debug, Clone, Default)]
pub struct SignatureSet {
    all: Vec<Signature>,
    per_target: HashMap<String, Vec<Signature>>,
}

impl SignatureSet {
    pub fn from_config(raw: &HashMap<String, Vec<String>>) -> Result<Self, Error> {
        let mut set = Self::default();
        for (target, predicates) in raw {
            let parsed = predicates.iter().map(|p| Signature::parse(p)).collect::<Result<Vec<_>, _>>()?;
            if target == ALL_TARGETS {
                set.all.extend(parsed);
            } else {
                set.per_target.entry(target.clone()).or_default().extend(parsed);
            }
        }
        Ok(set)
    }

    pub fn with(mut self, target: &str, signature: Signature) -> Self {
        if target == ALL_TARGETS {
            self.all.push(signature);
        } else {
            self.per_target.entry(target.to_string()).or_default().push(signature);
        }
        self
    }

    /// Describe the first signature of `target` that `response` matches.
    pub fn find(&self, target: &str, response: &RawResponse) -> Option<String> {
        self.per_target
            .get(target)
            .into_iter()
            .flatten()
            .chain(self.all.iter())
            .find(|sig| sig.matches(response))
            .map(Signature::describe)
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.per_target.values().all(Vec::is_empty)
    }
}
