//! RDF triple metadata carried by sensor and broker registrations.
//!
//! The chain treats these as opaque: they are preserved verbatim for an
//! external triple store. The only rule enforced here is that no term may
//! claim the chain's reserved URI namespace.

use serde::{Deserialize, Serialize};

use crate::constants::RESERVED_URI_PREFIX;
use crate::error::VerifyError;

/// A triple whose object is another node (URI).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeTriple {
    pub s: String,
    pub p: String,
    pub o: String,
}

/// A triple whose object is a literal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LiteralTriple {
    pub s: String,
    pub p: String,
    pub o: LiteralValue,
}

/// Literal objects are strings or integers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralValue {
    String(String),
    Integer(i64),
}

/// A subject/predicate/node-object term: any string outside the reserved
/// namespace.
pub fn validate_term(term: &str) -> Result<(), VerifyError> {
    if term.starts_with(RESERVED_URI_PREFIX) {
        return Err(VerifyError::ReservedUriPrefix(term.to_owned()));
    }
    Ok(())
}

impl NodeTriple {
    pub fn validate(&self) -> Result<(), VerifyError> {
        validate_term(&self.s)?;
        validate_term(&self.p)?;
        validate_term(&self.o)
    }
}

impl LiteralTriple {
    pub fn validate(&self) -> Result<(), VerifyError> {
        validate_term(&self.s)?;
        validate_term(&self.p)?;
        match &self.o {
            LiteralValue::String(s) => validate_term(s),
            LiteralValue::Integer(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_prefix_rejected() {
        let triple = NodeTriple {
            s: format!("{RESERVED_URI_PREFIX}block/abc"),
            p: "http://example.org/p".into(),
            o: "http://example.org/o".into(),
        };
        assert!(matches!(
            triple.validate(),
            Err(VerifyError::ReservedUriPrefix(_))
        ));
    }

    #[test]
    fn test_plain_terms_accepted() {
        let triple = LiteralTriple {
            s: "http://example.org/s".into(),
            p: "http://example.org/p".into(),
            o: LiteralValue::Integer(42),
        };
        assert!(triple.validate().is_ok());
    }
}
