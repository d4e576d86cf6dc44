//! # Records and Validation
//!
//! A [`Record`] is the unit of value storage: opaque bytes under an opaque
//! key, stamped with the time the local node received it. The routing core
//! never interprets record contents — a [`Validator`] capability decides
//! whether a `(key, value)` pair is acceptable and which of several
//! candidate values for one key is best.
//!
//! Validation rules are namespace-specific in practice (different record
//! families live under different key prefixes), so the crate ships a
//! [`NamespacedValidator`] that dispatches `/namespace/rest` keys to
//! registered sub-validators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// A stored value with receipt metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub time_received: Option<SystemTime>,
}

impl Record {
    /// A record without a receipt timestamp (as carried on the wire).
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            time_received: None,
        }
    }

    /// A record stamped with the current time, for local storage.
    pub fn stamped(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            time_received: Some(SystemTime::now()),
        }
    }
}

/// Decides record acceptability and ranks candidate values.
///
/// `select` returns the index of the winning value; by convention index 0
/// wins ties, so callers place the incumbent (or the candidate they want to
/// privilege) first.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Index of the best value among `values`. `values` must be non-empty.
    fn select(&self, key: &[u8], values: &[&[u8]]) -> Result<usize>;
}

/// Splits `/namespace/rest` into `(namespace, rest)`.
fn split_namespace(key: &[u8]) -> Result<(&[u8], &[u8])> {
    if key.first() != Some(&b'/') {
        bail!("invalid record key: missing namespace prefix");
    }
    let body = &key[1..];
    let sep = body
        .iter()
        .position(|&b| b == b'/')
        .ok_or_else(|| anyhow!("invalid record key: missing namespace separator"))?;
    Ok((&body[..sep], &body[sep + 1..]))
}

/// Dispatches validation by the key's namespace prefix.
///
/// Keys look like `/ns/arbitrary-bytes`; the sub-validator registered for
/// `ns` sees the full key. Unknown namespaces are rejected.
#[derive(Clone, Default)]
pub struct NamespacedValidator {
    validators: HashMap<Vec<u8>, Arc<dyn Validator>>,
}

impl NamespacedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, namespace: impl Into<Vec<u8>>, validator: Arc<dyn Validator>) {
        self.validators.insert(namespace.into(), validator);
    }

    fn validator_for(&self, key: &[u8]) -> Result<&Arc<dyn Validator>> {
        let (ns, _) = split_namespace(key)?;
        self.validators
            .get(ns)
            .ok_or_else(|| anyhow!("no validator for namespace {:?}", String::from_utf8_lossy(ns)))
    }
}

impl Validator for NamespacedValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.validator_for(key)?.validate(key, value)
    }

    fn select(&self, key: &[u8], values: &[&[u8]]) -> Result<usize> {
        if values.is_empty() {
            bail!("no values to select from");
        }
        self.validator_for(key)?.select(key, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Accepting;

    impl Validator for Accepting {
        fn validate(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
            Ok(())
        }

        fn select(&self, _key: &[u8], _values: &[&[u8]]) -> Result<usize> {
            Ok(0)
        }
    }

    struct Rejecting;

    impl Validator for Rejecting {
        fn validate(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
            bail!("rejected")
        }

        fn select(&self, _key: &[u8], _values: &[&[u8]]) -> Result<usize> {
            bail!("rejected")
        }
    }

    #[test]
    fn dispatches_by_namespace() {
        let mut v = NamespacedValidator::new();
        v.register("ok", Arc::new(Accepting));
        v.register("bad", Arc::new(Rejecting));

        assert!(v.validate(b"/ok/some-key", b"value").is_ok());
        assert!(v.validate(b"/bad/some-key", b"value").is_err());
        assert!(v.validate(b"/unknown/some-key", b"value").is_err());
    }

    #[test]
    fn rejects_unprefixed_keys() {
        let mut v = NamespacedValidator::new();
        v.register("ok", Arc::new(Accepting));
        assert!(v.validate(b"ok/no-leading-slash", b"value").is_err());
        assert!(v.validate(b"/ok-no-separator", b"value").is_err());
    }

    #[test]
    fn select_requires_values() {
        let mut v = NamespacedValidator::new();
        v.register("ok", Arc::new(Accepting));
        assert!(v.select(b"/ok/k", &[]).is_err());
        assert_eq!(v.select(b"/ok/k", &[b"a", b"b"]).unwrap(), 0);
    }

    #[test]
    fn record_stamping() {
        let wire = Record::new(b"/ok/k".to_vec(), b"v".to_vec());
        assert!(wire.time_received.is_none());
        let local = Record::stamped(b"/ok/k".to_vec(), b"v".to_vec());
        assert!(local.time_received.is_some());
    }
}
