//! Catalog of known kinds and schema conversions.
//!
//! Built once at process start and shared by `Arc` with every registry.
//! Each version of a kind registers a pair of conversions against the kind's
//! hub ([`HUB_VERSION`](crate::gvk::HUB_VERSION)), so any two versions can be
//! converted in at most two steps without an all-pairs matrix.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::gvk::Gvk;

/// A conversion between two schemas of the same kind.
///
/// Operates on whole-object JSON documents. The catalog stamps `apiVersion`
/// and `kind` after every step, so functions only need to reshape the body.
pub type ConvertFn = Arc<dyn Fn(Value) -> Result<Value, ConversionError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("no conversion registered from {src} to {dst}")]
    NoConversion { src: Gvk, dst: Gvk },

    #[error("conversion from {src} to {dst} failed: {reason}")]
    Failed { src: Gvk, dst: Gvk, reason: String },

    #[error("malformed document: {0}")]
    Malformed(String),
}

impl ConversionError {
    /// Shorthand for conversion functions reporting a bad field.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// Known kinds and the conversions between their versions.
#[derive(Default)]
pub struct Catalog {
    /// (group, kind) → registered versions.
    kinds: HashMap<(String, String), BTreeSet<String>>,
    conversions: HashMap<(Gvk, Gvk), ConvertFn>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a schema version exists.
    pub fn register_kind(&mut self, gvk: &Gvk) -> &mut Self {
        self.kinds
            .entry((gvk.group.clone(), gvk.kind.clone()))
            .or_default()
            .insert(gvk.api_version.clone());
        self
    }

    pub fn is_registered(&self, gvk: &Gvk) -> bool {
        self.kinds
            .get(&(gvk.group.clone(), gvk.kind.clone()))
            .is_some_and(|versions| versions.contains(&gvk.api_version))
    }

    /// Registered versions of a kind, sorted.
    pub fn versions(&self, group: &str, kind: &str) -> Vec<String> {
        self.kinds
            .get(&(group.to_string(), kind.to_string()))
            .map(|versions| versions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register a direct conversion from `src` to `dst`.
    pub fn register_conversion(
        &mut self,
        src: &Gvk,
        dst: &Gvk,
        f: impl Fn(Value) -> Result<Value, ConversionError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.conversions
            .insert((src.clone(), dst.clone()), Arc::new(f));
        self
    }

    /// Register a version together with its conversions to and from the hub.
    pub fn register_version(
        &mut self,
        gvk: &Gvk,
        to_hub: impl Fn(Value) -> Result<Value, ConversionError> + Send + Sync + 'static,
        from_hub: impl Fn(Value) -> Result<Value, ConversionError> + Send + Sync + 'static,
    ) -> &mut Self {
        let hub = gvk.hub();
        self.register_kind(gvk);
        self.register_conversion(gvk, &hub, to_hub);
        self.register_conversion(&hub, gvk, from_hub);
        self
    }

    /// Convert a document from `src` to `dst`.
    ///
    /// Uses a direct conversion when one is registered and otherwise routes
    /// through the hub.
    pub fn convert(&self, value: Value, src: &Gvk, dst: &Gvk) -> Result<Value, ConversionError> {
        if src == dst {
            return Ok(value);
        }
        if !src.same_kind(dst) {
            return Err(ConversionError::NoConversion {
                src: src.clone(),
                dst: dst.clone(),
            });
        }
        if self.conversions.contains_key(&(src.clone(), dst.clone())) {
            return self.step(value, src, dst);
        }

        let hub = src.hub();
        let missing = |a: &Gvk, b: &Gvk| !self.conversions.contains_key(&(a.clone(), b.clone()));
        if (!src.is_hub() && missing(src, &hub)) || (!dst.is_hub() && missing(&hub, dst)) {
            return Err(ConversionError::NoConversion {
                src: src.clone(),
                dst: dst.clone(),
            });
        }

        debug!(%src, %dst, "converting through hub");
        let value = if src.is_hub() { value } else { self.step(value, src, &hub)? };
        if dst.is_hub() {
            Ok(value)
        } else {
            self.step(value, &hub, dst)
        }
    }

    fn step(&self, value: Value, src: &Gvk, dst: &Gvk) -> Result<Value, ConversionError> {
        let f = self
            .conversions
            .get(&(src.clone(), dst.clone()))
            .ok_or_else(|| ConversionError::NoConversion {
                src: src.clone(),
                dst: dst.clone(),
            })?;
        let mut out = f(value)?;
        let Some(map) = out.as_object_mut() else {
            return Err(ConversionError::Failed {
                src: src.clone(),
                dst: dst.clone(),
                reason: "conversion did not produce an object".to_string(),
            });
        };
        map.insert("apiVersion".into(), Value::String(dst.api_version_string()));
        map.insert("kind".into(), Value::String(dst.kind.clone()));
        Ok(out)
    }
}

/// Lift a spec-only conversion to a whole-document conversion.
///
/// Metadata and status are carried over untouched.
pub fn spec_conversion(
    f: impl Fn(Value) -> Result<Value, ConversionError> + Send + Sync + 'static,
) -> impl Fn(Value) -> Result<Value, ConversionError> + Send + Sync + 'static {
    move |mut doc: Value| {
        let map = doc
            .as_object_mut()
            .ok_or_else(|| ConversionError::malformed("document is not an object"))?;
        let spec = map.remove("spec").unwrap_or(Value::Null);
        map.insert("spec".into(), f(spec)?);
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(version: &str) -> Gvk {
        Gvk::new("apps.fleet.io", version, "App")
    }

    /// v1: `{"replicas": n}`; v2: `{"scale": {"replicas": n}}`; hub: `{"count": n}`.
    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog.register_version(
            &v("v1"),
            spec_conversion(|spec| Ok(json!({"count": spec["replicas"]}))),
            spec_conversion(|spec| Ok(json!({"replicas": spec["count"]}))),
        );
        catalog.register_version(
            &v("v2"),
            spec_conversion(|spec| Ok(json!({"count": spec["scale"]["replicas"]}))),
            spec_conversion(|spec| Ok(json!({"scale": {"replicas": spec["count"]}}))),
        );
        catalog
    }

    fn doc(version: &str, spec: Value) -> Value {
        json!({
            "apiVersion": v(version).api_version_string(),
            "kind": "App",
            "metadata": {"name": "web", "namespace": "prod"},
            "spec": spec,
        })
    }

    #[test]
    fn identity_conversion_is_untouched() {
        let catalog = catalog();
        let input = doc("v1", json!({"replicas": 3}));
        let out = catalog.convert(input.clone(), &v("v1"), &v("v1")).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn versions_convert_through_hub() {
        let catalog = catalog();
        let out = catalog
            .convert(doc("v1", json!({"replicas": 3})), &v("v1"), &v("v2"))
            .unwrap();

        assert_eq!(out["apiVersion"], "apps.fleet.io/v2");
        assert_eq!(out["spec"], json!({"scale": {"replicas": 3}}));
        assert_eq!(out["metadata"]["name"], "web");
    }

    #[test]
    fn direct_conversion_wins_over_hub() {
        let mut catalog = catalog();
        catalog.register_conversion(&v("v1"), &v("v2"), |_| {
            Ok(json!({"spec": {"scale": {"replicas": 99}}}))
        });

        let out = catalog
            .convert(doc("v1", json!({"replicas": 3})), &v("v1"), &v("v2"))
            .unwrap();
        assert_eq!(out["spec"]["scale"]["replicas"], 99);
    }

    #[test]
    fn unknown_version_is_an_error() {
        let catalog = catalog();
        let err = catalog
            .convert(doc("v3", json!({})), &v("v3"), &v("v1"))
            .unwrap_err();
        assert!(matches!(err, ConversionError::NoConversion { .. }));
    }

    #[test]
    fn different_kinds_never_convert() {
        let catalog = catalog();
        let other = Gvk::new("apps.fleet.io", "v1", "Host");
        let err = catalog
            .convert(doc("v1", json!({})), &v("v1"), &other)
            .unwrap_err();
        assert!(matches!(err, ConversionError::NoConversion { .. }));
    }

    #[test]
    fn registered_versions_are_listed() {
        let catalog = catalog();
        assert!(catalog.is_registered(&v("v2")));
        assert!(!catalog.is_registered(&v("v3")));
        assert_eq!(catalog.versions("apps.fleet.io", "App"), vec!["v1", "v2"]);
    }
}
