//! Per-handler object filters: label/annotation matches and body predicates.

use std::fmt;
use std::sync::Arc;

use orka_core::{FieldPath, Snapshot};
use serde_json::Value as Json;

pub type ValueCheck = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;
pub type BodyCheck = Arc<dyn Fn(&Snapshot) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum MetaFilter {
    /// Key present with exactly this value.
    Value(String),
    Present,
    Absent,
    /// Arbitrary check on the value (`None` when the key is absent).
    Check(ValueCheck),
}

impl MetaFilter {
    pub fn check<F>(f: F) -> Self
    where
        F: Fn(Option<&str>) -> bool + Send + Sync + 'static,
    {
        Self::Check(Arc::new(f))
    }

    fn accepts(&self, actual: Option<&str>) -> bool {
        match self {
            MetaFilter::Value(v) => actual == Some(v.as_str()),
            MetaFilter::Present => actual.is_some(),
            MetaFilter::Absent => actual.is_none(),
            MetaFilter::Check(f) => f(actual),
        }
    }
}

impl fmt::Debug for MetaFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaFilter::Value(v) => write!(f, "Value({:?})", v),
            MetaFilter::Present => write!(f, "Present"),
            MetaFilter::Absent => write!(f, "Absent"),
            MetaFilter::Check(_) => write!(f, "Check(..)"),
        }
    }
}

/// All filters must accept the object for a handler to match it.
#[derive(Clone, Default)]
pub struct Filters {
    labels: Vec<(String, MetaFilter)>,
    annotations: Vec<(String, MetaFilter)>,
    field_value: Option<(FieldPath, Json)>,
    when: Option<BodyCheck>,
}

impl fmt::Debug for Filters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filters")
            .field("labels", &self.labels)
            .field("annotations", &self.annotations)
            .field("field_value", &self.field_value)
            .field("when", &self.when.as_ref().map(|_| ".."))
            .finish()
    }
}

impl Filters {
    pub fn new() -> Self { Self::default() }

    pub fn label(mut self, key: &str, f: MetaFilter) -> Self {
        self.labels.push((key.to_string(), f));
        self
    }

    pub fn annotation(mut self, key: &str, f: MetaFilter) -> Self {
        self.annotations.push((key.to_string(), f));
        self
    }

    pub fn field_value(mut self, path: &str, value: Json) -> Self {
        self.field_value = Some((FieldPath::parse(path), value));
        self
    }

    pub fn when<F>(mut self, f: F) -> Self
    where
        F: Fn(&Snapshot) -> bool + Send + Sync + 'static,
    {
        self.when = Some(Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty() && self.field_value.is_none() && self.when.is_none()
    }

    pub fn matches(&self, body: &Snapshot) -> bool {
        self.labels.iter().all(|(k, f)| f.accepts(body.label(k)))
            && self.annotations.iter().all(|(k, f)| f.accepts(body.annotation(k)))
            && self.field_value.as_ref().map(|(p, v)| body.get(p) == Some(v)).unwrap_or(true)
            && self.when.as_ref().map(|f| f(body)).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> Snapshot {
        Snapshot::new(json!({
            "metadata": {"name": "x", "labels": {"app": "web", "tier": "front"}, "annotations": {"owner": "team-a"}},
            "spec": {"mode": "fast", "replicas": 3}
        }))
    }

    #[test]
    fn label_and_annotation_filters() {
        let b = body();
        assert!(Filters::new().label("app", MetaFilter::Value("web".into())).matches(&b));
        assert!(!Filters::new().label("app", MetaFilter::Value("db".into())).matches(&b));
        assert!(Filters::new().label("tier", MetaFilter::Present).matches(&b));
        assert!(Filters::new().label("canary", MetaFilter::Absent).matches(&b));
        assert!(!Filters::new().annotation("owner", MetaFilter::Absent).matches(&b));
        assert!(Filters::new().annotation("owner", MetaFilter::check(|v| v.map(|s| s.starts_with("team-")).unwrap_or(false))).matches(&b));
    }

    #[test]
    fn field_and_predicate_filters() {
        let b = body();
        assert!(Filters::new().field_value("spec.mode", json!("fast")).matches(&b));
        assert!(!Filters::new().field_value("spec.mode", json!("slow")).matches(&b));
        assert!(Filters::new().when(|b| b.spec()["replicas"].as_i64() == Some(3)).matches(&b));
        let all = Filters::new().label("app", MetaFilter::Present).when(|_| false);
        assert!(!all.matches(&b));
        assert!(Filters::new().is_empty());
    }
}
