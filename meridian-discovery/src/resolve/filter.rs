//! Candidate filters applied during resolution

use crate::discovery::ServiceInstance;

/// Predicate over instances. A candidate must pass every filter in a chain.
pub trait InstanceFilter: Send + Sync {
    fn matches(&self, instance: &ServiceInstance) -> bool;
}

impl<F> InstanceFilter for F
where
    F: Fn(&ServiceInstance) -> bool + Send + Sync,
{
    fn matches(&self, instance: &ServiceInstance) -> bool {
        self(instance)
    }
}

/// Instance carries every listed tag
#[derive(Debug, Clone)]
pub struct TagFilter {
    tags: Vec<String>,
}

impl TagFilter {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

impl InstanceFilter for TagFilter {
    fn matches(&self, instance: &ServiceInstance) -> bool {
        self.tags.iter().all(|tag| instance.has_tag(tag))
    }
}

/// Exact version match
#[derive(Debug, Clone)]
pub struct VersionFilter {
    version: String,
}

impl VersionFilter {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl InstanceFilter for VersionFilter {
    fn matches(&self, instance: &ServiceInstance) -> bool {
        instance.version == self.version
    }
}

/// Metadata key present with the given value
#[derive(Debug, Clone)]
pub struct MetadataFilter {
    key: String,
    value: String,
}

impl MetadataFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl InstanceFilter for MetadataFilter {
    fn matches(&self, instance: &ServiceInstance) -> bool {
        instance.metadata.get(&self.key) == Some(&self.value)
    }
}

pub(crate) fn passes_all<F>(filters: &[F], instance: &ServiceInstance) -> bool
where
    F: AsRef<dyn InstanceFilter>,
{
    filters.iter().all(|f| f.as_ref().matches(instance))
}

/// Keep the candidates that pass every filter, preserving order
pub fn apply_filters<F>(candidates: Vec<ServiceInstance>, filters: &[F]) -> Vec<ServiceInstance>
where
    F: AsRef<dyn InstanceFilter>,
{
    if filters.is_empty() {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|instance| passes_all(filters, instance))
        .collect()
}
