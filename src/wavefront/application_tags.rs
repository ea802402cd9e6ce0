use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use std::collections::BTreeMap;

pub const APPLICATION_TAG_KEY: &str = "application";
pub const SERVICE_TAG_KEY: &str = "service";
pub const CLUSTER_TAG_KEY: &str = "cluster";
pub const SHARD_TAG_KEY: &str = "shard";
pub const NULL_TAG_VALUE: &str = "none";

/// Identity metadata attached to everything the reporter and tracer send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationTags {
    application: String,
    service: String,
    cluster: Option<String>,
    shard: Option<String>,
    custom_tags: BTreeMap<String, String>,
}

impl ApplicationTags {
    pub fn builder(
        application: impl Into<String>,
        service: impl Into<String>,
    ) -> ApplicationTagsBuilder {
        ApplicationTagsBuilder {
            application: application.into(),
            service: service.into(),
            cluster: None,
            shard: None,
            custom_tags: BTreeMap::new(),
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn shard(&self) -> Option<&str> {
        self.shard.as_deref()
    }

    pub fn custom_tags(&self) -> &BTreeMap<String, String> {
        &self.custom_tags
    }

    /// Point tags in the order Wavefront expects them, followed by custom tags.
    pub fn to_point_tags(&self) -> Vec<(String, String)> {
        let mut tags = vec![
            (APPLICATION_TAG_KEY.to_string(), self.application.clone()),
            (SERVICE_TAG_KEY.to_string(), self.service.clone()),
            (
                CLUSTER_TAG_KEY.to_string(),
                self.cluster.clone().unwrap_or_else(|| NULL_TAG_VALUE.to_string()),
            ),
            (
                SHARD_TAG_KEY.to_string(),
                self.shard.clone().unwrap_or_else(|| NULL_TAG_VALUE.to_string()),
            ),
        ];
        tags.extend(
            self.custom_tags
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        tags
    }

    pub fn to_resource(&self) -> Resource {
        let mut attributes = vec![KeyValue::new(SERVICE_NAME, self.service.clone())];
        attributes.extend(
            self.to_point_tags()
                .into_iter()
                .map(|(key, value)| KeyValue::new(key, value)),
        );
        Resource::new(attributes)
    }
}

#[derive(Debug)]
pub struct ApplicationTagsBuilder {
    application: String,
    service: String,
    cluster: Option<String>,
    shard: Option<String>,
    custom_tags: BTreeMap<String, String>,
}

impl ApplicationTagsBuilder {
    pub fn cluster(mut self, cluster: Option<impl Into<String>>) -> Self {
        self.cluster = cluster.map(Into::into);
        self
    }

    pub fn shard(mut self, shard: Option<impl Into<String>>) -> Self {
        self.shard = shard.map(Into::into);
        self
    }

    pub fn custom_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_tags.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> ApplicationTags {
        ApplicationTags {
            application: self.application,
            service: self.service,
            cluster: self.cluster,
            shard: self.shard,
            custom_tags: self.custom_tags,
        }
    }
}
