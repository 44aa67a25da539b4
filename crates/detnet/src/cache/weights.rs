//! # Pretrained Weight Sources
//!
//! A [`WeightSourceMap`] maps a short name (``resnet18``) to a
//! [`PretrainedWeightsDescriptor`]. The map is always passed explicitly;
//! there is no global registry.

use crate::cache::disk::DiskCacheConfig;
use crate::error::DetNetError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const X25: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);

/// Build a cache key (bare cache file name) from a name and URL.
///
/// The key is ``{name}-{url crc}-{url basename}``, or ``{url crc}-{url basename}``.
pub fn url_to_cache_key(
    name: Option<&str>,
    url: &str,
) -> String {
    let hash = X25.checksum(url.as_bytes()).to_string();
    let base_name = url.rsplit_once('/').map_or(url, |(_, base)| base);
    match name {
        Some(n) => format!("{n}-{hash}-{base_name}"),
        None => format!("{hash}-{base_name}"),
    }
}

/// Get the cache resource key for a pretrained weights file.
pub fn pretrained_weights_resource_key(cache_key: &str) -> Vec<String> {
    vec!["weights".to_string(), cache_key.to_string()]
}

/// Static [`PretrainedWeightsDescriptor`] provider.
#[derive(Debug)]
pub struct StaticPretrainedWeightsDescriptor<'a> {
    /// Name of the weight source.
    pub name: &'a str,

    /// Description of the weights.
    pub description: &'a str,

    /// License.
    pub license: Option<&'a str>,

    /// Source URL.
    pub origin: Option<&'a str>,

    /// URLs to download the weights from; the first is used.
    pub urls: &'a [&'a str],
}

impl StaticPretrainedWeightsDescriptor<'_> {
    /// Convert to a [`PretrainedWeightsDescriptor`].
    pub fn to_descriptor(&self) -> PretrainedWeightsDescriptor {
        PretrainedWeightsDescriptor {
            name: self.name.to_string(),
            description: self.description.to_string(),
            license: self.license.map(str::to_string),
            origin: self.origin.map(str::to_string),
            urls: self.urls.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A descriptor for a pretrained weights file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PretrainedWeightsDescriptor {
    /// Name of the weight source.
    pub name: String,

    /// Description of the weights.
    pub description: String,

    /// License.
    pub license: Option<String>,

    /// Source URL.
    pub origin: Option<String>,

    /// URLs to download the weights from; the first is used.
    pub urls: Vec<String>,
}

impl PretrainedWeightsDescriptor {
    /// The primary download URL.
    pub fn url(&self) -> anyhow::Result<&str> {
        self.urls
            .first()
            .map(String::as_str)
            .with_context(|| format!("weight source '{}' has no urls", self.name))
    }

    /// Cache Key
    ///
    /// The key is ``{name}-{url crc hash}-{url basename}``.
    pub fn cache_key(&self) -> anyhow::Result<String> {
        Ok(url_to_cache_key(Some(&self.name), self.url()?))
    }

    /// Read-Through Cache the Model Weights
    ///
    /// # Returns
    ///
    /// The disk location of the cached weights.
    pub fn fetch_weights_to_disk_cache(
        &self,
        disk_cache: &DiskCacheConfig,
    ) -> anyhow::Result<PathBuf> {
        let resource = pretrained_weights_resource_key(&self.cache_key()?);
        disk_cache.fetch_resource(self.url()?, &resource)
    }
}

/// Directory of [`PretrainedWeightsDescriptor`]s, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSourceMap {
    /// Map of descriptors.
    pub items: BTreeMap<String, PretrainedWeightsDescriptor>,
}

impl WeightSourceMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a descriptor under its name.
    pub fn with(
        mut self,
        descriptor: PretrainedWeightsDescriptor,
    ) -> Self {
        self.items.insert(descriptor.name.clone(), descriptor);
        self
    }

    /// Names of the registered sources.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// Lookup a descriptor by name.
    pub fn lookup_by_name(
        &self,
        name: &str,
    ) -> Option<&PretrainedWeightsDescriptor> {
        self.items.get(name)
    }

    /// Lookup a descriptor.
    pub fn try_lookup_by_name(
        &self,
        name: &str,
    ) -> Result<&PretrainedWeightsDescriptor, DetNetError> {
        self.lookup_by_name(name)
            .ok_or_else(|| DetNetError::UnknownWeightSource {
                name: name.to_string(),
                available: self.names().collect::<Vec<_>>().join(", "),
            })
    }
}

impl<'a> FromIterator<&'a StaticPretrainedWeightsDescriptor<'a>> for WeightSourceMap {
    fn from_iter<T: IntoIterator<Item = &'a StaticPretrainedWeightsDescriptor<'a>>>(
        iter: T
    ) -> Self {
        iter.into_iter()
            .fold(Self::new(), |map, d| map.with(d.to_descriptor()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static MY_MODEL: StaticPretrainedWeightsDescriptor = StaticPretrainedWeightsDescriptor {
        name: "my_model",
        description: "some description of my model.",
        license: Some("MIT"),
        origin: Some("https://github.com/my_org/my_model"),
        urls: &["https://example.com/w/my_model-abc.pth", "https://mirror/b.pth"],
    };

    #[test]
    fn test_static_descriptor_to_descriptor() {
        let d_desc = MY_MODEL.to_descriptor();
        assert_eq!(d_desc.name, "my_model");
        assert_eq!(d_desc.license.as_deref(), Some("MIT"));
        assert_eq!(d_desc.urls.len(), 2);
        assert_eq!(d_desc.url().unwrap(), "https://example.com/w/my_model-abc.pth");
    }

    #[test]
    fn test_url_to_cache_key() {
        let url = "https://example.com/w/my_model-abc.pth";
        let key = url_to_cache_key(Some("my_model"), url);
        assert!(key.starts_with("my_model-"));
        assert!(key.ends_with("-my_model-abc.pth"));

        // Stable per URL, distinct across URLs.
        assert_eq!(key, url_to_cache_key(Some("my_model"), url));
        assert_ne!(
            url_to_cache_key(None, url),
            url_to_cache_key(None, "https://example.com/v/my_model-abc.pth")
        );
    }

    #[test]
    fn test_weight_source_map_lookup() {
        let map: WeightSourceMap = [&MY_MODEL].into_iter().collect();
        assert!(map.lookup_by_name("my_model").is_some());

        match map.try_lookup_by_name("other") {
            Err(DetNetError::UnknownWeightSource { name, available }) => {
                assert_eq!(name, "other");
                assert_eq!(available, "my_model");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_descriptor_without_urls() {
        let mut desc = MY_MODEL.to_descriptor();
        desc.urls.clear();
        assert!(desc.url().is_err());
        assert!(desc.cache_key().is_err());
    }
}
