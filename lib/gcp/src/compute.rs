//! The subset of the Compute Engine v1 resources needed to describe
//! instances and regions.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::client::Page;

/// Access config type of an external IPv4 address.
pub const ONE_TO_ONE_NAT: &str = "ONE_TO_ONE_NAT";

/// Partial response mask of the aggregated instance list.
pub(crate) const INSTANCE_FIELDS: &str = "nextPageToken,items/*/instances(id,status,zone,name,tags,labels,networkInterfaces,selfLink,metadata)";

/// Instances of a project grouped by scope, e.g. `zones/us-central1-a`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAggregatedList {
    #[serde(default)]
    pub items: BTreeMap<String, InstancesScopedList>,

    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Page for InstanceAggregatedList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|s| !s.is_empty())
    }
}

impl InstanceAggregatedList {
    /// Consume the page and return every instance of every scope.
    pub fn into_instances(self) -> impl Iterator<Item = Instance> {
        self.items.into_values().flat_map(|scoped| scoped.instances)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct InstancesScopedList {
    /// Empty when the scope holds no instance, and the API explains that
    /// with a warning instead.
    #[serde(default)]
    pub instances: Vec<Instance>,

    #[serde(default)]
    pub warning: Option<Warning>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Warning {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// uint64 encoded as a string
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// URL of the zone, e.g.
    /// `https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a`
    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,

    #[serde(default)]
    pub tags: Option<Tags>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub metadata: Option<Metadata>,

    #[serde(default)]
    pub self_link: String,
}

impl Instance {
    pub fn tags(&self) -> &[String] {
        self.tags.as_ref().map_or(&[], |tags| tags.items.as_slice())
    }

    pub fn metadata(&self) -> &[MetadataItem] {
        self.metadata
            .as_ref()
            .map_or(&[], |metadata| metadata.items.as_slice())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub network: String,

    #[serde(default)]
    pub subnetwork: String,

    #[serde(default, rename = "networkIP")]
    pub network_ip: String,

    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default, rename = "type")]
    pub typ: String,

    #[serde(default, rename = "natIP")]
    pub nat_ip: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Tags {
    #[serde(default)]
    pub items: Vec<String>,

    #[serde(default)]
    pub fingerprint: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MetadataItem {
    pub key: String,

    /// The API omits the value of an empty entry.
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionList {
    #[serde(default)]
    pub items: Vec<Region>,

    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Page for RegionList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Region {
    pub name: String,

    /// Zone URLs of this region.
    #[serde(default)]
    pub zones: Vec<String>,

    #[serde(default)]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_aggregated_list() {
        let text = r#"{
            "items": {
                "zones/us-central1-a": {
                    "instances": [{
                        "id": "1234",
                        "name": "web-1",
                        "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a",
                        "status": "RUNNING",
                        "networkInterfaces": [{
                            "network": "https://www.googleapis.com/compute/v1/projects/p/global/networks/default",
                            "networkIP": "10.0.0.5",
                            "accessConfigs": [{"type": "ONE_TO_ONE_NAT", "natIP": "35.1.2.3"}]
                        }],
                        "tags": {"items": ["a", "b"]},
                        "labels": {"prometheus": "true"},
                        "metadata": {"items": [{"key": "prometheus_ports", "value": "9100"}, {"key": "empty"}]}
                    }]
                },
                "zones/europe-west1-b": {
                    "warning": {"code": "NO_RESULTS_ON_PAGE", "message": "There are no results"}
                }
            },
            "nextPageToken": "next"
        }"#;

        let list = serde_json::from_str::<InstanceAggregatedList>(text).unwrap();
        assert_eq!(list.next_page_token(), Some("next"));
        assert_eq!(list.items["zones/europe-west1-b"].instances.len(), 0);

        let instances = list.into_instances().collect::<Vec<_>>();
        assert_eq!(instances.len(), 1);

        let instance = &instances[0];
        assert_eq!(instance.name, "web-1");
        assert_eq!(instance.tags(), ["a", "b"]);
        assert_eq!(instance.network_interfaces[0].network_ip, "10.0.0.5");
        assert_eq!(instance.network_interfaces[0].access_configs[0].typ, ONE_TO_ONE_NAT);
        assert_eq!(instance.metadata()[1].value, None);
    }

    #[test]
    fn empty_page_token() {
        let list = serde_json::from_str::<RegionList>(r#"{"nextPageToken": ""}"#).unwrap();
        assert_eq!(list.next_page_token(), None);
        assert!(list.items.is_empty());
    }
}
