//! The Prometheus `file_sd` output model and the label names generated for
//! Compute Engine instances.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Joins tags, ports and delegating instances.
pub const SEPARATOR: &str = ",";

pub const PROJECT_LABEL: &str = "__meta_gce_project";
pub const ZONE_LABEL: &str = "__meta_gce_zone";
pub const REGION_LABEL: &str = "__meta_gce_region";
pub const NETWORK_LABEL: &str = "__meta_gce_network";
pub const SUBNETWORK_LABEL: &str = "__meta_gce_subnetwork";
pub const PUBLIC_IP_LABEL: &str = "__meta_gce_public_ip";
pub const PRIVATE_IP_LABEL: &str = "__meta_gce_private_ip";
pub const INSTANCE_NAME_LABEL: &str = "__meta_gce_instance_name";
pub const INSTANCE_STATUS_LABEL: &str = "__meta_gce_instance_status";
pub const TAGS_LABEL: &str = "__meta_gce_tags";
pub const NAME_LABEL: &str = "__meta_gce_name";
pub const DELEGATE_FOR_LABEL: &str = "__meta_gce_delegate_for_instances";
pub const METADATA_LABEL_PREFIX: &str = "__meta_gce_metadata_";
pub const LABEL_LABEL_PREFIX: &str = "__meta_gce_label_";

pub type LabelSet = BTreeMap<String, String>;

/// A `<static_config>` of Prometheus, one element of the `file_sd` JSON array.
///
/// The derived ordering compares targets first and labels second, so a
/// sorted list is a stable representation of an unordered collection.
#[derive(Clone, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    pub labels: LabelSet,
}

/// Replace every character not allowed in a Prometheus label name with `_`.
pub fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Join `items` with the separator and surround the result with it too, so
/// relabeling regexes like `.*,web,.*` never care about the position.
pub fn join_padded<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut joined = String::from(SEPARATOR);
    for item in items {
        joined.push_str(item.as_ref());
        joined.push_str(SEPARATOR);
    }

    joined
}
