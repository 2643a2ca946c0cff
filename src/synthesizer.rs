//! Turn the instances of one project into Prometheus target groups.
//!
//! Instances declare what to scrape with metadata entries:
//!
//! - `prometheus_ports_<name>=9100,9101` scrapes the instance itself on the
//!   listed ports, one target group per entry.
//! - `prometheus_delegate_address_<name>=10.0.0.9` and
//!   `prometheus_delegate_ports_<name>=5432` describe a host that is not an
//!   instance, e.g. a managed database. Every instance of the project may
//!   contribute the address or the ports, and the host becomes one target
//!   group per port once both are known.
//!
//! `<name>` may be omitted, e.g. `prometheus_ports=9100`, which yields an
//! empty name label.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use gcp::compute::{Instance, ONE_TO_ONE_NAT, Region};

use crate::targets::{
    DELEGATE_FOR_LABEL, INSTANCE_NAME_LABEL, INSTANCE_STATUS_LABEL, LABEL_LABEL_PREFIX, LabelSet,
    METADATA_LABEL_PREFIX, NAME_LABEL, NETWORK_LABEL, PRIVATE_IP_LABEL, PROJECT_LABEL,
    PUBLIC_IP_LABEL, REGION_LABEL, SEPARATOR, SUBNETWORK_LABEL, TAGS_LABEL, TargetGroup,
    ZONE_LABEL, join_padded, sanitize_label_name,
};

pub const PORTS_PREFIX: &str = "prometheus_ports_";
pub const DELEGATE_PORTS_PREFIX: &str = "prometheus_delegate_ports_";
pub const DELEGATE_ADDRESS_PREFIX: &str = "prometheus_delegate_address_";

/// Metadata keys are padded with it, so a naked prefix like `prometheus_ports`
/// matches `prometheus_ports_` too.
const KEY_PADDING: char = '_';

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("zone {zone} of instance {instance} is not part of any known region")]
pub struct UnknownZone {
    pub instance: String,
    pub zone: String,
}

/// How the region label is derived from the zone of an instance.
#[derive(Debug)]
pub enum Regions {
    /// Strip the zone letter, `us-central1-a` belongs to `us-central1`.
    ZoneSuffix,

    /// Zone name to region name, built from the regions listing of the
    /// project. Zones missing from it are an error.
    Lookup(HashMap<String, String>),
}

impl Regions {
    pub fn lookup(regions: impl IntoIterator<Item = Region>) -> Self {
        let mut zones = HashMap::new();
        for region in regions {
            for zone in &region.zones {
                zones.insert(last_segment(zone).to_string(), region.name.clone());
            }
        }

        Regions::Lookup(zones)
    }

    fn resolve(&self, zone: &str) -> Option<String> {
        let zone = last_segment(zone);

        match self {
            Regions::ZoneSuffix => Some(
                zone.rsplit_once('-')
                    .map_or(zone, |(region, _letter)| region)
                    .to_string(),
            ),
            Regions::Lookup(zones) => zones.get(zone).cloned(),
        }
    }
}

/// `https://.../zones/us-central1-a` -> `us-central1-a`
fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// Strip `prefix` from the padded metadata key and return the name after it,
/// or `None` if the key does not start with the prefix.
fn match_prefix<'a>(padded: &'a str, prefix: &str) -> Option<&'a str> {
    padded
        .strip_prefix(prefix)
        .map(|name| name.trim_end_matches(KEY_PADDING))
}

/// Invalid ports are skipped, whitespace included.
fn parse_ports(value: &str) -> impl Iterator<Item = u16> + '_ {
    value
        .split(SEPARATOR)
        .filter_map(|port| port.parse::<u16>().ok())
}

/// A scrape target which is not an instance itself.
#[derive(Debug, Default)]
struct DelegatedHost {
    address: String,
    ports: BTreeSet<u16>,
    /// Self links of the instances which declared the host.
    delegate_for: Vec<String>,
}

impl DelegatedHost {
    fn delegated_by(&mut self, self_link: &str) {
        if !self.delegate_for.iter().any(|link| link == self_link) {
            self.delegate_for.push(self_link.to_string());
        }
    }
}

/// Accumulates the target groups of one discovery pass of a single project.
///
/// Delegated hosts are merged across all instances pushed, so every instance
/// of the project must go through the same synthesizer before `finish`.
pub struct Synthesizer<'a> {
    project: &'a str,
    regions: &'a Regions,
    groups: Vec<TargetGroup>,
    delegated: BTreeMap<String, DelegatedHost>,
}

impl<'a> Synthesizer<'a> {
    pub fn new(project: &'a str, regions: &'a Regions) -> Self {
        Synthesizer {
            project,
            regions,
            groups: vec![],
            delegated: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, instance: &Instance) -> Result<(), UnknownZone> {
        // nothing to scrape
        let Some(primary) = instance.network_interfaces.first() else {
            return Ok(());
        };

        let region = self
            .regions
            .resolve(&instance.zone)
            .ok_or_else(|| UnknownZone {
                instance: instance.name.clone(),
                zone: instance.zone.clone(),
            })?;

        let mut labels = LabelSet::from([
            (PROJECT_LABEL.to_string(), self.project.to_string()),
            (ZONE_LABEL.to_string(), instance.zone.clone()),
            (REGION_LABEL.to_string(), region),
            (INSTANCE_NAME_LABEL.to_string(), instance.name.clone()),
            (INSTANCE_STATUS_LABEL.to_string(), instance.status.clone()),
            (NETWORK_LABEL.to_string(), primary.network.clone()),
            (SUBNETWORK_LABEL.to_string(), primary.subnetwork.clone()),
            (PRIVATE_IP_LABEL.to_string(), primary.network_ip.clone()),
        ]);

        if let Some(access) = primary.access_configs.first()
            && access.typ == ONE_TO_ONE_NAT
        {
            labels.insert(PUBLIC_IP_LABEL.to_string(), access.nat_ip.clone());
        }

        let tags = instance.tags();
        if !tags.is_empty() {
            labels.insert(TAGS_LABEL.to_string(), join_padded(tags));
        }

        for (key, value) in &instance.labels {
            labels.insert(
                format!("{LABEL_LABEL_PREFIX}{}", sanitize_label_name(key)),
                value.clone(),
            );
        }

        // groups of this instance start here, metadata labels are added to
        // them only
        let first = self.groups.len();

        for item in instance.metadata() {
            let Some(value) = item.value.as_deref() else {
                continue;
            };
            let padded = format!("{}{KEY_PADDING}", item.key);

            if let Some(name) = match_prefix(&padded, PORTS_PREFIX) {
                let targets = parse_ports(value)
                    .map(|port| format!("{}:{port}", primary.network_ip))
                    .collect();

                let mut labels = labels.clone();
                labels.insert(NAME_LABEL.to_string(), name.to_string());

                self.groups.push(TargetGroup { targets, labels });
                continue;
            }

            if let Some(name) = match_prefix(&padded, DELEGATE_PORTS_PREFIX) {
                let host = self.delegated.entry(name.to_string()).or_default();
                host.ports.extend(parse_ports(value));
                host.delegated_by(&instance.self_link);
                continue;
            }

            if let Some(name) = match_prefix(&padded, DELEGATE_ADDRESS_PREFIX) {
                let host = self.delegated.entry(name.to_string()).or_default();
                host.address = value.to_string();
                host.delegated_by(&instance.self_link);
            }
        }

        if first < self.groups.len() {
            for item in instance.metadata() {
                let Some(value) = item.value.as_deref() else {
                    continue;
                };

                let name = format!("{METADATA_LABEL_PREFIX}{}", sanitize_label_name(&item.key));
                for group in &mut self.groups[first..] {
                    group.labels.insert(name.clone(), value.to_string());
                }
            }
        }

        Ok(())
    }

    /// Flatten the delegated hosts and return every target group.
    pub fn finish(self) -> Vec<TargetGroup> {
        let Synthesizer {
            mut groups,
            delegated,
            ..
        } = self;

        for (name, host) in delegated {
            if host.address.is_empty() || host.ports.is_empty() {
                trace!(
                    message = "drop incomplete delegated host",
                    %name,
                    address = %host.address,
                    ports = host.ports.len()
                );
                continue;
            }

            let labels = LabelSet::from([
                (DELEGATE_FOR_LABEL.to_string(), join_padded(&host.delegate_for)),
                (NAME_LABEL.to_string(), name),
            ]);

            for port in host.ports {
                groups.push(TargetGroup {
                    targets: vec![format!("{}:{port}", host.address)],
                    labels: labels.clone(),
                });
            }
        }

        groups
    }
}
