//! Scripted fakes of the Google APIs for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gcp::ListParams;
use gcp::compute::{
    Instance, InstanceAggregatedList, InstancesScopedList, Metadata, MetadataItem,
    NetworkInterface, Region, RegionList,
};
use http::StatusCode;
use tokio::sync::Notify;

use crate::discovery::Compute;
use crate::projects::ProjectLister;

pub const ZONE: &str = "https://www.googleapis.com/compute/v1/projects/p1/zones/us-central1-a";

/// An instance in `us-central1-a` with one network interface.
pub fn instance(name: &str, ip: &str, metadata: &[(&str, &str)]) -> Instance {
    Instance {
        id: String::new(),
        name: name.to_string(),
        zone: ZONE.to_string(),
        status: "RUNNING".to_string(),
        network_interfaces: vec![NetworkInterface {
            name: "nic0".to_string(),
            network: "default".to_string(),
            subnetwork: "default".to_string(),
            network_ip: ip.to_string(),
            access_configs: vec![],
        }],
        tags: None,
        labels: BTreeMap::from([("prometheus".to_string(), "true".to_string())]),
        metadata: Some(Metadata {
            items: metadata
                .iter()
                .map(|(key, value)| MetadataItem {
                    key: key.to_string(),
                    value: Some(value.to_string()),
                })
                .collect(),
        }),
        self_link: format!("{ZONE}/instances/{name}"),
    }
}

/// Serves pages of instances per project, the page token is the page index.
#[derive(Default)]
pub struct FakeCompute {
    projects: HashMap<String, Vec<Vec<Instance>>>,
    fail_at: HashMap<String, usize>,
    hanging: HashSet<String>,
    gates: HashMap<String, Arc<Notify>>,
    regions: Vec<Region>,

    /// (project, filter) of every instances call
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeCompute {
    pub fn project(mut self, name: &str, pages: Vec<Vec<Instance>>) -> Self {
        self.projects.insert(name.to_string(), pages);
        self
    }

    /// Listing the page `page` of `project` fails.
    pub fn fail_at(mut self, project: &str, page: usize) -> Self {
        self.fail_at.insert(project.to_string(), page);
        self
    }

    /// Listing `project` never returns.
    pub fn hanging(mut self, project: &str) -> Self {
        self.hanging.insert(project.to_string());
        self
    }

    /// Listing `project` waits until `gate` is notified.
    pub fn gated(mut self, project: &str, gate: Arc<Notify>) -> Self {
        self.gates.insert(project.to_string(), gate);
        self
    }

    pub fn regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    /// Projects of every instances call in call order, one per page.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(project, _filter)| project.clone())
            .collect()
    }

    pub fn filters(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_project, filter)| filter.clone())
            .collect()
    }
}

#[async_trait]
impl Compute for FakeCompute {
    async fn instances(
        &self,
        project: &str,
        params: &ListParams,
    ) -> Result<InstanceAggregatedList, gcp::Error> {
        self.calls.lock().unwrap().push((
            project.to_string(),
            params.filter.clone().unwrap_or_default(),
        ));

        if self.hanging.contains(project) {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = self.gates.get(project) {
            gate.notified().await;
        }

        let Some(pages) = self.projects.get(project) else {
            return Err(gcp::Error::UnexpectedStatus(StatusCode::NOT_FOUND));
        };

        let index = params
            .page_token
            .as_deref()
            .map_or(0, |token| token.parse::<usize>().unwrap());
        if self.fail_at.get(project) == Some(&index) {
            return Err(gcp::Error::UnexpectedStatus(
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }

        let instances = pages.get(index).cloned().unwrap_or_default();
        Ok(InstanceAggregatedList {
            items: BTreeMap::from([(
                "zones/us-central1-a".to_string(),
                InstancesScopedList {
                    instances,
                    warning: None,
                },
            )]),
            next_page_token: (index + 1 < pages.len()).then(|| (index + 1).to_string()),
        })
    }

    async fn regions(&self, _project: &str, _params: &ListParams) -> Result<RegionList, gcp::Error> {
        Ok(RegionList {
            items: self.regions.clone(),
            next_page_token: None,
        })
    }
}

/// Answers project listings from a script, an exhausted script lists nothing.
#[derive(Default)]
pub struct FakeProjects {
    responses: Mutex<VecDeque<Result<Vec<String>, StatusCode>>>,
}

impl FakeProjects {
    pub fn respond(self, response: Result<Vec<&str>, StatusCode>) -> Self {
        self.responses.lock().unwrap().push_back(
            response.map(|projects| projects.into_iter().map(ToString::to_string).collect()),
        );
        self
    }
}

#[async_trait]
impl ProjectLister for FakeProjects {
    async fn projects(&self) -> Result<Vec<String>, gcp::Error> {
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(projects)) => Ok(projects),
            Some(Err(status)) => Err(gcp::Error::UnexpectedStatus(status)),
            None => Ok(vec![]),
        }
    }
}
