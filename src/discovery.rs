use async_trait::async_trait;
use gcp::compute::{InstanceAggregatedList, Region, RegionList};
use gcp::{ListParams, Page};

use crate::synthesizer::{Regions, Synthesizer, UnknownZone};
use crate::targets::TargetGroup;

/// Only instances carrying the `prometheus` label are listed.
pub const PRESENCE_FILTER: &str = "(labels.prometheus eq .*)";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("list instances of project {project} failed, {source}")]
    ListInstances {
        project: String,
        #[source]
        source: gcp::Error,
    },

    #[error("list regions of project {project} failed, {source}")]
    ListRegions {
        project: String,
        #[source]
        source: gcp::Error,
    },

    #[error("discover project {project} failed, {source}")]
    UnknownZone {
        project: String,
        #[source]
        source: UnknownZone,
    },

    #[error("discovery workers are gone")]
    PoolClosed,
}

/// The Compute Engine listing calls discovery depends on.
#[async_trait]
pub trait Compute: Send + Sync {
    async fn instances(
        &self,
        project: &str,
        params: &ListParams,
    ) -> Result<InstanceAggregatedList, gcp::Error>;

    async fn regions(&self, project: &str, params: &ListParams) -> Result<RegionList, gcp::Error>;
}

#[async_trait]
impl Compute for gcp::Client {
    async fn instances(
        &self,
        project: &str,
        params: &ListParams,
    ) -> Result<InstanceAggregatedList, gcp::Error> {
        gcp::Client::instances(self, project, params).await
    }

    async fn regions(&self, project: &str, params: &ListParams) -> Result<RegionList, gcp::Error> {
        gcp::Client::regions(self, project, params).await
    }
}

/// AND the presence filter with the filter of the request.
pub fn instance_filter(filter: Option<&str>) -> String {
    match filter.map(str::trim) {
        Some(filter) if !filter.is_empty() => format!("{PRESENCE_FILTER} AND {filter}"),
        _ => PRESENCE_FILTER.to_string(),
    }
}

async fn list_regions(compute: &dyn Compute, project: &str) -> Result<Vec<Region>, Error> {
    let mut regions = vec![];
    let mut page_token = None::<String>;

    loop {
        let params = ListParams::default().page(page_token.as_deref());
        let page = compute
            .regions(project, &params)
            .await
            .map_err(|source| Error::ListRegions {
                project: project.to_string(),
                source,
            })?;

        page_token = page.next_page_token().map(ToString::to_string);
        regions.extend(page.items);

        if page_token.is_none() {
            break;
        }
    }

    Ok(regions)
}

/// One discovery pass over every page of instances of `project`.
///
/// Any failure discards the groups synthesized so far.
pub async fn discover(
    compute: &dyn Compute,
    project: &str,
    filter: Option<&str>,
    region_lookup: bool,
) -> Result<Vec<TargetGroup>, Error> {
    let regions = if region_lookup {
        Regions::lookup(list_regions(compute, project).await?)
    } else {
        Regions::ZoneSuffix
    };

    let filter = instance_filter(filter);
    let mut synthesizer = Synthesizer::new(project, &regions);
    let mut page_token = None::<String>;
    let mut pages = 0;

    loop {
        let params = ListParams {
            filter: Some(filter.clone()),
            page_token: page_token.take(),
        };
        let page = compute
            .instances(project, &params)
            .await
            .map_err(|source| Error::ListInstances {
                project: project.to_string(),
                source,
            })?;

        pages += 1;
        page_token = page.next_page_token().map(ToString::to_string);

        for instance in page.into_instances() {
            synthesizer
                .push(&instance)
                .map_err(|source| Error::UnknownZone {
                    project: project.to_string(),
                    source,
                })?;
        }

        if page_token.is_none() {
            break;
        }
    }

    let groups = synthesizer.finish();
    debug!(
        message = "project discovered",
        %project,
        pages,
        groups = groups.len()
    );

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCompute, instance};

    #[test]
    fn filters() {
        assert_eq!(instance_filter(None), "(labels.prometheus eq .*)");
        assert_eq!(instance_filter(Some("  ")), "(labels.prometheus eq .*)");
        assert_eq!(
            instance_filter(Some("(status eq RUNNING)")),
            "(labels.prometheus eq .*) AND (status eq RUNNING)"
        );
    }

    #[tokio::test]
    async fn every_page_is_synthesized() {
        let compute = FakeCompute::default().project(
            "p1",
            vec![
                vec![instance("a", "10.0.0.1", &[("prometheus_delegate_address_db", "10.0.0.9")])],
                vec![],
                vec![instance("b", "10.0.0.2", &[("prometheus_delegate_ports_db", "5432")])],
            ],
        );

        let groups = discover(&compute, "p1", Some("(status eq RUNNING)"), false)
            .await
            .unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].targets, ["10.0.0.9:5432"]);
        assert_eq!(
            compute.filters(),
            ["(labels.prometheus eq .*) AND (status eq RUNNING)"; 3]
        );
    }

    #[tokio::test]
    async fn page_failure_discards_the_project() {
        let compute = FakeCompute::default()
            .project(
                "p1",
                vec![
                    vec![instance("a", "10.0.0.1", &[("prometheus_ports", "9100")])],
                    vec![instance("b", "10.0.0.2", &[("prometheus_ports", "9100")])],
                ],
            )
            .fail_at("p1", 1);

        let err = discover(&compute, "p1", None, false).await.unwrap_err();
        assert!(matches!(err, Error::ListInstances { ref project, .. } if project == "p1"));
    }

    #[tokio::test]
    async fn region_lookup() {
        let compute = FakeCompute::default()
            .project(
                "p1",
                vec![vec![instance("a", "10.0.0.1", &[("prometheus_ports", "9100")])]],
            )
            .regions(vec![Region {
                name: "us-central1".to_string(),
                zones: vec![
                    "https://www.googleapis.com/compute/v1/projects/p1/zones/us-central1-a"
                        .to_string(),
                ],
                status: "UP".to_string(),
            }]);

        let groups = discover(&compute, "p1", None, true).await.unwrap();
        assert_eq!(groups.len(), 1);

        let compute = FakeCompute::default().project(
            "p1",
            vec![vec![instance("a", "10.0.0.1", &[("prometheus_ports", "9100")])]],
        );
        let err = discover(&compute, "p1", None, true).await.unwrap_err();
        assert!(matches!(err, Error::UnknownZone { .. }));
    }
}
