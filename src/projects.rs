use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use gcp::{ListParams, Page};
use regex::Regex;

const PROJECT_SEPARATOR: char = ',';

/// A de-duplicated set of project ids.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProjectSet(BTreeSet<String>);

impl ProjectSet {
    /// Parse a comma separated list like `project-a, project-b`, empty
    /// entries are skipped.
    pub fn parse(raw: &str) -> Self {
        raw.split(PROJECT_SEPARATOR).map(str::to_string).collect()
    }

    pub fn union(&self, other: &ProjectSet) -> ProjectSet {
        ProjectSet(self.0.union(&other.0).cloned().collect())
    }

    /// Drop every project matching `pattern`.
    pub fn exclude(mut self, pattern: Option<&Regex>) -> Self {
        if let Some(pattern) = pattern {
            self.0.retain(|project| !pattern.is_match(project));
        }

        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl Extend<String> for ProjectSet {
    fn extend<T: IntoIterator<Item = String>>(&mut self, iter: T) {
        for project in iter {
            let project = project.trim();
            if !project.is_empty() {
                self.0.insert(project.to_string());
            }
        }
    }
}

impl FromIterator<String> for ProjectSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        let mut set = ProjectSet::default();
        set.extend(iter);
        set
    }
}

impl Display for ProjectSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (index, project) in self.0.iter().enumerate() {
            if index != 0 {
                f.write_str(",")?;
            }
            f.write_str(project)?;
        }

        Ok(())
    }
}

/// Lists every project the credentials can see.
#[async_trait]
pub trait ProjectLister: Send + Sync {
    async fn projects(&self) -> Result<Vec<String>, gcp::Error>;
}

#[async_trait]
impl ProjectLister for gcp::Client {
    async fn projects(&self) -> Result<Vec<String>, gcp::Error> {
        let mut projects = vec![];
        let mut page_token = None::<String>;

        loop {
            let params = ListParams::default().page(page_token.as_deref());
            let resp = gcp::Client::projects(self, &params).await?;

            page_token = resp.next_page_token().map(ToString::to_string);
            projects.extend(resp.projects.into_iter().map(|project| project.project_id));

            if page_token.is_none() {
                break;
            }
        }

        debug!(message = "projects discovered", count = projects.len());

        Ok(projects)
    }
}
