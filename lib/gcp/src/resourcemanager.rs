use serde::Deserialize;

use crate::client::Page;

/// Response of `GET /v1/projects` of the Cloud Resource Manager API.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListProjectsResponse {
    #[serde(default)]
    pub projects: Vec<Project>,

    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Page for ListProjectsResponse {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub lifecycle_state: String,
}
