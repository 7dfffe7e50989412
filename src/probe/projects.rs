//! Project listing: resource-manager pages and the merge with the preview project.

use serde::Deserialize;

use crate::roster::ProjectRef;

/// Upper bound on resource-manager pages fetched for one listing.
pub const MAX_PROJECT_PAGES: usize = 20;

/// Lifecycle state of projects offered for selection.
const ACTIVE_STATE: &str = "ACTIVE";

/// One page of `GET /v1/projects`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPage {
    #[serde(default)]
    pub projects: Vec<ProjectSummary>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub lifecycle_state: Option<String>,
}

impl ProjectPage {
    /// Ids of the active projects on this page.
    pub fn active_ids(&self) -> impl Iterator<Item = &str> {
        self.projects
            .iter()
            .filter(|p| p.lifecycle_state.as_deref() == Some(ACTIVE_STATE))
            .filter_map(|p| p.project_id.as_deref())
    }

    /// Token for the next page, if there is one.
    pub fn next_token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Display label for the preview project.
pub fn preview_label(id: &str) -> String {
    format!("{id} (preview project)")
}

/// Combine the two independently fetched halves of a project listing.
///
/// The preview project (if any) comes first with a distinguishing label,
/// followed by the active projects in ascending order, without repeating
/// the preview id. Either half may be missing.
pub fn merge_projects(preview: Option<String>, active: Option<Vec<String>>) -> Vec<ProjectRef> {
    let mut tail = active.unwrap_or_default();
    tail.sort();
    tail.dedup();

    let mut merged = Vec::with_capacity(tail.len() + 1);
    if let Some(ref id) = preview {
        merged.push(ProjectRef::new(id.clone(), preview_label(id)));
    }
    merged.extend(
        tail.into_iter()
            .filter(|id| preview.as_deref() != Some(id.as_str()))
            .map(ProjectRef::bare),
    );
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(projects: &[ProjectRef]) -> Vec<&str> {
        projects.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn preview_first_then_sorted() {
        let merged = merge_projects(
            Some("proj-preview".to_string()),
            Some(vec!["zeta".to_string(), "alpha".to_string()]),
        );

        assert_eq!(ids(&merged), vec!["proj-preview", "alpha", "zeta"]);
        assert_eq!(merged[0].name, "proj-preview (preview project)");
        assert_eq!(merged[1].name, "alpha");
    }

    #[test]
    fn preview_not_repeated_in_tail() {
        let merged = merge_projects(
            Some("beta".to_string()),
            Some(vec!["gamma".to_string(), "beta".to_string(), "alpha".to_string()]),
        );
        assert_eq!(ids(&merged), vec!["beta", "alpha", "gamma"]);
    }

    #[test]
    fn missing_halves_degrade_to_empty() {
        assert!(merge_projects(None, None).is_empty());
        assert_eq!(
            ids(&merge_projects(None, Some(vec!["b".into(), "a".into()]))),
            vec!["a", "b"]
        );
        assert_eq!(ids(&merge_projects(Some("p".into()), None)), vec!["p"]);
    }

    #[test]
    fn page_keeps_only_active_projects() {
        let page: ProjectPage = serde_json::from_value(serde_json::json!({
            "projects": [
                {"projectId": "live", "lifecycleState": "ACTIVE"},
                {"projectId": "doomed", "lifecycleState": "DELETE_REQUESTED"},
                {"lifecycleState": "ACTIVE"}
            ],
            "nextPageToken": ""
        }))
        .unwrap();

        assert_eq!(page.active_ids().collect::<Vec<_>>(), vec!["live"]);
        assert_eq!(page.next_token(), None);
    }
}
